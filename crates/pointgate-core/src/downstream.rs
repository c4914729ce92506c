//! Partner accumulation service transport.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pointgate_ledger::PartnerClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Accumulation call sent to a partner service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulationRequest {
    pub member_id: String,
    pub partner_id: String,
    #[serde(rename = "partnerType")]
    pub partner_class: PartnerClass,
    pub amount: i64,
}

/// Successful accumulation reported by the partner service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccumulationReceipt {
    pub transaction_id: String,
    pub points: i64,
    #[serde(default)]
    pub status: String,
}

/// Transport-level failure of a downstream call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DownstreamError {
    #[error("downstream call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("connection to downstream failed: {message}")]
    Connection { message: String },
    #[error("downstream returned unexpected status {status}: {message}")]
    Server { status: u16, message: String },
    #[error("downstream rejected request with {status}: {message}")]
    Client { status: u16, message: String },
    #[error("undecodable downstream response: {message}")]
    Decode { message: String },
}

impl DownstreamError {
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            400..=499 => Self::Client { status, message },
            // Unfollowed redirects and informational codes are treated like 5xx.
            _ => Self::Server { status, message },
        }
    }

    /// Timeouts, connection failures and 5xx responses may succeed later.
    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Connection { .. } | Self::Server { .. }
        )
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type AccumulateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AccumulationReceipt, DownstreamError>> + Send + 'a>>;

/// Downstream accumulation contract.
pub trait AccumulationClient: Send + Sync {
    /// Logical downstream name, used as the circuit breaker target prefix.
    fn name(&self) -> &str;

    fn accumulate<'a>(&'a self, request: &'a AccumulationRequest) -> AccumulateFuture<'a>;
}

/// Production client posting JSON to `{base_url}/api/points/accumulate`.
#[derive(Debug, Clone)]
pub struct HttpAccumulationClient {
    name: String,
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpAccumulationClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self::with_client(
            name,
            base_url,
            timeout,
            reqwest::Client::builder()
                .user_agent(concat!("pointgate/", env!("CARGO_PKG_VERSION")))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        )
    }

    pub fn with_client(
        name: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            timeout,
            client,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/points/accumulate", self.base_url)
    }

    fn map_transport_error(&self, error: reqwest::Error) -> DownstreamError {
        if error.is_timeout() {
            DownstreamError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if error.is_decode() {
            DownstreamError::Decode {
                message: error.to_string(),
            }
        } else {
            DownstreamError::Connection {
                message: error.to_string(),
            }
        }
    }
}

impl AccumulationClient for HttpAccumulationClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn accumulate<'a>(&'a self, request: &'a AccumulationRequest) -> AccumulateFuture<'a> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.endpoint())
                .timeout(self.timeout)
                .json(request)
                .send()
                .await
                .map_err(|error| self.map_transport_error(error))?;

            let status = response.status();
            let body = response
                .text()
                .await
                .map_err(|error| self.map_transport_error(error))?;

            if !status.is_success() {
                return Err(DownstreamError::from_status(status.as_u16(), body));
            }

            serde_json::from_str::<AccumulationReceipt>(&body).map_err(|error| {
                DownstreamError::Decode {
                    message: error.to_string(),
                }
            })
        })
    }
}

/// Offline client that always succeeds, earning one point per 100 minor units.
#[derive(Debug, Clone)]
pub struct MockAccumulationClient {
    name: String,
}

impl Default for MockAccumulationClient {
    fn default() -> Self {
        Self {
            name: String::from("mock-point-service"),
        }
    }
}

impl AccumulationClient for MockAccumulationClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn accumulate<'a>(&'a self, request: &'a AccumulationRequest) -> AccumulateFuture<'a> {
        Box::pin(async move {
            Ok(AccumulationReceipt {
                transaction_id: Uuid::new_v4().to_string(),
                points: request.amount / 100,
                status: String::from("COMPLETED"),
            })
        })
    }
}

/// A canned downstream reply, optionally delayed.
#[derive(Debug, Clone)]
pub struct ScriptedReply {
    pub delay: Duration,
    pub result: Result<AccumulationReceipt, DownstreamError>,
}

impl ScriptedReply {
    pub fn ok(points: i64) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(AccumulationReceipt {
                transaction_id: Uuid::new_v4().to_string(),
                points,
                status: String::from("COMPLETED"),
            }),
        }
    }

    pub fn err(error: DownstreamError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Deterministic client replaying queued replies, then a fallback, for tests and dry runs.
#[derive(Debug)]
pub struct ScriptedAccumulationClient {
    name: String,
    replies: Mutex<VecDeque<ScriptedReply>>,
    fallback: ScriptedReply,
    calls: AtomicUsize,
    requests: Mutex<Vec<AccumulationRequest>>,
}

impl ScriptedAccumulationClient {
    pub fn new(fallback: ScriptedReply) -> Self {
        Self {
            name: String::from("scripted-point-service"),
            replies: Mutex::new(VecDeque::new()),
            fallback,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies.lock().push_back(reply);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<AccumulationRequest> {
        self.requests.lock().clone()
    }
}

impl AccumulationClient for ScriptedAccumulationClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn accumulate<'a>(&'a self, request: &'a AccumulationRequest) -> AccumulateFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let reply = self
            .replies
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        Box::pin(async move {
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            reply.result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AccumulationRequest {
        AccumulationRequest {
            member_id: String::from("M-1"),
            partner_id: String::from("P-9"),
            partner_class: PartnerClass::Convenience,
            amount: 25_000,
        }
    }

    #[test]
    fn request_serializes_with_partner_type_field() {
        let json = serde_json::to_value(request()).expect("serialize");

        assert_eq!(
            json,
            serde_json::json!({
                "memberId": "M-1",
                "partnerId": "P-9",
                "partnerType": "CONVENIENCE",
                "amount": 25000
            })
        );
    }

    #[test]
    fn status_codes_split_into_retryable_and_terminal() {
        assert!(DownstreamError::from_status(503, "busy").retryable());
        assert!(!DownstreamError::from_status(404, "no member").retryable());
        assert_eq!(DownstreamError::from_status(422, "").status(), Some(422));
        assert!(DownstreamError::from_status(302, "moved").retryable());
        assert!(DownstreamError::from_status(101, "switching").retryable());
        assert!(!DownstreamError::from_status(499, "closed").retryable());
        assert!(DownstreamError::Timeout { timeout_ms: 10 }.retryable());
        assert!(!DownstreamError::Decode {
            message: String::from("eof")
        }
        .retryable());
    }

    #[test]
    fn endpoint_ignores_trailing_slash() {
        let client = HttpAccumulationClient::new(
            "point-service",
            "http://localhost:8081/",
            Duration::from_secs(1),
        );
        assert_eq!(
            client.endpoint(),
            "http://localhost:8081/api/points/accumulate"
        );
    }

    #[tokio::test]
    async fn scripted_client_replays_then_falls_back() {
        let client = ScriptedAccumulationClient::new(ScriptedReply::ok(5));
        client.push(ScriptedReply::err(DownstreamError::Timeout { timeout_ms: 1 }));

        assert!(client.accumulate(&request()).await.is_err());
        let receipt = client.accumulate(&request()).await.expect("fallback");

        assert_eq!(receipt.points, 5);
        assert_eq!(client.calls(), 2);
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn mock_client_earns_one_point_per_hundred() {
        let receipt = MockAccumulationClient::default()
            .accumulate(&request())
            .await
            .expect("mock succeeds");

        assert_eq!(receipt.points, 250);
        assert_eq!(receipt.status, "COMPLETED");
    }
}
