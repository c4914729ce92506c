//! Lifecycle notifications for operational visibility and dead-letter capture.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::{Client, ConnectOptions, HeaderMap};
use bytes::Bytes;
use parking_lot::Mutex;
use pointgate_ledger::AccumulationRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::downstream::AccumulationRequest;

pub const EVENT_SUBJECT: &str = "pointAccumulation";
pub const DATA_VERSION: &str = "1.0";
pub const METADATA_VERSION: &str = "1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    CircuitBreakerOpened,
    CircuitBreakerError,
    RetryExhausted,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CircuitBreakerOpened => "CircuitBreakerOpened",
            Self::CircuitBreakerError => "CircuitBreakerError",
            Self::RetryExhausted => "RetryExhausted",
        }
    }
}

impl Display for EventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Correlated request fields. Values are carried as strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub member_id: String,
    pub partner_id: String,
    pub partner_type: String,
    pub amount: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub id: String,
    pub subject: String,
    pub event_type: EventType,
    pub data: EventData,
    #[serde(with = "time::serde::rfc3339")]
    pub event_time: OffsetDateTime,
    pub data_version: String,
    pub metadata_version: String,
}

impl LifecycleEvent {
    pub fn new(event_type: EventType, request: &AccumulationRequest) -> Self {
        Self::with_data(
            event_type,
            EventData {
                member_id: request.member_id.clone(),
                partner_id: request.partner_id.clone(),
                partner_type: request.partner_class.to_string(),
                amount: request.amount.to_string(),
            },
        )
    }

    pub fn for_record(event_type: EventType, record: &AccumulationRecord) -> Self {
        Self::with_data(
            event_type,
            EventData {
                member_id: record.member_id.clone(),
                partner_id: record.partner_id.clone(),
                partner_type: record.partner_class.to_string(),
                amount: record.amount.to_string(),
            },
        )
    }

    fn with_data(event_type: EventType, data: EventData) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject: String::from(EVENT_SUBJECT),
            event_type,
            data,
            event_time: OffsetDateTime::now_utc(),
            data_version: String::from(DATA_VERSION),
            metadata_version: String::from(METADATA_VERSION),
        }
    }
}

#[derive(Debug, Error)]
pub enum EventPublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to connect to event bus: {0}")]
    Connect(String),
    #[error("failed to publish event: {0}")]
    Publish(String),
}

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EventPublishError>> + Send + 'a>>;

/// Outbound lifecycle event sink.
pub trait EventPublisher: Send + Sync {
    fn publish<'a>(&'a self, event: &'a LifecycleEvent) -> PublishFuture<'a>;
}

/// Publishes events as JSON to a NATS subject.
#[derive(Clone)]
pub struct NatsEventPublisher {
    client: Client,
    subject: String,
}

impl NatsEventPublisher {
    pub async fn connect(url: &str, subject: impl Into<String>) -> Result<Self, EventPublishError> {
        info!(nats_url = url, "connecting event publisher");
        let client = ConnectOptions::new()
            .name("pointgate")
            .connection_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|error| EventPublishError::Connect(error.to_string()))?;

        Ok(Self::with_client(client, subject))
    }

    pub fn with_client(client: Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl EventPublisher for NatsEventPublisher {
    fn publish<'a>(&'a self, event: &'a LifecycleEvent) -> PublishFuture<'a> {
        Box::pin(async move {
            let payload = Bytes::from(serde_json::to_vec(event)?);

            // Lets JetStream consumers drop redeliveries of the same event.
            let mut headers = HeaderMap::new();
            headers.insert("Nats-Msg-Id", event.id.as_str());
            headers.insert("Pointgate-Event-Type", event.event_type.as_str());

            self.client
                .publish_with_headers(self.subject.clone(), headers, payload)
                .await
                .map_err(|error| EventPublishError::Publish(error.to_string()))?;
            self.client
                .flush()
                .await
                .map_err(|error| EventPublishError::Publish(error.to_string()))
        })
    }
}

/// Writes events to the log when no bus is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventPublisher;

impl EventPublisher for LoggingEventPublisher {
    fn publish<'a>(&'a self, event: &'a LifecycleEvent) -> PublishFuture<'a> {
        Box::pin(async move {
            let payload = serde_json::to_string(event)?;
            info!(
                event_type = %event.event_type,
                event_id = %event.id,
                payload = %payload,
                "lifecycle event"
            );
            Ok(())
        })
    }
}

/// Keeps published events in memory. Can be switched to fail every publish.
#[derive(Debug, Default)]
pub struct RecordingEventPublisher {
    events: Mutex<Vec<LifecycleEvent>>,
    failing: AtomicBool,
}

impl RecordingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let publisher = Self::default();
        publisher.set_failing(true);
        publisher
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().clone()
    }

    pub fn count_of(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .count()
    }
}

impl EventPublisher for RecordingEventPublisher {
    fn publish<'a>(&'a self, event: &'a LifecycleEvent) -> PublishFuture<'a> {
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(EventPublishError::Publish(String::from(
                    "event bus unavailable",
                )));
            }
            self.events.lock().push(event.clone());
            Ok(())
        })
    }
}
