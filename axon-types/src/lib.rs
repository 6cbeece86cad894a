//! Wire types shared between the coordinator and agent processes.
//!
//! Everything that crosses a process boundary lives here:
//! - The [`Envelope`] message format and its [`codec`]
//! - Capability advertisement and task payloads
//! - The subtask decomposition schema produced by the external reasoner
//!
//! Serializable with serde for JSON over any transport. The same codec is
//! used by every transport so a message published through one can be
//! consumed through another after a failover.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current wire format version. Decoders accept this version and older.
pub const WIRE_VERSION: u32 = 1;

/// Recipient id that addresses every reachable peer.
pub const BROADCAST: &str = "*";

// ============================================================================
// Envelope
// ============================================================================

/// The unit of communication between processes.
///
/// `correlation_id` is immutable once set: it equals the `message_id` of the
/// originating request and is the only key used to match a result back to
/// its waiter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Wire format version, bumped on incompatible changes
    pub version: u32,

    /// Unique message identifier (ULID), generated at send time
    pub message_id: String,

    /// Shared by a request and its eventual response
    pub correlation_id: String,

    /// Originating peer id
    pub sender_id: String,

    /// Destination peer id, or [`BROADCAST`]
    pub recipient_id: String,

    /// Kind of message, drives routing on the receiving side
    pub message_type: MessageType,

    /// Hierarchical routing topic (e.g. "tasks.request")
    pub topic: String,

    /// Delivery guarantee requested by the sender
    pub qos: QosLevel,

    /// Seconds after `sent_at` at which the message may be discarded
    pub ttl_seconds: u64,

    /// Number of resends so far; incremented by the delivery engine
    pub retry_count: u32,

    /// When the envelope was handed to a transport
    pub sent_at: DateTime<Utc>,

    /// Opaque to the messaging layer
    pub payload: serde_json::Value,

    /// Fields added by future wire versions survive a decode/encode
    /// round trip here instead of being dropped.
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Result,
    Ack,
    Advertisement,
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Request => write!(f, "request"),
            MessageType::Result => write!(f, "result"),
            MessageType::Ack => write!(f, "ack"),
            MessageType::Advertisement => write!(f, "advertisement"),
            MessageType::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
}

impl Envelope {
    /// Default TTL applied by the constructors.
    pub const DEFAULT_TTL_SECONDS: u64 = 300;

    /// Create an envelope with a fresh ULID message id. The correlation id
    /// starts equal to the message id, as for an originating request.
    pub fn new(
        message_type: MessageType,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let message_id = ulid::Ulid::new().to_string();
        Self {
            version: WIRE_VERSION,
            correlation_id: message_id.clone(),
            message_id,
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type,
            topic: topic.into(),
            qos: QosLevel::AtMostOnce,
            ttl_seconds: Self::DEFAULT_TTL_SECONDS,
            retry_count: 0,
            sent_at: Utc::now(),
            payload,
            extensions: serde_json::Map::new(),
        }
    }

    /// A task request, delivered at-least-once by default.
    pub fn request(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(
            MessageType::Request,
            sender_id,
            recipient_id,
            topic::TASK_REQUEST,
            payload,
        )
        .with_qos(QosLevel::AtLeastOnce)
    }

    /// A result envelope correlated to `request`.
    pub fn result_for(
        request: &Envelope,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut env = Self::new(
            MessageType::Result,
            sender_id,
            request.sender_id.clone(),
            topic::TASK_RESULT,
            payload,
        );
        env.correlation_id = request.correlation_id.clone();
        env
    }

    /// An error envelope correlated to `request`.
    pub fn error_for(
        request: &Envelope,
        sender_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let mut env = Self::result_for(request, sender_id, payload);
        env.message_type = MessageType::Error;
        env
    }

    /// An acknowledgement for `acked`. The correlation id is the acked
    /// envelope's `message_id`, which for an originating request equals its
    /// correlation id.
    pub fn ack_for(acked: &Envelope, sender_id: impl Into<String>) -> Self {
        let mut env = Self::new(
            MessageType::Ack,
            sender_id,
            acked.sender_id.clone(),
            topic::ACK,
            serde_json::Value::Null,
        );
        env.correlation_id = acked.message_id.clone();
        env
    }

    /// A broadcast capability advertisement.
    pub fn advertisement(
        sender_id: impl Into<String>,
        ad: &CapabilityAdvertisement,
    ) -> Result<Self, EncodeError> {
        Ok(Self::new(
            MessageType::Advertisement,
            sender_id,
            BROADCAST,
            topic::ADVERTISE,
            serde_json::to_value(ad)?,
        ))
    }

    /// A best-effort cancellation notice for an in-flight correlation.
    pub fn cancellation(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        let correlation_id: String = correlation_id.into();
        let mut env = Self::new(
            MessageType::Request,
            sender_id,
            recipient_id,
            topic::CANCEL,
            serde_json::json!({ "correlation_id": correlation_id }),
        );
        // Cancellations are advisory; never retried.
        env.qos = QosLevel::AtMostOnce;
        env
    }

    pub fn with_qos(mut self, qos: QosLevel) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST
    }

    /// True once the TTL has lapsed relative to `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.sent_at);
        age.num_seconds() >= 0 && age.num_seconds() as u64 > self.ttl_seconds
    }
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported wire version {found} (this build speaks up to {max})")]
    Version { found: u32, max: u32 },
}

/// Deterministic byte form of an [`Envelope`], shared by every transport.
///
/// Single-line JSON: line-framed transports carry it verbatim, the mailbox
/// stores it as a file, the broker wraps it in a frame. Unknown fields from
/// newer senders are preserved through the `extensions` map.
pub mod codec {
    use super::{DecodeError, EncodeError, Envelope, WIRE_VERSION};

    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(envelope)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        if envelope.version > WIRE_VERSION {
            return Err(DecodeError::Version {
                found: envelope.version,
                max: WIRE_VERSION,
            });
        }
        Ok(envelope)
    }
}

// ============================================================================
// Capability advertisements
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Online,
    Draining,
    Offline,
}

/// Broadcast by an agent to announce a capability it can perform.
///
/// Re-publishing the same `(agent_id, capability_id)` pair acts as a TTL
/// heartbeat; an advertisement with no renewal within `ttl_seconds` is
/// evicted from the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityAdvertisement {
    pub capability_id: String,
    pub agent_id: String,
    pub name: String,
    pub version: String,
    pub availability_status: AvailabilityStatus,
    pub advertised_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl CapabilityAdvertisement {
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        ttl_seconds: u64,
    ) -> Self {
        let agent_id = agent_id.into();
        let name = name.into();
        let version = version.into();
        Self {
            capability_id: format!("{agent_id}/{name}@{version}"),
            agent_id,
            name,
            version,
            availability_status: AvailabilityStatus::Online,
            advertised_at: Utc::now(),
            ttl_seconds,
        }
    }

    pub fn is_online(&self) -> bool {
        self.availability_status == AvailabilityStatus::Online
    }
}

// ============================================================================
// Task payloads
// ============================================================================

/// Payload of a `tasks.request` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub request_id: String,
    pub requester_id: String,
    pub capability_id: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub description: String,
    /// Topic the requester listens on for the correlated result.
    pub callback_topic: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failure,
}

/// Payload of a `tasks.result` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub error: Option<ErrorDetail>,
}

impl TaskResult {
    pub fn success(payload: serde_json::Value) -> Self {
        Self {
            status: TaskStatus::Success,
            payload,
            error: None,
        }
    }

    pub fn failure(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            payload: serde_json::Value::Null,
            error: Some(ErrorDetail {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

/// Payload of a `control.cancel` envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelRequest {
    pub correlation_id: String,
}

// ============================================================================
// Subtask decomposition schema
// ============================================================================

/// One entry of the ordered subtask list produced by the external reasoner.
///
/// Any string value in `task_parameters` of the form `<output_of_task_N>`
/// is a dependency placeholder referencing subtask `N`'s output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubtaskSpec {
    pub capability_needed: String,
    #[serde(default)]
    pub task_parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub task_description: String,
}

// ============================================================================
// Topics
// ============================================================================

pub mod topic {
    pub const TASK_REQUEST: &str = "tasks.request";
    pub const TASK_RESULT: &str = "tasks.result";
    pub const ADVERTISE: &str = "capabilities.advertise";
    pub const ACK: &str = "control.ack";
    pub const CANCEL: &str = "control.cancel";
    pub const PROBE: &str = "control.probe";
}

// ============================================================================
// Tests
// ============================================================================
