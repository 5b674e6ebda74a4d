//! Shared types for the forwarding pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Delivery status ─────────────────────────────────────────────────

/// Lifecycle state of a forwarding record.
///
/// Every record starts `Pending` and is moved exactly once, by the forward
/// stage, to one of the three terminal states. There is no transition back
/// to `Pending` and no transition between terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created by the intake stage; no forward attempt has concluded yet.
    Pending,
    /// Backend accepted the forward for all recipients.
    Success,
    /// Backend accepted the forward for some recipients only.
    PartialSuccess,
    /// Backend rejected the forward, or the call itself failed.
    Failure,
}

impl DeliveryStatus {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failure => "failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether a record in this state counts as fulfilled.
    ///
    /// Failure and Pending are unfulfilled; both success shades are fulfilled.
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }
}

// ── Forwarding record ───────────────────────────────────────────────

/// Audit-trail row for one message that matched at least one rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingRecord {
    pub id: Uuid,
    /// Originating address of the message.
    pub address: String,
    /// Message body as received.
    pub body: String,
    pub status: DeliveryStatus,
    /// Redundant with `status` (kept for listing convenience): true iff the
    /// record reached Success or PartialSuccess.
    pub is_fulfilled: bool,
    /// Human-readable outcome detail from the backend, or the transport
    /// error message. Empty while pending.
    pub result_description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Relay settings ──────────────────────────────────────────────────

/// User-supplied backend settings. Both fields stay `None` until configured;
/// the forward stage refuses to run without them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Endpoint the forward request is POSTed to.
    pub bot_url: Option<String>,
    /// Credential identifying this relay to the backend.
    pub sender_key: Option<String>,
}

// ── Job payloads ────────────────────────────────────────────────────

/// Payload of an `intake` job: one received message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeJob {
    pub address: String,
    pub body: String,
}

/// Payload of a `forward` job: the durable handoff from intake.
///
/// Carries only the record id plus the matched type keys, never the message
/// itself — the forward stage re-reads the record from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardJob {
    pub record_id: Uuid,
    /// Distinct type keys of the matched rules, intake order preserved.
    /// Only the first is submitted to the backend.
    pub type_keys: Vec<String>,
}
