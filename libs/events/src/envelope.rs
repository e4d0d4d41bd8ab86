//! Channel naming and the validated signal envelope.

use chrono::{DateTime, Utc};
use fleetd_id::SystemId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{EventError, SignalKind};

/// A signal channel address: `{kind}:{system_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName {
    pub kind: SignalKind,
    pub system_id: SystemId,
}

impl ChannelName {
    pub fn new(kind: SignalKind, system_id: &SystemId) -> Self {
        Self {
            kind,
            system_id: system_id.clone(),
        }
    }

    /// Parses `{kind}:{system_id}`.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        let invalid = |reason: String| EventError::InvalidChannel {
            channel: s.to_string(),
            reason,
        };

        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| invalid("missing ':' separator".to_string()))?;

        let kind = kind.parse::<SignalKind>()?;
        let system_id = SystemId::parse(id).map_err(|e| invalid(e.to_string()))?;

        Ok(Self { kind, system_id })
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.system_id)
    }
}

impl std::str::FromStr for ChannelName {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An externally produced signal, validated against its channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    /// Channel the signal is addressed to.
    pub channel: String,

    /// When the agent accepted the signal.
    pub received_at: DateTime<Utc>,

    /// Kind-specific payload.
    pub payload: serde_json::Value,
}

impl SignalEnvelope {
    /// Validates `payload` for delivery on `channel`.
    ///
    /// The payload must decode as the channel kind's payload type and must
    /// name the same machine as the channel.
    pub fn validate(channel: &str, payload: serde_json::Value) -> Result<Self, EventError> {
        let name = ChannelName::parse(channel)?;
        let payload_id = name.kind.decode_system_id(&payload)?;

        if payload_id != name.system_id {
            return Err(EventError::MachineMismatch {
                channel: name.system_id.to_string(),
                payload: payload_id.to_string(),
            });
        }

        Ok(Self {
            channel: name.to_string(),
            received_at: Utc::now(),
            payload,
        })
    }

    /// Decodes the payload into a typed signal.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        serde_json::from_value(self.payload.clone()).map_err(Into::into)
    }
}

// =============================================================================
// Tests
// =============================================================================
