pub mod config;
pub mod events;
pub mod probe;
pub mod runtime;
pub mod scheduler;
pub mod storage;
pub mod timeline;
pub mod util;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of one probe target: `(provider, service, channel, model)`.
///
/// `channel` and `model` may be empty. All persisted tables are keyed by this
/// 4-tuple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorKey {
    pub provider: String,
    pub service: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub model: String,
}

impl MonitorKey {
    pub fn new(
        provider: impl Into<String>,
        service: impl Into<String>,
        channel: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            service: service.into(),
            channel: channel.into(),
            model: model.into(),
        }
    }

    /// Key of the channel group this monitor belongs to (model stripped).
    pub fn channel_key(&self) -> MonitorKey {
        MonitorKey {
            provider: self.provider.clone(),
            service: self.service.clone(),
            channel: self.channel.clone(),
            model: String::new(),
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.service)?;
        if !self.channel.is_empty() {
            write!(f, "/{}", self.channel)?;
        }
        if !self.model.is_empty() {
            write!(f, "/{}", self.model)?;
        }
        Ok(())
    }
}

/// Health colour of a single probe outcome.
///
/// Persisted as an integer; the timeline-only "missing" value (-1) is derived
/// and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeStatus {
    Red,
    Green,
    Yellow,
}

impl ProbeStatus {
    pub fn code(self) -> i64 {
        match self {
            ProbeStatus::Red => 0,
            ProbeStatus::Green => 1,
            ProbeStatus::Yellow => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ProbeStatus::Red),
            1 => Some(ProbeStatus::Green),
            2 => Some(ProbeStatus::Yellow),
            _ => None,
        }
    }

    /// Green and yellow both count as "available" for event purposes.
    pub fn is_available(self) -> bool {
        matches!(self, ProbeStatus::Green | ProbeStatus::Yellow)
    }
}

impl Serialize for ProbeStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for ProbeStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        ProbeStatus::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid probe status {code}")))
    }
}

/// Refinement of the probe colour. This set is closed: it is shared with the
/// read API, event metadata and the frontend, so extending it is a
/// wire-format change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SubStatus {
    #[default]
    None,
    NetworkError,
    SlowLatency,
    ContentMismatch,
    RateLimit,
    InvalidRequest,
    AuthError,
    ClientError,
    ServerError,
    ResponseTooLarge,
}

impl SubStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubStatus::None => "",
            SubStatus::NetworkError => "network_error",
            SubStatus::SlowLatency => "slow_latency",
            SubStatus::ContentMismatch => "content_mismatch",
            SubStatus::RateLimit => "rate_limit",
            SubStatus::InvalidRequest => "invalid_request",
            SubStatus::AuthError => "auth_error",
            SubStatus::ClientError => "client_error",
            SubStatus::ServerError => "server_error",
            SubStatus::ResponseTooLarge => "response_too_large",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" => Some(SubStatus::None),
            "network_error" => Some(SubStatus::NetworkError),
            "slow_latency" => Some(SubStatus::SlowLatency),
            "content_mismatch" => Some(SubStatus::ContentMismatch),
            "rate_limit" => Some(SubStatus::RateLimit),
            "invalid_request" => Some(SubStatus::InvalidRequest),
            "auth_error" => Some(SubStatus::AuthError),
            "client_error" => Some(SubStatus::ClientError),
            "server_error" => Some(SubStatus::ServerError),
            "response_too_large" => Some(SubStatus::ResponseTooLarge),
            _ => None,
        }
    }

    /// Sub-statuses whose HTTP codes are tallied in the timeline
    /// `http_code_breakdown`. Both aggregation paths (application-side and
    /// DB-side) filter through this exact set.
    pub const HTTP_CODE_BREAKDOWN: [SubStatus; 7] = [
        SubStatus::ContentMismatch,
        SubStatus::RateLimit,
        SubStatus::InvalidRequest,
        SubStatus::AuthError,
        SubStatus::ClientError,
        SubStatus::ServerError,
        SubStatus::ResponseTooLarge,
    ];

    pub fn in_http_code_breakdown(self) -> bool {
        Self::HTTP_CODE_BREAKDOWN.contains(&self)
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SubStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SubStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        SubStatus::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown sub status {s:?}")))
    }
}

/// One persisted probe outcome. Append-only: written exactly once by a
/// scheduler worker, then only ever read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    /// Assigned by the store on insert.
    pub id: i64,
    #[serde(flatten)]
    pub key: MonitorKey,
    pub status: ProbeStatus,
    pub sub_status: SubStatus,
    /// 0 iff no HTTP response line was received.
    pub http_code: u16,
    pub latency_ms: i64,
    /// Unix seconds.
    pub timestamp: i64,
}

/// Persisted per-monitor hysteresis state.
///
/// `stable_available = -1` means uninitialised; the first observation is
/// adopted without emitting an event. `last_record_id` is monotonically
/// non-decreasing per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceState {
    #[serde(flatten)]
    pub key: MonitorKey,
    pub stable_available: i64,
    pub streak_count: i64,
    pub streak_status: i64,
    pub last_record_id: i64,
    pub last_timestamp: i64,
}

impl ServiceState {
    pub fn uninitialised(key: MonitorKey) -> Self {
        Self {
            key,
            stable_available: -1,
            streak_count: 0,
            streak_status: 0,
            last_record_id: 0,
            last_timestamp: 0,
        }
    }
}

/// Persisted per-channel aggregate state (channel event mode only).
///
/// `down_count` is the streak of consecutive observations opposing
/// `stable_available`; `known_count` is how many models had a latest record
/// at the last observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub provider: String,
    pub service: String,
    pub channel: String,
    pub stable_available: i64,
    pub down_count: i64,
    pub known_count: i64,
    pub last_record_id: i64,
    pub last_timestamp: i64,
}

impl ChannelState {
    pub fn uninitialised(provider: String, service: String, channel: String) -> Self {
        Self {
            provider,
            service,
            channel,
            stable_available: -1,
            down_count: 0,
            known_count: 0,
            last_record_id: 0,
            last_timestamp: 0,
        }
    }
}

/// Direction of an edge-triggered availability event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Down,
    Up,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Down => "DOWN",
            EventType::Up => "UP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "DOWN" => Some(EventType::Down),
            "UP" => Some(EventType::Up),
            _ => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventType::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event type {s:?}")))
    }
}

/// Append-only availability edge.
///
/// `(provider, service, channel, event_type, trigger_record_id)` is unique;
/// a conflicting insert is a silent no-op, which makes event emission
/// idempotent when the state update is retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: i64,
    #[serde(flatten)]
    pub key: MonitorKey,
    pub event_type: EventType,
    pub from_status: i64,
    pub to_status: i64,
    pub trigger_record_id: i64,
    pub observed_at: i64,
    pub created_at: i64,
    pub meta: serde_json::Value,
}
