//! Telemetry sink - storage abstraction the protocol core writes to
//!
//! Connection tasks call the sink concurrently; implementations do their own
//! locking. Sink failures never propagate into the protocol: callers log
//! them and carry on.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use thiserror::Error;

use crate::protocol::DeviceState;

/// Log event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Information,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Information => "Information",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
        }
    }
}

/// Event type strings recorded with connection log entries
pub mod events {
    pub const CONNECTION_ATTEMPT: &str = "Connection_Attempt";
    pub const CONNECTION_CLOSED: &str = "Connection_Closed";
    pub const CONNECTION_ERROR: &str = "Connection_Error";
    pub const CONNECTION_TIMEOUT: &str = "Connection_Timeout";
    pub const INVALID_FRAME: &str = "Invalid_Frame";
    pub const AUTH_CHALLENGE_SENT: &str = "Auth_Challenge_Sent";
    pub const AUTH_SUCCESS: &str = "Auth_Success";
    pub const AUTH_FAILED: &str = "Auth_Failed";
    pub const UNAUTHENTICATED_MESSAGE: &str = "Unauthenticated_Message";
    pub const HEARTBEAT_RESPONSE: &str = "Heartbeat_Response";
    pub const CONTROL_COMMAND: &str = "Control_Command";
    pub const ACK_ERROR: &str = "Ack_Error";
    pub const RESET_BLADE_TIME: &str = "Reset_Blade_Time";
    pub const STATUS_UPDATE: &str = "Status_Update";
    pub const POSITION_UPDATE: &str = "Position_Update";
    pub const UNKNOWN_MESSAGE_TYPE: &str = "Unknown_Message_Type";
    pub const UNKNOWN_COMMAND: &str = "Unknown_Command";
    pub const UNKNOWN_NOTIFICATION: &str = "Unknown_Notification";
    pub const LISTENER_BIND_ERROR: &str = "Listener_Bind_Error";
}

#[derive(Debug, Error)]
#[error("telemetry sink failure: {0}")]
pub struct SinkError(pub String);

/// Current Unix time in seconds.
pub fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Storage abstraction for device telemetry and connection events.
///
/// `record_blade_reset` is optional for implementations; the default body
/// drops the event.
pub trait TelemetrySink: Send + Sync {
    fn record_battery(&self, device_id: &str, percent: f32, ts: u64) -> Result<(), SinkError>;

    fn record_position(
        &self,
        device_id: &str,
        latitude: f32,
        longitude: f32,
        ts: u64,
    ) -> Result<(), SinkError>;

    fn record_state(&self, device_id: &str, state: DeviceState, ts: u64) -> Result<(), SinkError>;

    fn record_log(
        &self,
        device_id: &str,
        severity: Severity,
        event_type: &str,
        message: &str,
        ts: u64,
    ) -> Result<(), SinkError>;

    fn record_blade_reset(&self, _device_id: &str, _ts: u64) -> Result<(), SinkError> {
        Ok(())
    }

    /// Latest persisted state, used by the action façade's pre-condition
    /// check.
    fn latest_state(&self, device_id: &str) -> Option<DeviceState>;
}

/// A recorded connection log entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub ts: u64,
    pub severity: Severity,
    pub event_type: String,
    pub message: String,
}

/// Per-device histories are capped; the oldest entries are dropped first.
const HISTORY_CAP: usize = 4096;

#[derive(Debug, Default)]
struct DeviceRecord {
    battery: Vec<(u64, f32)>,
    positions: Vec<(u64, f32, f32)>,
    states: Vec<(u64, DeviceState)>,
    logs: Vec<LogEntry>,
    blade_resets: Vec<u64>,
}

fn push_capped<T>(v: &mut Vec<T>, item: T) {
    if v.len() >= HISTORY_CAP {
        v.remove(0);
    }
    v.push(item);
}

/// Thread-safe in-memory telemetry store.
///
/// Backs the action façade's state reads and keeps bounded per-device
/// histories for the operator surface to query.
#[derive(Default)]
pub struct InMemoryTelemetry {
    inner: RwLock<HashMap<String, DeviceRecord>>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a device state, e.g. when restoring from persistent storage.
    pub fn seed_state(&self, device_id: &str, state: DeviceState, ts: u64) {
        let mut inner = self.inner.write();
        let rec = inner.entry(device_id.to_string()).or_default();
        push_capped(&mut rec.states, (ts, state));
    }

    pub fn latest_battery(&self, device_id: &str) -> Option<(u64, f32)> {
        let inner = self.inner.read();
        inner.get(device_id)?.battery.last().copied()
    }

    pub fn latest_position(&self, device_id: &str) -> Option<(u64, f32, f32)> {
        let inner = self.inner.read();
        inner.get(device_id)?.positions.last().copied()
    }

    pub fn logs(&self, device_id: &str) -> Vec<LogEntry> {
        let inner = self.inner.read();
        inner
            .get(device_id)
            .map(|r| r.logs.clone())
            .unwrap_or_default()
    }

    pub fn blade_resets(&self, device_id: &str) -> usize {
        let inner = self.inner.read();
        inner.get(device_id).map(|r| r.blade_resets.len()).unwrap_or(0)
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn record_battery(&self, device_id: &str, percent: f32, ts: u64) -> Result<(), SinkError> {
        let mut inner = self.inner.write();
        let rec = inner.entry(device_id.to_string()).or_default();
        push_capped(&mut rec.battery, (ts, percent));
        Ok(())
    }

    fn record_position(
        &self,
        device_id: &str,
        latitude: f32,
        longitude: f32,
        ts: u64,
    ) -> Result<(), SinkError> {
        let mut inner = self.inner.write();
        let rec = inner.entry(device_id.to_string()).or_default();
        push_capped(&mut rec.positions, (ts, latitude, longitude));
        Ok(())
    }

    fn record_state(&self, device_id: &str, state: DeviceState, ts: u64) -> Result<(), SinkError> {
        let mut inner = self.inner.write();
        let rec = inner.entry(device_id.to_string()).or_default();
        push_capped(&mut rec.states, (ts, state));
        Ok(())
    }

    fn record_log(
        &self,
        device_id: &str,
        severity: Severity,
        event_type: &str,
        message: &str,
        ts: u64,
    ) -> Result<(), SinkError> {
        let mut inner = self.inner.write();
        let rec = inner.entry(device_id.to_string()).or_default();
        push_capped(
            &mut rec.logs,
            LogEntry {
                ts,
                severity,
                event_type: event_type.to_string(),
                message: message.to_string(),
            },
        );
        Ok(())
    }

    fn record_blade_reset(&self, device_id: &str, ts: u64) -> Result<(), SinkError> {
        let mut inner = self.inner.write();
        let rec = inner.entry(device_id.to_string()).or_default();
        push_capped(&mut rec.blade_resets, ts);
        Ok(())
    }

    fn latest_state(&self, device_id: &str) -> Option<DeviceState> {
        let inner = self.inner.read();
        inner.get(device_id)?.states.last().map(|&(_, s)| s)
    }
}
