//! Protocol module - wire constants, message types and state codes

pub mod codec;
pub mod frame;
pub mod handshake;

pub use codec::{
    pack_application, pack_presentation, pack_session, unpack_application, unpack_presentation,
    unpack_session, CodecError, SessionMessage,
};
pub use frame::{FrameError, SOF};

/// Sentinel session HMAC that disables authentication checks (testing backdoor).
/// Devices in the factory test rig send this value before they are provisioned
/// with a pre-shared key.
pub const BYPASS_HMAC: u32 = 0xFADE_DBED;

/// Session-layer message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Regular = 0x00,
    Hello = 0x01,
    Challenge = 0x02,
    ClientAuth = 0x03,
    Notification = 0x80,
}

impl MessageType {
    pub fn from_byte(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(MessageType::Regular),
            0x01 => Some(MessageType::Hello),
            0x02 => Some(MessageType::Challenge),
            0x03 => Some(MessageType::ClientAuth),
            0x80 => Some(MessageType::Notification),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Application-layer command codes (requests)
pub mod commands {
    pub const HEARTBEAT: u8 = 0x00;
    pub const CONTROL_DEVICE: u8 = 0x01;
    pub const ACK_ERROR: u8 = 0x02;
    pub const RESET_BLADE_TIME: u8 = 0x03;

    /// Responses set the high bit of the request command.
    pub const RESPONSE_FLAG: u8 = 0x80;
    /// Error response command; body is a UTF-8 message.
    pub const ERROR_RESPONSE: u8 = 0xFF;
}

/// Notification sub-types (first body byte of a NOTIFICATION message)
pub mod notifications {
    pub const DEVICE_STATUS: u8 = 0x00;
    pub const POSITION_UPDATE: u8 = 0x01;
}

/// Canonical device states and their wire codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    StationCharging,
    StationChargingCompleted,
    Mowing,
    ReturningToStation,
    Paused,
    Error,
}

impl DeviceState {
    pub fn from_code(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(DeviceState::StationCharging),
            0x01 => Some(DeviceState::StationChargingCompleted),
            0x02 => Some(DeviceState::Mowing),
            0x03 => Some(DeviceState::ReturningToStation),
            0x04 => Some(DeviceState::Paused),
            0x80 => Some(DeviceState::Error),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DeviceState::StationCharging => 0x00,
            DeviceState::StationChargingCompleted => 0x01,
            DeviceState::Mowing => 0x02,
            DeviceState::ReturningToStation => 0x03,
            DeviceState::Paused => 0x04,
            DeviceState::Error => 0x80,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::StationCharging => "StationCharging",
            DeviceState::StationChargingCompleted => "StationChargingCompleted",
            DeviceState::Mowing => "Mowing",
            DeviceState::ReturningToStation => "ReturningToStation",
            DeviceState::Paused => "Paused",
            DeviceState::Error => "Error",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control-device action byte carried in a `CONTROL_DEVICE` body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Stop = 0x00,
    Start = 0x01,
    Home = 0x02,
}

impl ControlAction {
    pub fn from_byte(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(ControlAction::Stop),
            0x01 => Some(ControlAction::Start),
            0x02 => Some(ControlAction::Home),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// State the backend persists once the device confirms the action.
    pub fn resulting_state(self) -> DeviceState {
        match self {
            ControlAction::Stop => DeviceState::Paused,
            ControlAction::Start => DeviceState::Mowing,
            ControlAction::Home => DeviceState::ReturningToStation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for t in [
            MessageType::Regular,
            MessageType::Hello,
            MessageType::Challenge,
            MessageType::ClientAuth,
            MessageType::Notification,
        ] {
            assert_eq!(MessageType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(MessageType::from_byte(0x7F), None);
    }

    #[test]
    fn test_state_code_map() {
        assert_eq!(DeviceState::from_code(0x00), Some(DeviceState::StationCharging));
        assert_eq!(DeviceState::from_code(0x02), Some(DeviceState::Mowing));
        assert_eq!(DeviceState::from_code(0x80), Some(DeviceState::Error));
        assert_eq!(DeviceState::from_code(0x05), None);
        assert_eq!(DeviceState::Paused.code(), 0x04);
    }

    #[test]
    fn test_control_action_states() {
        assert_eq!(
            ControlAction::Stop.resulting_state(),
            DeviceState::Paused
        );
        assert_eq!(
            ControlAction::Start.resulting_state(),
            DeviceState::Mowing
        );
        assert_eq!(
            ControlAction::Home.resulting_state(),
            DeviceState::ReturningToStation
        );
        assert_eq!(ControlAction::from_byte(0x03), None);
    }
}
