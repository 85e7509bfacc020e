//! Tracking-device wire protocol
//!
//! Binary, little-endian, versioned. Each message is a u16 id followed by a
//! fixed-layout body; there is no outer length prefix. The protocol only
//! ever grows by appending: a CONNECT_REPLY written for a newer version is a
//! byte-prefix of the same reply written for an older one, which is what
//! lets both ends negotiate down without a format switch.
//!
//! CONNECT_REPLY tail sections by minimum negotiated version:
//!
//! | Min version | Section                          |
//! |-------------|----------------------------------|
//! | 2           | virtual-device descriptors       |
//! | 4           | HMD display configurations       |
//! | 5           | per-device battery states        |
//! | 6           | power/haptic feature counts      |
//!
//! The same minimums gate the pushed updates: BATTERYSTATE_UPDATE is only
//! sent to clients at version 5 or later, HMDCONFIG_UPDATE at 4 or later,
//! and POWEROFF/HAPTICTICK requests are only meaningful from version 6.

pub mod messages;
pub mod wire;

use crate::error::Error;

/// Highest protocol version this server speaks
pub const PROTOCOL_VERSION: u32 = 6;

pub const MIN_VERSION_DEVICE_LIST: u32 = 2;
pub const MIN_VERSION_HMD_CONFIGURATION: u32 = 4;
pub const MIN_VERSION_BATTERY_STATE: u32 = 5;
pub const MIN_VERSION_DEVICE_FEATURES: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageId {
    ConnectRequest = 0,
    ConnectReply = 1,
    ActivateRequest = 2,
    DeactivateRequest = 3,
    DisconnectRequest = 4,
    PacketRequest = 5,
    PacketReply = 6,
    StartStreamRequest = 7,
    StopStreamRequest = 8,
    StopStreamReply = 9,
    PowerOffRequest = 10,
    HapticTickRequest = 11,
    BatteryStateUpdate = 12,
    HmdConfigUpdate = 13,
}

impl MessageId {
    /// Body size of a client-to-server message, or `None` for ids only the
    /// server may send. Bodies are fixed-size, so this is all the framing a
    /// receiver needs.
    pub fn request_body_len(self) -> Option<usize> {
        match self {
            MessageId::ConnectRequest => Some(4),
            MessageId::ActivateRequest
            | MessageId::DeactivateRequest
            | MessageId::DisconnectRequest
            | MessageId::PacketRequest
            | MessageId::StartStreamRequest
            | MessageId::StopStreamRequest => Some(0),
            MessageId::PowerOffRequest => Some(2),
            MessageId::HapticTickRequest => Some(4),
            MessageId::ConnectReply
            | MessageId::PacketReply
            | MessageId::StopStreamReply
            | MessageId::BatteryStateUpdate
            | MessageId::HmdConfigUpdate => None,
        }
    }
}

impl TryFrom<u16> for MessageId {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self, Error> {
        match raw {
            0 => Ok(MessageId::ConnectRequest),
            1 => Ok(MessageId::ConnectReply),
            2 => Ok(MessageId::ActivateRequest),
            3 => Ok(MessageId::DeactivateRequest),
            4 => Ok(MessageId::DisconnectRequest),
            5 => Ok(MessageId::PacketRequest),
            6 => Ok(MessageId::PacketReply),
            7 => Ok(MessageId::StartStreamRequest),
            8 => Ok(MessageId::StopStreamRequest),
            9 => Ok(MessageId::StopStreamReply),
            10 => Ok(MessageId::PowerOffRequest),
            11 => Ok(MessageId::HapticTickRequest),
            12 => Ok(MessageId::BatteryStateUpdate),
            13 => Ok(MessageId::HmdConfigUpdate),
            other => Err(Error::UnknownMessage(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_round_trip() {
        for raw in 0u16..=13 {
            let id = MessageId::try_from(raw).unwrap();
            assert_eq!(id as u16, raw);
        }
        assert!(MessageId::try_from(14).is_err());
        assert!(MessageId::try_from(0xffff).is_err());
    }

    #[test]
    fn test_server_sent_ids_have_no_request_body() {
        assert_eq!(MessageId::ConnectReply.request_body_len(), None);
        assert_eq!(MessageId::PacketReply.request_body_len(), None);
        assert_eq!(MessageId::BatteryStateUpdate.request_body_len(), None);
        assert_eq!(MessageId::ConnectRequest.request_body_len(), Some(4));
        assert_eq!(MessageId::HapticTickRequest.request_body_len(), Some(4));
    }
}
