//! Gateway operation codes.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Opcodes this client sends or consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched. Receive.
    Dispatch = 0,

    /// Keep-alive beat. Send, or an explicit request from the server.
    Heartbeat = 1,

    /// Start a new session. Send.
    Identify = 2,

    /// Update the client's presence. Send.
    PresenceUpdate = 3,

    /// Resume a previous session. Send.
    Resume = 6,

    /// Server requested a reconnect. Receive.
    Reconnect = 7,

    /// Session has been invalidated. Receive.
    InvalidSession = 9,

    /// Sent after connecting; carries the heartbeat interval. Receive.
    Hello = 10,

    /// Acknowledgment of a heartbeat. Receive.
    HeartbeatAck = 11,

    /// Time-spent analytics event. Send.
    TimeSpent = 41,
}

impl OpCode {
    /// Convert a raw opcode; unknown values are ignored by the receiver.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Dispatch),
            1 => Some(OpCode::Heartbeat),
            2 => Some(OpCode::Identify),
            3 => Some(OpCode::PresenceUpdate),
            6 => Some(OpCode::Resume),
            7 => Some(OpCode::Reconnect),
            9 => Some(OpCode::InvalidSession),
            10 => Some(OpCode::Hello),
            11 => Some(OpCode::HeartbeatAck),
            41 => Some(OpCode::TimeSpent),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_serialization() {
        assert_eq!(serde_json::to_string(&OpCode::Hello).unwrap(), "10");
        let opcode: OpCode = serde_json::from_str("11").unwrap();
        assert_eq!(opcode, OpCode::HeartbeatAck);
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(OpCode::from_u8(4), None);
        assert_eq!(OpCode::from_u8(41), Some(OpCode::TimeSpent));
    }
}
