//! Normative constants defined by §6.

use std::time::Duration;

/// Magic bytes opening both handshake request and response frames.
pub const HANDSHAKE_MAGIC: [u8; 2] = [0x65, 0x6c];

/// The only management opcode BTP defines (handshake request/response).
pub const MANAGEMENT_OPCODE: u8 = 0x6c;

/// Protocol versions this implementation is willing to negotiate.
pub const SUPPORTED_VERSIONS: &[u8] = &[4];

pub const MIN_ATT_MTU: u16 = 23;
pub const MAX_BTP_MTU: u16 = 247;
pub const MAX_WINDOW: u8 = 255;

/// Period of the ack-receive timer (§4.5).
pub const ACK_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Period of the send-ack timer (§4.5); one third of [`ACK_TIMEOUT`].
pub const SEND_ACK_TIMEOUT: Duration = Duration::from_millis(5_000);
