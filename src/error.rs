//! The BTP error taxonomy.
//!
//! Every public entry point returns [`BtpError`]. Callers that need to
//! branch on the failure kind match the wrapped variant rather than
//! string-sniffing a message, which is why these are discriminated enums
//! instead of ad hoc `anyhow!` strings.

use thiserror::Error;

/// Malformed bytes. Fatal to the frame currently being decoded; the
/// engine closes the session whenever one of these escapes the codec.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("bad magic bytes: expected 0x65 0x6c")]
    BadMagic,
    #[error("bad management opcode: expected 0x6c, got 0x{0:x}")]
    BadManagementOpcode(u8),
    #[error("handshake request carries no valid protocol version")]
    NoVersionsPresent,
    #[error("hasAck flag and ackNumber field disagree")]
    AckFlagMismatch,
    #[error("isBegin flag and messageLength field disagree")]
    BeginFlagMismatch,
    #[error("buffer too short: need at least {needed} bytes, got {got}")]
    BufferTooShort { needed: usize, got: usize },
    #[error("buffer too long: expected exactly {expected} bytes, got {got}")]
    BufferTooLong { expected: usize, got: usize },
}

/// A protocol-rule violation by the peer. Always fatal to the session:
/// the transport is disconnected and the error is handed back to the
/// caller that triggered the violating step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BtpProtocolError {
    #[error("no BTP protocol version in common with peer")]
    NoCommonVersion,
    #[error("inbound frame of {len} bytes exceeds fragmentSize+3 ({max})")]
    OversizedFrame { len: usize, max: usize },
    #[error("received a handshake or management frame on the data channel")]
    UnexpectedControlFrame,
    #[error("received an empty frame carrying no ack and no payload")]
    EmptyFrame,
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u8, got: u8 },
    #[error("invalid ack number {ack}: must be in ({prev_ack}, {outgoing_seq}]")]
    InvalidAck {
        ack: u8,
        prev_ack: u8,
        outgoing_seq: u8,
    },
    #[error("begin frame received while a reassembly was already in progress")]
    ReassemblyAlreadyInProgress,
    #[error("continuation/end frame received with no reassembly in progress")]
    NoReassemblyInProgress,
    #[error("reassembled message length {actual} does not match announced length {expected}")]
    MessageLengthMismatch { expected: usize, actual: usize },
    #[error("peer did not ack outstanding data before the ack-receive timeout")]
    AckTimeout,
    #[error("operation attempted on a session that has already been closed")]
    SessionClosed,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Misuse of the API by the upper layer. The session stays alive; the
/// caller just gets told its request was invalid.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BtpFlowError {
    #[error("cannot send an empty Matter message")]
    EmptyMessage,
}

/// Top-level error returned by every public `Session`/`HandshakeFactory`
/// entry point.
#[derive(Error, Debug)]
pub enum BtpError {
    #[error(transparent)]
    Protocol(#[from] BtpProtocolError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Flow(#[from] BtpFlowError),
    #[error("transport I/O error")]
    Transport(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BtpError>;
