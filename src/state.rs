//! In-memory session record and the mod-256 sequence arithmetic it relies
//! on. Pure data plus small pure helpers: no I/O, no timers.

use std::collections::VecDeque;

use crate::error::BtpProtocolError;

/// Outstanding outbound Matter message: the remaining bytes and how much
/// of it has already been segmented out. Retaining `(bytes, offset)`
/// instead of slicing per-segment avoids copying the tail on every send.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    bytes: Vec<u8>,
    offset: usize,
}

impl OutboundMessage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn total_len(&self) -> usize {
        self.bytes.len()
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    /// Takes up to `max` bytes from the cursor and advances it.
    pub fn take(&mut self, max: usize) -> &[u8] {
        let end = (self.offset + max).min(self.bytes.len());
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        slice
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.bytes.len()
    }
}

/// In-progress inbound reassembly: an append-only buffer pre-reserved to
/// the announced message length.
#[derive(Debug, Clone)]
pub struct ReassemblyBuffer {
    expected_length: usize,
    buffer: Vec<u8>,
}

impl ReassemblyBuffer {
    pub fn begin(expected_length: usize, first_segment: &[u8]) -> Result<Self, BtpProtocolError> {
        let mut buffer = Vec::with_capacity(expected_length);
        let mut this = Self {
            expected_length,
            buffer: Vec::new(),
        };
        std::mem::swap(&mut this.buffer, &mut buffer);
        this.append(first_segment)?;
        Ok(this)
    }

    /// Appends a segment, rejecting mid-stream overflow past the
    /// announced message length.
    pub fn append(&mut self, segment: &[u8]) -> Result<(), BtpProtocolError> {
        if self.buffer.len() + segment.len() > self.expected_length {
            return Err(BtpProtocolError::MessageLengthMismatch {
                expected: self.expected_length,
                actual: self.buffer.len() + segment.len(),
            });
        }
        self.buffer.extend_from_slice(segment);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.buffer.len() == self.expected_length
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn expected_length(&self) -> usize {
        self.expected_length
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }
}

/// Serial (RFC 1982-style) comparison of mod-256 sequence numbers.
///
/// `lhs` is considered "at or past" `rhs` using wrapping distance rather
/// than a raw numeric compare, which is what makes ack validation correct
/// even once the counter has wrapped past 0. Window sizes are capped at
/// 255 and in practice sit in the single digits, so the 128-frame
/// ambiguity threshold inherent to mod-256 serial arithmetic is never
/// approached.
pub fn serial_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from)
}

/// The session's in-memory record (§3).
#[derive(Debug)]
pub struct SessionState {
    pub version: u8,
    pub att_mtu: u16,
    pub fragment_size: usize,
    pub window_size: u8,

    /// Last sequence number we sent (the "monotone counter", §3). `0xff`
    /// before anything has been sent, so the first call to `next_seq()`
    /// yields `0`.
    pub sequence_number: u8,
    /// Highest contiguous sequence number the peer has acknowledged to us.
    pub prev_incoming_ack_number: u8,
    /// Last sequence number we received from the peer.
    pub prev_incoming_sequence_number: u8,
    /// Highest inbound sequence number we've acknowledged to the peer.
    pub prev_acked_sequence_number: u8,

    pub reassembly: Option<ReassemblyBuffer>,
    pub outbound_queue: VecDeque<OutboundMessage>,

    pub ack_receive_timer_running: bool,
    pub send_ack_timer_running: bool,
    pub send_in_progress: bool,

    pub is_active: bool,
}

impl SessionState {
    pub fn new(version: u8, att_mtu: u16, window_size: u8) -> Self {
        Self {
            version,
            att_mtu,
            fragment_size: att_mtu as usize - 3,
            window_size,
            sequence_number: 0xff,
            prev_incoming_ack_number: 0xff,
            prev_incoming_sequence_number: 0xff,
            prev_acked_sequence_number: 0xff,
            reassembly: None,
            outbound_queue: VecDeque::new(),
            ack_receive_timer_running: false,
            send_ack_timer_running: false,
            send_in_progress: false,
            is_active: true,
        }
    }

    /// Increments and returns the next outgoing sequence number, wrapping
    /// `0xff` to `0x00`.
    pub fn next_seq(&mut self) -> u8 {
        self.sequence_number = self.sequence_number.wrapping_add(1);
        self.sequence_number
    }

    /// Count of outbound frames sent but not yet acknowledged.
    pub fn unacked_outbound_count(&self) -> u8 {
        serial_distance(self.prev_incoming_ack_number, self.sequence_number)
    }

    /// Whether the outbound window still has room for one more frame.
    pub fn window_open(&self) -> bool {
        self.unacked_outbound_count() <= self.window_size.saturating_sub(1)
    }

    /// Whether we owe the peer a standalone/piggybacked ack.
    pub fn ack_owed(&self) -> bool {
        serial_distance(
            self.prev_acked_sequence_number,
            self.prev_incoming_sequence_number,
        ) > 0
    }
}
