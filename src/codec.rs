//! Bit-exact wire codec for BTP handshake and data frames.
//!
//! Pure functions only: no I/O, no session state. Every byte sequence
//! defined by §6 round-trips through this module exactly.

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::error::CodecError;

bitflags! {
    /// Header flag byte shared by handshake and data frames.
    ///
    /// Bit positions are load-bearing: `HANDSHAKE_REQUEST` and
    /// `HANDSHAKE_RESPONSE` both collapse to `0x65`, which is the fixed
    /// two-byte "magic" (flags, opcode) prefix seen on every handshake
    /// frame in §6.
    pub struct HeaderFlags: u8 {
        const IS_BEGIN       = 0b0000_0001;
        const IS_END         = 0b0000_0100;
        const HAS_ACK        = 0b0000_1000;
        const IS_MANAGEMENT  = 0b0010_0000;
        const IS_HANDSHAKE   = 0b0100_0000;

        const HANDSHAKE_REQUEST =
            Self::IS_HANDSHAKE.bits | Self::IS_MANAGEMENT.bits | Self::IS_BEGIN.bits | Self::IS_END.bits;
        const HANDSHAKE_RESPONSE = Self::HANDSHAKE_REQUEST.bits;
    }
}

impl HeaderFlags {
    pub fn is_control(self) -> bool {
        self.intersects(Self::IS_HANDSHAKE | Self::IS_MANAGEMENT)
    }
}

/// Maximum number of version nibbles packable into the 4 handshake-request
/// version bytes.
const MAX_VERSION_SLOTS: usize = 8;

/// A decoded handshake request (peer → us).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Proposed protocol versions, highest preference first. 1–4 entries.
    pub versions: Vec<u8>,
    pub att_mtu: u16,
    pub client_window_size: u8,
}

impl HandshakeRequest {
    /// Encodes a handshake request.
    ///
    /// ```
    /// use btp::codec::HandshakeRequest;
    ///
    /// let req = HandshakeRequest {
    ///     versions: vec![4],
    ///     att_mtu: 185,
    ///     client_window_size: 6,
    /// };
    /// assert_eq!(
    ///     req.encode(),
    ///     vec![0x65, 0x6c, 0x04, 0x00, 0x00, 0x00, 0xb9, 0x00, 0x06]
    /// );
    ///
    /// let req = HandshakeRequest {
    ///     versions: vec![4, 5, 6],
    ///     att_mtu: 185,
    ///     client_window_size: 6,
    /// };
    /// assert_eq!(
    ///     req.encode(),
    ///     vec![0x65, 0x6c, 0x04, 0x56, 0x00, 0x00, 0xb9, 0x00, 0x06]
    /// );
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(HeaderFlags::HANDSHAKE_REQUEST.bits());
        out.push(crate::constants::MANAGEMENT_OPCODE);

        let mut nibbles = [0u8; MAX_VERSION_SLOTS];
        for (slot, version) in nibbles.iter_mut().skip(1).zip(self.versions.iter()) {
            *slot = *version;
        }
        for pair in nibbles.chunks_exact(2) {
            out.push((pair[0] << 4) | pair[1]);
        }

        let mut mtu_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut mtu_bytes, self.att_mtu);
        out.extend_from_slice(&mtu_bytes);
        out.push(self.client_window_size);
        out
    }

    /// Decodes a handshake request.
    ///
    /// ```
    /// use btp::codec::HandshakeRequest;
    ///
    /// let req = HandshakeRequest::decode(&[
    ///     0x65, 0x6c, 0x04, 0x56, 0x00, 0x00, 0xb9, 0x00, 0x06,
    /// ]).unwrap();
    /// assert_eq!(req.versions, vec![4, 5, 6]);
    /// assert_eq!(req.att_mtu, 185);
    /// assert_eq!(req.client_window_size, 6);
    ///
    /// assert!(HandshakeRequest::decode(&[0x00; 9]).is_err());
    /// ```
    pub fn decode(buffer: &[u8]) -> Result<Self, CodecError> {
        if buffer.len() != 9 {
            return Err(CodecError::BufferTooShort {
                needed: 9,
                got: buffer.len(),
            });
        }
        if buffer[0] != HeaderFlags::HANDSHAKE_REQUEST.bits() {
            return Err(CodecError::BadMagic);
        }
        if buffer[1] != crate::constants::MANAGEMENT_OPCODE {
            return Err(CodecError::BadManagementOpcode(buffer[1]));
        }

        let mut nibbles = [0u8; MAX_VERSION_SLOTS];
        for (i, byte) in buffer[2..6].iter().enumerate() {
            nibbles[2 * i] = byte >> 4;
            nibbles[2 * i + 1] = byte & 0x0f;
        }
        let versions: Vec<u8> = nibbles
            .into_iter()
            .skip(1)
            .take_while(|n| *n != 0)
            .collect();
        if versions.is_empty() {
            return Err(CodecError::NoVersionsPresent);
        }

        let att_mtu = LittleEndian::read_u16(&buffer[6..8]);
        let client_window_size = buffer[8];

        Ok(HandshakeRequest {
            versions,
            att_mtu,
            client_window_size,
        })
    }
}

/// A decoded handshake response (us → peer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeResponse {
    pub version: u8,
    pub att_mtu: u16,
    pub window_size: u8,
}

impl HandshakeResponse {
    /// ```
    /// use btp::codec::HandshakeResponse;
    ///
    /// let resp = HandshakeResponse { version: 4, att_mtu: 256, window_size: 6 };
    /// assert_eq!(resp.encode(), vec![0x65, 0x6c, 0x04, 0x00, 0x01, 0x06]);
    ///
    /// let resp = HandshakeResponse { version: 4, att_mtu: 100, window_size: 6 };
    /// assert_eq!(resp.encode(), vec![0x65, 0x6c, 0x04, 0x64, 0x00, 0x06]);
    /// ```
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(6);
        out.push(HeaderFlags::HANDSHAKE_RESPONSE.bits());
        out.push(crate::constants::MANAGEMENT_OPCODE);
        out.push(self.version);
        let mut mtu_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut mtu_bytes, self.att_mtu);
        out.extend_from_slice(&mtu_bytes);
        out.push(self.window_size);
        out
    }

    pub fn decode(buffer: &[u8]) -> Result<Self, CodecError> {
        if buffer.len() != 6 {
            return Err(CodecError::BufferTooShort {
                needed: 6,
                got: buffer.len(),
            });
        }
        if buffer[0] != HeaderFlags::HANDSHAKE_RESPONSE.bits() {
            return Err(CodecError::BadMagic);
        }
        if buffer[1] != crate::constants::MANAGEMENT_OPCODE {
            return Err(CodecError::BadManagementOpcode(buffer[1]));
        }
        Ok(HandshakeResponse {
            version: buffer[2],
            att_mtu: LittleEndian::read_u16(&buffer[3..5]),
            window_size: buffer[5],
        })
    }
}

/// A decoded data/ack frame.
///
/// `is_continue()` is not stored: it is just `!is_begin`, synonymous
/// with "not a begin frame" at the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub flags: HeaderFlags,
    pub ack_number: Option<u8>,
    pub sequence_number: u8,
    pub message_length: Option<u16>,
    pub payload: Vec<u8>,
}

impl DataFrame {
    pub fn is_begin(&self) -> bool {
        self.flags.contains(HeaderFlags::IS_BEGIN)
    }

    pub fn is_end(&self) -> bool {
        self.flags.contains(HeaderFlags::IS_END)
    }

    pub fn has_ack(&self) -> bool {
        self.flags.contains(HeaderFlags::HAS_ACK)
    }

    /// Derived per §4.1: synonymous with "not a begin frame".
    pub fn is_continue(&self) -> bool {
        !self.is_begin()
    }

    /// Encodes a data frame, enforcing the ack/begin field-presence rules.
    ///
    /// ```
    /// use btp::codec::{DataFrame, HeaderFlags};
    ///
    /// let frame = DataFrame {
    ///     flags: HeaderFlags::IS_END,
    ///     ack_number: None,
    ///     sequence_number: 0,
    ///     message_length: None,
    ///     payload: vec![1, 2, 3],
    /// };
    /// assert_eq!(frame.encode().unwrap(), vec![0x04, 0x00, 1, 2, 3]);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.has_ack() != self.ack_number.is_some() {
            return Err(CodecError::AckFlagMismatch);
        }
        if self.is_begin() != self.message_length.is_some() {
            return Err(CodecError::BeginFlagMismatch);
        }

        let mut out = Vec::with_capacity(self.header_len() + self.payload.len());
        out.push(self.flags.bits());
        if let Some(ack) = self.ack_number {
            out.push(ack);
        }
        out.push(self.sequence_number);
        if let Some(len) = self.message_length {
            let mut len_bytes = [0u8; 2];
            LittleEndian::write_u16(&mut len_bytes, len);
            out.extend_from_slice(&len_bytes);
        }
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Number of header bytes this frame would occupy, excluding payload.
    pub fn header_len(&self) -> usize {
        1 + self.ack_number.map_or(0, |_| 1) + 1 + self.message_length.map_or(0, |_| 2)
    }

    /// Decodes a data/ack frame.
    ///
    /// Does *not* reject handshake or management frames: the engine
    /// classifies those as `UnexpectedControlFrame` itself (§4.3 check
    /// #1) so the distinction is visible to callers as a protocol error,
    /// not a codec error.
    ///
    /// ```
    /// use btp::codec::{DataFrame, HeaderFlags};
    ///
    /// let frame = DataFrame::decode(&[0x0d, 0x00, 0x00, 0x44, 0x00, 1, 2]).unwrap();
    /// assert!(frame.is_begin());
    /// assert!(frame.is_end());
    /// assert_eq!(frame.ack_number, Some(0));
    /// assert_eq!(frame.sequence_number, 0);
    /// assert_eq!(frame.message_length, Some(0x44));
    /// assert_eq!(frame.payload, vec![1, 2]);
    /// ```
    pub fn decode(buffer: &[u8]) -> Result<Self, CodecError> {
        let (&flags_byte, rest) = buffer
            .split_first()
            .ok_or(CodecError::BufferTooShort { needed: 1, got: 0 })?;
        let flags = HeaderFlags::from_bits_truncate(flags_byte);

        let (ack_number, rest) = if flags.contains(HeaderFlags::HAS_ACK) {
            let (&ack, rest) = rest
                .split_first()
                .ok_or(CodecError::BufferTooShort { needed: 2, got: 1 })?;
            (Some(ack), rest)
        } else {
            (None, rest)
        };

        let (&seq, rest) = rest.split_first().ok_or(CodecError::BufferTooShort {
            needed: buffer.len() + 1,
            got: buffer.len(),
        })?;

        let (message_length, payload) = if flags.contains(HeaderFlags::IS_BEGIN) {
            if rest.len() < 2 {
                return Err(CodecError::BufferTooShort {
                    needed: buffer.len() - rest.len() + 2,
                    got: buffer.len(),
                });
            }
            let (len_bytes, payload) = rest.split_at(2);
            (Some(LittleEndian::read_u16(len_bytes)), payload)
        } else {
            (None, rest)
        };

        Ok(DataFrame {
            flags,
            ack_number,
            sequence_number: seq,
            message_length,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_request_wire_bytes() {
        let req = HandshakeRequest {
            versions: vec![4],
            att_mtu: 185,
            client_window_size: 6,
        };
        assert_eq!(
            req.encode(),
            vec![0x65, 0x6c, 0x04, 0x00, 0x00, 0x00, 0xb9, 0x00, 0x06]
        );
    }

    #[test]
    fn handshake_request_rejects_bad_magic() {
        let mut bytes = HandshakeRequest {
            versions: vec![4],
            att_mtu: 23,
            client_window_size: 1,
        }
        .encode();
        bytes[0] = 0x00;
        assert_eq!(HandshakeRequest::decode(&bytes), Err(CodecError::BadMagic));
    }

    #[test]
    fn handshake_request_rejects_zero_versions() {
        let bytes = vec![0x65, 0x6c, 0x00, 0x00, 0x00, 0x00, 0x17, 0x00, 0x01];
        assert_eq!(
            HandshakeRequest::decode(&bytes),
            Err(CodecError::NoVersionsPresent)
        );
    }

    #[test]
    fn handshake_response_wire_bytes() {
        assert_eq!(
            HandshakeResponse {
                version: 4,
                att_mtu: 100,
                window_size: 6
            }
            .encode(),
            vec![0x65, 0x6c, 0x04, 0x64, 0x00, 0x06]
        );
    }

    #[test]
    fn data_frame_wire_bytes() {
        let cases: &[(&[u8], DataFrame)] = &[
            (
                &[0x04, 0x00],
                DataFrame {
                    flags: HeaderFlags::IS_END,
                    ack_number: None,
                    sequence_number: 0,
                    message_length: None,
                    payload: vec![],
                },
            ),
            (
                &[0x0c, 0x00, 0x00],
                DataFrame {
                    flags: HeaderFlags::IS_END | HeaderFlags::HAS_ACK,
                    ack_number: Some(0),
                    sequence_number: 0,
                    message_length: None,
                    payload: vec![],
                },
            ),
            (
                &[0x05, 0x00, 0x44, 0x00],
                DataFrame {
                    flags: HeaderFlags::IS_BEGIN | HeaderFlags::IS_END,
                    ack_number: None,
                    sequence_number: 0,
                    message_length: Some(0x44),
                    payload: vec![],
                },
            ),
            (
                &[0x0d, 0x00, 0x00, 0x44, 0x00],
                DataFrame {
                    flags: HeaderFlags::IS_BEGIN | HeaderFlags::IS_END | HeaderFlags::HAS_ACK,
                    ack_number: Some(0),
                    sequence_number: 0,
                    message_length: Some(0x44),
                    payload: vec![],
                },
            ),
        ];

        for (wire, frame) in cases {
            assert_eq!(&frame.encode().unwrap(), wire);
            assert_eq!(&DataFrame::decode(wire).unwrap(), frame);
        }
    }

    #[test]
    fn data_frame_rejects_ack_flag_mismatch() {
        let frame = DataFrame {
            flags: HeaderFlags::IS_END | HeaderFlags::HAS_ACK,
            ack_number: None,
            sequence_number: 0,
            message_length: None,
            payload: vec![],
        };
        assert_eq!(frame.encode(), Err(CodecError::AckFlagMismatch));
    }

    #[test]
    fn data_frame_rejects_begin_flag_mismatch() {
        let frame = DataFrame {
            flags: HeaderFlags::IS_BEGIN | HeaderFlags::IS_END,
            ack_number: None,
            sequence_number: 0,
            message_length: None,
            payload: vec![1],
        };
        assert_eq!(frame.encode(), Err(CodecError::BeginFlagMismatch));
    }

    #[test]
    fn data_frame_decode_does_not_reject_control_bits() {
        let frame = DataFrame::decode(&[
            HeaderFlags::HANDSHAKE_REQUEST.bits(),
            0x6c,
            0,
            0,
            0,
        ])
        .unwrap();
        assert!(frame.flags.is_control());
    }

    proptest::proptest! {
        #[test]
        fn handshake_request_roundtrips(
            version in 1u8..=15,
            att_mtu in 23u16..=247,
            client_window_size in 0u8..=255,
        ) {
            let req = HandshakeRequest { versions: vec![version], att_mtu, client_window_size };
            let decoded = HandshakeRequest::decode(&req.encode()).unwrap();
            proptest::prop_assert_eq!(decoded, req);
        }

        #[test]
        fn data_frame_roundtrips(
            is_begin in proptest::bool::ANY,
            has_ack in proptest::bool::ANY,
            seq in proptest::num::u8::ANY,
            ack in proptest::num::u8::ANY,
            len in proptest::num::u16::ANY,
            payload in proptest::collection::vec(proptest::num::u8::ANY, 0..32),
        ) {
            let mut flags = HeaderFlags::IS_END;
            if is_begin { flags |= HeaderFlags::IS_BEGIN; }
            if has_ack { flags |= HeaderFlags::HAS_ACK; }

            let frame = DataFrame {
                flags,
                ack_number: has_ack.then_some(ack),
                sequence_number: seq,
                message_length: is_begin.then_some(len),
                payload,
            };
            let encoded = frame.encode().unwrap();
            let decoded = DataFrame::decode(&encoded).unwrap();
            proptest::prop_assert_eq!(decoded, frame);
        }
    }
}
