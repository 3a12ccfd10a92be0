//! A BTP (Bluetooth Transport Protocol) session core: segmentation,
//! reassembly, and the sliding-window reliable-datagram layer Matter runs
//! its commissioning and operational traffic over when the transport is
//! BLE/GATT.
//!
//! The entry point is [`handshake::create_from_handshake_request`], which
//! turns an inbound handshake-request buffer into a running [`engine::Session`]
//! plus the handshake-response bytes to write back to the peer. From there,
//! feed inbound GATT writes through [`engine::Session::handle_incoming_ble_data`]
//! and queue outbound Matter messages through [`engine::Session::send_matter_message`].

pub mod codec;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod state;
pub mod timer;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use engine::{Session, SessionCallbacks};
pub use error::{BtpError, BtpFlowError, BtpProtocolError, CodecError, Result};
pub use handshake::create_from_handshake_request;
