//! Session-wide configuration knobs. Production code builds this from the
//! normative constants in [`crate::constants`]; tests override individual
//! fields to exercise timeouts and version negotiation without waiting on
//! real clocks.

use std::time::Duration;

use derive_builder::Builder;

use crate::constants::{ACK_TIMEOUT, MAX_WINDOW, SEND_ACK_TIMEOUT, SUPPORTED_VERSIONS};

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct SessionConfig {
    #[builder(default = "SUPPORTED_VERSIONS.to_vec()")]
    pub supported_versions: Vec<u8>,
    #[builder(default = "ACK_TIMEOUT")]
    pub ack_timeout: Duration,
    #[builder(default = "SEND_ACK_TIMEOUT")]
    pub send_ack_timeout: Duration,
    #[builder(default = "MAX_WINDOW")]
    pub max_window: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfigBuilder::default()
            .build()
            .expect("all SessionConfig fields carry defaults")
    }
}
