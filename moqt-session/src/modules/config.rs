use serde::Deserialize;

use moqt_wire::constants::MOQ_TRANSPORT_VERSION;

pub use crate::priority::DEFAULT_SUBSCRIBER_PRIORITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Perspective {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Underlay {
    QUIC,
    WebTransport,
}

/// Parameters of one MoQT session. Loaded from configuration or built in
/// code; every field has a usable default except the perspective.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MOQTSessionConfig {
    pub perspective: Perspective,
    pub version: u32,
    pub underlay: Underlay,
    /// Only sent for native QUIC; WebTransport carries the path in the
    /// HTTP/3 CONNECT request.
    pub path: String,
    pub max_subscribe_id: u64,
    pub support_object_acks: bool,
    /// Hand object fragments to the visitor as they arrive instead of
    /// reassembling complete objects first.
    pub deliver_partial_objects: bool,
}

impl Default for MOQTSessionConfig {
    fn default() -> Self {
        MOQTSessionConfig {
            perspective: Perspective::Client,
            version: MOQ_TRANSPORT_VERSION,
            underlay: Underlay::WebTransport,
            path: String::new(),
            max_subscribe_id: 100,
            support_object_acks: false,
            deliver_partial_objects: false,
        }
    }
}
