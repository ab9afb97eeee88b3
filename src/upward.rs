//! The typed-event dispatcher the upper stack subscribes to (§4.F, §6).

use crate::packet::{Packet, UpwardTag};

pub trait UpwardCallbacks: Send + Sync {
    /// A reassembled ACL/SCO/EVT packet arrived from the controller.
    fn on_packet(&self, tag: UpwardTag, packet: Packet);

    /// An outbound non-command packet finished transmitting.
    fn transmit_finished(&self, packet: Packet, all_sent: bool);

    /// The firmware-configure step of preload completed.
    fn preload_finished(&self, success: bool);
}

/// Routes inbound packets and lifecycle callbacks to whichever
/// [`UpwardCallbacks`] was registered at `start_up`.
#[derive(Clone)]
pub struct UpwardDispatcher {
    callbacks: std::sync::Arc<dyn UpwardCallbacks>,
}

impl UpwardDispatcher {
    pub fn new(callbacks: std::sync::Arc<dyn UpwardCallbacks>) -> Self {
        UpwardDispatcher { callbacks }
    }

    pub fn dispatch(&self, packet: Packet) {
        let tag = UpwardTag::from_event_tag(packet.event());
        self.callbacks.on_packet(tag, packet);
    }

    pub fn transmit_finished(&self, packet: Packet, all_sent: bool) {
        self.callbacks.transmit_finished(packet, all_sent);
    }

    pub fn preload_finished(&self, success: bool) {
        self.callbacks.preload_finished(success);
    }
}
