//! The fragmenter contract (§6): outbound fragmentation and inbound
//! multi-ACL reassembly above the HCI framing layer. Real L2CAP-aware
//! fragmentation is out of scope (Non-goal: "interpreting L2CAP or higher
//! layers"); [`PassthroughFragmenter`] is the default implementation used
//! when no richer collaborator is supplied.

use crate::packet::Packet;

/// Called by a [`Fragmenter`] once an outbound fragment is ready to go to the
/// HAL, and again to report that the whole packet has been sent.
pub trait FragmentSink: Send + Sync {
    /// Write `packet` to the HAL (after btsnoop logging). `send_done` is true
    /// for the final fragment of a non-command packet, in which case the
    /// upper stack is notified via `transmit_finished` after the write.
    fn transmit_fragment(&self, packet: Packet, send_done: bool);

    /// Forward a fully reassembled inbound packet to the upper stack via the
    /// upward dispatcher, keyed by `packet.event & EVT_MASK`.
    fn dispatch_reassembled(&self, packet: Packet);

    /// Report that `buffer` (an outbound packet handed to `fragment_and_dispatch`)
    /// has been fully sent (`all_sent`).
    fn transmit_finished(&self, buffer: Packet, all_sent: bool);
}

/// Fragmenter contract (§6).
pub trait Fragmenter: Send {
    fn init(&mut self, sink: std::sync::Arc<dyn FragmentSink>);

    fn cleanup(&mut self);

    /// Outbound: fragment `packet` (if necessary) and dispatch each fragment
    /// through the sink's `transmit_fragment`.
    fn fragment_and_dispatch(&mut self, packet: Packet);

    /// Inbound: accumulate or dispatch `packet` upward, depending on whether
    /// it completes a multi-fragment ACL/SCO transfer.
    fn reassemble_and_dispatch(&mut self, packet: Packet);
}

/// Default [`Fragmenter`]: every outbound packet is dispatched as a single
/// fragment and every inbound packet is immediately forwarded upward. This
/// is correct as long as the controller's negotiated ACL data length is
/// respected by callers; it does not reassemble multi-fragment L2CAP frames.
pub struct PassthroughFragmenter {
    sink: Option<std::sync::Arc<dyn FragmentSink>>,
}

impl PassthroughFragmenter {
    pub fn new() -> Self {
        PassthroughFragmenter { sink: None }
    }
}

impl Default for PassthroughFragmenter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fragmenter for PassthroughFragmenter {
    fn init(&mut self, sink: std::sync::Arc<dyn FragmentSink>) {
        self.sink = Some(sink);
    }

    fn cleanup(&mut self) {
        self.sink = None;
    }

    fn fragment_and_dispatch(&mut self, packet: Packet) {
        let send_done = packet.packet_type() != Some(crate::packet::PacketType::Command);
        if let Some(sink) = &self.sink {
            sink.transmit_fragment(packet, send_done);
        }
    }

    fn reassemble_and_dispatch(&mut self, packet: Packet) {
        if let Some(sink) = &self.sink {
            sink.dispatch_reassembled(packet);
        }
    }
}
