//! The HAL contract (§6): the byte transport between this layer and the
//! Bluetooth controller. Out of scope to implement for real; this crate only
//! depends on the trait.

use crate::error::Error;
use crate::packet::PacketType;
use std::sync::Arc;

/// Capability the HAL uses to tell us bytes of `packet_type` are ready to be
/// read. Generalizes the HAL's `data_ready(type)` callback (§6) into a
/// pushed notification rather than a raw function pointer, so the HAL can be
/// driven from any thread.
pub trait DataReadyNotifier: Send + Sync {
    fn notify(&self, packet_type: PacketType);
}

/// The byte transport consumed by the [`crate::reassembly::Reassembler`] and
/// [`crate::scheduler::Scheduler`] (§6).
pub trait Hal: Send {
    /// Bind the notifier the HAL should call back into whenever bytes become
    /// available. Called once during `start_up`.
    fn init(&mut self, notifier: Arc<dyn DataReadyNotifier>);

    fn open(&mut self) -> Result<(), Error>;

    fn close(&mut self);

    /// Non-blocking read of up to `dst.len()` bytes of `packet_type` data.
    /// Returns the number of bytes actually read, which may be fewer than
    /// requested, including zero, when `block` is false.
    fn read_data(&self, packet_type: PacketType, dst: &mut [u8], block: bool) -> usize;

    /// Blocking write of `bytes` to the controller.
    fn transmit_data(&self, packet_type: PacketType, bytes: &[u8]);

    /// Called once per whole inbound packet consumed.
    fn packet_finished(&self, packet_type: PacketType);
}
