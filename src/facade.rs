//! The stable public facade (§4.F) presented to the upper stack.
//!
//! Thin wrapper methods over [`HciContext`] (§9 Design Notes: "the public
//! facade becomes methods on that context"). All calls are thread-safe with
//! respect to each other except where individually noted.

use crate::config::{BluetoothDeviceAddress, HciConfig};
use crate::correlator::FatalHandler;
use crate::error::Error;
use crate::fragmenter::Fragmenter;
use crate::hal::Hal;
use crate::lifecycle::{HciContext, LifecycleState};
use crate::low_power::LowPowerManager;
use crate::packet::Packet;
use crate::scheduler::{CompleteCallback, StatusCallback};
use crate::upward::{UpwardCallbacks, UpwardDispatcher};
use crate::vendor::VendorDriver;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;

/// A running HCI transport session. Cloning shares the same underlying
/// [`HciContext`] (it is an `Arc` handle, not a second session).
#[derive(Clone)]
pub struct HciTransport {
    ctx: Arc<HciContext>,
}

impl HciTransport {
    /// `start_up(local_addr, callbacks)` (§4.F), with the production
    /// collaborator set: a real fragmenter is passthrough-only, there is no
    /// low-power manager, and watchdog expiry terminates the process.
    pub fn start_up(
        local_addr: BluetoothDeviceAddress,
        hal: Box<dyn Hal>,
        vendor: Box<dyn VendorDriver>,
        upper_callbacks: Arc<dyn UpwardCallbacks>,
    ) -> Result<HciTransport, Error> {
        let config = HciConfig { local_addr, ..HciConfig::default() };
        HciContext::start_up(config, hal, vendor, upper_callbacks).map(|ctx| HciTransport { ctx })
    }

    /// As [`HciTransport::start_up`], but every collaborator — including the
    /// fragmenter, low-power manager and fatal handler — is supplied
    /// explicitly. Tests use this to inject fakes (§9: "Testing substitutes
    /// fakes").
    #[allow(clippy::too_many_arguments)]
    pub fn start_up_with_collaborators(
        config: HciConfig,
        hal: Box<dyn Hal>,
        vendor: Box<dyn VendorDriver>,
        fragmenter: Box<dyn Fragmenter>,
        low_power: Box<dyn LowPowerManager>,
        upper_callbacks: Arc<dyn UpwardCallbacks>,
        fatal_handler: Box<dyn FatalHandler>,
    ) -> Result<HciTransport, Error> {
        HciContext::start_up_with_collaborators(config, hal, vendor, fragmenter, low_power, upper_callbacks, fatal_handler)
            .map(|ctx| HciTransport { ctx })
    }

    /// `shut_down()` (§4.E, §4.F): idempotent, a repeat call logs a warning
    /// and returns immediately.
    pub fn shut_down(&self) {
        self.ctx.shut_down();
    }

    /// Routes to the vendor driver's synchronous chip-power command.
    pub fn set_chip_power_on(&self, on: bool) -> Result<(), Error> {
        self.ctx.set_chip_power_on(on)
    }

    pub fn do_preload(&self) -> Result<(), Error> {
        self.ctx.do_preload()
    }

    pub fn do_postload(&self) -> Result<(), Error> {
        self.ctx.do_postload()
    }

    pub fn turn_on_logging<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        self.ctx.turn_on_logging(path)
    }

    pub fn turn_off_logging(&self) {
        self.ctx.turn_off_logging();
    }

    /// `transmit_command(cmd, on_complete, on_status, ctx)` (§4.C admission).
    pub fn transmit_command(
        &self,
        cmd: Packet,
        on_complete: Option<CompleteCallback>,
        on_status: Option<StatusCallback>,
        ctx: Box<dyn Any + Send>,
    ) -> Result<(), Error> {
        self.ctx.transmit_command(cmd, on_complete, on_status, ctx)
    }

    /// `transmit_downward(event_tag, data)` (§4.C admission).
    pub fn transmit_downward(&self, event_tag: u16, data: Packet) -> Result<(), Error> {
        self.ctx.transmit_downward(event_tag, data)
    }

    pub fn send_low_power_command(&self, cmd: Packet) {
        self.ctx.send_low_power_command(cmd);
    }

    /// The typed-event dispatcher the upper stack subscribes to (§4.F, §6).
    pub fn upward_dispatcher(&self) -> &UpwardDispatcher {
        self.ctx.upward_dispatcher()
    }

    pub fn state(&self) -> LifecycleState {
        self.ctx.state()
    }

    pub fn firmware_is_configured(&self) -> bool {
        self.ctx.firmware_is_configured()
    }

    pub fn has_shut_down(&self) -> bool {
        self.ctx.has_shut_down()
    }
}
