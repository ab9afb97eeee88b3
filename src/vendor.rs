//! The vendor driver contract (§6): firmware configuration, power control and
//! vendor-specific commands. Out of scope to implement for real; this crate
//! only depends on the trait.

use crate::config::BluetoothDeviceAddress;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipPower {
    On,
    Off,
}

/// The three vendor callbacks the lifecycle controller installs at `start_up`
/// (§4.E). Implementors invoke these from whatever thread the vendor driver's
/// own async machinery lives on; the lifecycle controller posts the actual
/// state transition back onto the `hci_thread`.
pub trait VendorCallbacks: Send + Sync {
    fn firmware_configure_complete(&self, success: bool);
    fn sco_configure_complete(&self, success: bool);
    fn epilog_complete(&self);
}

/// Vendor driver contract (§6).
pub trait VendorDriver: Send {
    fn open(&mut self, addr: BluetoothDeviceAddress, callbacks: std::sync::Arc<dyn VendorCallbacks>) -> Result<(), Error>;

    fn close(&mut self);

    /// Synchronous vendor command, e.g. chip power control.
    fn set_chip_power(&mut self, power: ChipPower) -> Result<(), Error>;

    /// Submit the firmware-configure command asynchronously; completion
    /// arrives via [`VendorCallbacks::firmware_configure_complete`].
    /// A negative-equivalent `Err` means submission itself failed.
    fn send_configure_firmware(&mut self) -> Result<(), Error>;

    /// Submit the SCO-configure command asynchronously; completion arrives
    /// via [`VendorCallbacks::sco_configure_complete`].
    fn send_configure_sco(&mut self) -> Result<(), Error>;

    /// Submit the epilog command asynchronously; completion arrives via
    /// [`VendorCallbacks::epilog_complete`].
    fn send_epilog(&mut self) -> Result<(), Error>;
}
