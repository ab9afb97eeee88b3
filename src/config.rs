use std::time::Duration;

/// Command-pending watchdog duration (§4.B, §6). A command with no matching
/// command-complete/command-status event within this window is treated as
/// fatal.
pub const COMMAND_PENDING_TIMEOUT: Duration = Duration::from_millis(8000);

/// How long `shut_down` waits for the vendor epilog handshake before forcing
/// the event-loop thread to stop (§4.E, §6).
pub const EPILOG_WAIT_TIMEOUT: Duration = Duration::from_millis(3000);

/// Delay between logging a fatal watchdog expiry and actually terminating the
/// process, to let the log line reach disk (§4.B, §6).
pub const POST_KILL_SLEEP: Duration = Duration::from_millis(10);

/// Initial command credit count per Bluetooth Core Spec Volume 2, Part E
/// §4.4: the host may have exactly one command outstanding before the
/// controller has sent any command-complete/command-status event.
pub const INITIAL_CREDITS: u16 = 1;

/// A Bluetooth device address, stored little-endian as sent over HCI.
pub type BluetoothDeviceAddress = [u8; 6];

/// Parameters supplied to [`crate::facade::HciTransport::start_up`].
///
/// This generalizes the teacher's pattern of passing concrete parameters
/// directly into adapter construction (`HCIAdapter::from`/`default()`)
/// instead of reading a config file; there is no configuration-file layer
/// in this crate, matching the teacher.
#[derive(Debug, Clone)]
pub struct HciConfig {
    pub local_addr: BluetoothDeviceAddress,
    pub command_pending_timeout: Duration,
    pub epilog_wait_timeout: Duration,
    pub post_kill_sleep: Duration,
}

impl Default for HciConfig {
    fn default() -> Self {
        HciConfig {
            local_addr: [0u8; 6],
            command_pending_timeout: COMMAND_PENDING_TIMEOUT,
            epilog_wait_timeout: EPILOG_WAIT_TIMEOUT,
            post_kill_sleep: POST_KILL_SLEEP,
        }
    }
}
