//! The lifecycle state machine (§4.E): `DOWN -> STARTING -> PRELOADING ->
//! CONFIGURED -> POSTLOADING -> RUNNING -> EPILOGING -> DOWN`, wiring every
//! collaborator together behind one [`HciContext`] (§9 Design Notes: "wrap
//! this state in a single context object created by `start_up`").

use crate::btsnoop::{BtSnoopLogger, Direction};
use crate::config::HciConfig;
use crate::correlator::{Correlator, FatalHandler, ProcessKillFatalHandler};
use crate::error::Error;
use crate::fragmenter::{FragmentSink, Fragmenter, PassthroughFragmenter};
use crate::hal::{DataReadyNotifier, Hal};
use crate::low_power::{LowPowerManager, NoopLowPowerManager};
use crate::packet::{Packet, PacketType};
use crate::reactor::{AlarmId, Reactor, ReactorEvent};
use crate::reassembly::Reassembler;
use crate::scheduler::Scheduler;
use crate::upward::{UpwardCallbacks, UpwardDispatcher};
use crate::vendor::{ChipPower, VendorCallbacks, VendorDriver};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Down,
    Starting,
    Preloading,
    Configured,
    Postloading,
    Running,
    Epiloging,
}

struct VendorCallbackRelay {
    ctx: Mutex<Weak<HciContext>>,
    reactor: Arc<Reactor>,
}

impl VendorCallbackRelay {
    fn post(&self, f: impl FnOnce(&Arc<HciContext>) + Send + 'static) {
        let weak = self.ctx.lock().unwrap().clone();
        let _ = self.reactor.post(ReactorEvent::LifecycleTask(Box::new(move || {
            if let Some(ctx) = weak.upgrade() {
                f(&ctx);
            }
        })));
    }
}

impl VendorCallbacks for VendorCallbackRelay {
    fn firmware_configure_complete(&self, success: bool) {
        self.post(move |ctx| ctx.on_firmware_configure_complete(success));
    }

    fn sco_configure_complete(&self, success: bool) {
        self.post(move |ctx| ctx.on_sco_configure_complete(success));
    }

    fn epilog_complete(&self) {
        self.post(|ctx| ctx.on_epilog_complete());
    }
}

/// Posts a [`ReactorEvent::HalDataReady`] whenever the HAL says bytes of a
/// given type are ready, generalizing the teacher's device-fd epoll
/// registration into a pushed notification the HAL can call from any
/// thread (§6 `data_ready(type)`).
struct HalNotifierRelay {
    reactor: Arc<Reactor>,
}

impl DataReadyNotifier for HalNotifierRelay {
    fn notify(&self, packet_type: PacketType) {
        let _ = self.reactor.post(ReactorEvent::HalDataReady(packet_type));
    }
}

/// The fragmenter's view of this context (§6 "callbacks we expose to it").
/// Holds a [`Weak`] reference rather than the `Arc` the fragmenter would
/// otherwise need, per §9's guidance to avoid back-pointer cycles.
struct FragmentSinkRelay {
    ctx: Mutex<Weak<HciContext>>,
}

impl FragmentSink for FragmentSinkRelay {
    fn transmit_fragment(&self, packet: Packet, send_done: bool) {
        let ctx = match self.ctx.lock().unwrap().upgrade() {
            Some(ctx) => ctx,
            None => return,
        };

        ctx.log_btsnoop(Direction::Outgoing, &packet);

        if let (Ok(hal), Some(packet_type)) = (ctx.hal.lock(), packet.packet_type()) {
            hal.transmit_data(packet_type, packet.bytes());
        }

        if send_done {
            ctx.upward.transmit_finished(packet, true);
        }
    }

    fn dispatch_reassembled(&self, packet: Packet) {
        if let Some(ctx) = self.ctx.lock().unwrap().upgrade() {
            ctx.upward.dispatch(packet);
        }
    }

    fn transmit_finished(&self, buffer: Packet, all_sent: bool) {
        if let Some(ctx) = self.ctx.lock().unwrap().upgrade() {
            ctx.upward.transmit_finished(buffer, all_sent);
        }
    }
}

/// All per-session state, collaborators and queues for one controller
/// instance (§3 LifecycleFlags, §9: one instance per process remains
/// sufficient).
pub struct HciContext {
    state: Mutex<LifecycleState>,
    config: HciConfig,

    scheduler: Scheduler,
    correlator: Correlator,
    reassembler: Mutex<Reassembler>,
    reactor: Arc<Reactor>,

    hal: Mutex<Box<dyn Hal>>,
    vendor: Mutex<Box<dyn VendorDriver>>,
    fragmenter: Mutex<Box<dyn Fragmenter>>,
    low_power: Box<dyn LowPowerManager>,
    upward: UpwardDispatcher,
    fatal_handler: Box<dyn FatalHandler>,
    btsnoop: Mutex<Option<BtSnoopLogger>>,

    firmware_is_configured: AtomicBool,
    has_shut_down: AtomicBool,

    watchdog_alarm: AlarmId,
    epilog_alarm: AlarmId,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HciContext {
    /// Wire up one session's collaborators and spawn the event-loop thread.
    /// Corresponds to §4.E `start_up`; any failure here rolls back via
    /// [`HciContext::shut_down`] and this returns `Err`.
    pub fn start_up(
        config: HciConfig,
        hal: Box<dyn Hal>,
        vendor: Box<dyn VendorDriver>,
        upper_callbacks: Arc<dyn UpwardCallbacks>,
    ) -> Result<Arc<HciContext>, Error> {
        let fatal_handler = Box::new(ProcessKillFatalHandler::new(config.post_kill_sleep));
        Self::start_up_with_collaborators(
            config,
            hal,
            vendor,
            Box::new(PassthroughFragmenter::new()),
            Box::new(NoopLowPowerManager),
            upper_callbacks,
            fatal_handler,
        )
    }

    /// As [`HciContext::start_up`], but every collaborator (including the
    /// fatal handler) is supplied explicitly. Production code uses
    /// `start_up`; tests use this directly to inject fakes.
    #[allow(clippy::too_many_arguments)]
    pub fn start_up_with_collaborators(
        config: HciConfig,
        hal: Box<dyn Hal>,
        vendor: Box<dyn VendorDriver>,
        fragmenter: Box<dyn Fragmenter>,
        low_power: Box<dyn LowPowerManager>,
        upper_callbacks: Arc<dyn UpwardCallbacks>,
        fatal_handler: Box<dyn FatalHandler>,
    ) -> Result<Arc<HciContext>, Error> {
        let local_addr = config.local_addr;
        let reactor = Arc::new(Reactor::new()?);
        let watchdog_alarm = reactor.new_alarm()?;
        let epilog_alarm = reactor.new_alarm()?;

        let ctx = Arc::new(HciContext {
            state: Mutex::new(LifecycleState::Starting),
            config: config.clone(),
            scheduler: Scheduler::new(),
            correlator: Correlator::new(config.command_pending_timeout),
            reassembler: Mutex::new(Reassembler::new()),
            reactor: reactor.clone(),
            hal: Mutex::new(hal),
            vendor: Mutex::new(vendor),
            fragmenter: Mutex::new(fragmenter),
            low_power,
            upward: UpwardDispatcher::new(upper_callbacks),
            fatal_handler,
            btsnoop: Mutex::new(None),
            firmware_is_configured: AtomicBool::new(false),
            has_shut_down: AtomicBool::new(false),
            watchdog_alarm,
            epilog_alarm,
            thread: Mutex::new(None),
        });

        let hal_notifier: Arc<dyn DataReadyNotifier> = Arc::new(HalNotifierRelay { reactor: reactor.clone() });
        ctx.hal.lock()?.init(hal_notifier);

        let fragment_sink: Arc<dyn FragmentSink> = Arc::new(FragmentSinkRelay { ctx: Mutex::new(Arc::downgrade(&ctx)) });
        ctx.fragmenter.lock()?.init(fragment_sink);

        let relay = Arc::new(VendorCallbackRelay { ctx: Mutex::new(Arc::downgrade(&ctx)), reactor: reactor.clone() });

        if let Err(e) = ctx.vendor.lock()?.open(local_addr, relay) {
            HciContext::shut_down(&ctx);
            return Err(e);
        }

        let thread_ctx = ctx.clone();
        let handle = std::thread::Builder::new()
            .name("hci_thread".into())
            .spawn(move || thread_ctx.run_event_loop())
            .map_err(|e| Error::Other(e.to_string()))?;
        *ctx.thread.lock()? = Some(handle);

        *ctx.state.lock()? = LifecycleState::Starting;
        Ok(ctx)
    }

    fn run_event_loop(self: Arc<HciContext>) {
        loop {
            let events = match self.reactor.poll(None) {
                Ok(events) => events,
                Err(e) => {
                    log::error!("reactor poll failed: {}", e);
                    continue;
                }
            };

            let mut stop = false;
            for event in events {
                if let ReactorEvent::Shutdown = event {
                    stop = true;
                    continue;
                }
                self.handle_reactor_event(event);
            }
            if stop {
                break;
            }
        }
    }

    fn handle_reactor_event(&self, event: ReactorEvent) {
        let touches_watchdog = matches!(event, ReactorEvent::CommandQueueReady | ReactorEvent::HalDataReady(_));

        let result = match event {
            ReactorEvent::CommandQueueReady => {
                let mut fragmenter = match self.fragmenter.lock() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                self.scheduler.drain_command_queue(&self.correlator, &mut **fragmenter, self.low_power.as_ref())
            }
            ReactorEvent::PacketQueueReady => {
                let mut fragmenter = match self.fragmenter.lock() {
                    Ok(f) => f,
                    Err(_) => return,
                };
                self.scheduler.drain_packet_queue(&mut **fragmenter, self.low_power.as_ref())
            }
            ReactorEvent::HalDataReady(packet_type) => self.on_hal_data_ready(packet_type),
            ReactorEvent::LifecycleTask(task) => {
                task();
                Ok(())
            }
            ReactorEvent::AlarmFired(id) => self.on_alarm_fired(id),
            ReactorEvent::Shutdown => Ok(()),
        };

        // `drain_command_queue` and the event-filter path (inside
        // `on_hal_data_ready`) both call `Correlator::restart_watchdog`,
        // which only updates the in-memory deadline; the correlator has no
        // handle to the reactor to rearm the actual timerfd itself, so that
        // coupling happens here.
        if result.is_ok() && touches_watchdog {
            if let Err(e) = self.sync_watchdog_alarm() {
                log::error!("failed to sync watchdog alarm: {}", e);
            }
        }

        if let Err(e) = result {
            log::error!("error handling reactor event: {}", e);
        }
    }

    /// Arm or cancel the watchdog timerfd to match the correlator's current
    /// deadline (§4.B).
    fn sync_watchdog_alarm(&self) -> Result<(), Error> {
        match self.correlator.next_deadline()? {
            Some(deadline) => {
                let now = std::time::Instant::now();
                let remaining = if deadline > now { deadline - now } else { std::time::Duration::from_secs(0) };
                self.reactor.arm_alarm(self.watchdog_alarm, remaining)
            }
            None => self.reactor.cancel_alarm(self.watchdog_alarm),
        }
    }

    fn on_hal_data_ready(&self, packet_type: crate::packet::PacketType) -> Result<(), Error> {
        let hal = self.hal.lock()?;
        let packet = {
            let mut reassembler = self.reassembler.lock()?;
            reassembler.on_data_ready(hal.as_ref(), packet_type)
        };
        drop(hal);

        let packet = match packet {
            Some(packet) => packet,
            None => return Ok(()),
        };

        self.log_btsnoop(Direction::Incoming, &packet);

        let to_forward = if packet_type == crate::packet::PacketType::Event {
            let (consumed, forwarded) =
                crate::event_filter::EventFilter::handle_event(packet, &self.scheduler, &self.correlator)?;
            if consumed {
                // A command-complete/command-status event may have just
                // replaced credits with a positive value; re-drive the
                // command queue so a command left waiting on credit isn't
                // stranded until some unrelated event wakes the reactor
                // (§4.D: "the scheduler must be re-driven").
                if self.scheduler.credits() > 0 && !self.scheduler.command_queue_is_empty()? {
                    self.reactor.post(ReactorEvent::CommandQueueReady)?;
                }
                None
            } else {
                forwarded
            }
        } else {
            Some(packet)
        };

        if let Some(packet) = to_forward {
            let mut fragmenter = self.fragmenter.lock()?;
            fragmenter.reassemble_and_dispatch(packet);
        }
        Ok(())
    }

    fn on_alarm_fired(&self, id: AlarmId) -> Result<(), Error> {
        if id == self.watchdog_alarm {
            let opcode = self.correlator.oldest_opcode()?;
            let message = match opcode {
                Some(opcode) => format!("command-pending watchdog expired for opcode {:#06x}", opcode),
                None => "command-pending watchdog expired with no pending opcode recorded".to_string(),
            };
            self.fatal_handler.on_fatal(&message);
        } else if id == self.epilog_alarm {
            self.stop_thread_from_epilog();
        }
        Ok(())
    }

    /// §4.C admission, forwarded from the public facade.
    pub fn transmit_command(
        &self,
        command: crate::packet::Packet,
        on_complete: Option<crate::scheduler::CompleteCallback>,
        on_status: Option<crate::scheduler::StatusCallback>,
        ctx: Box<dyn std::any::Any + Send>,
    ) -> Result<(), Error> {
        self.scheduler.transmit_command(command, on_complete, on_status, ctx)?;
        self.reactor.post(ReactorEvent::CommandQueueReady)
    }

    pub fn transmit_downward(&self, event_tag: u16, data: crate::packet::Packet) -> Result<(), Error> {
        self.scheduler.transmit_downward(event_tag, data)?;
        self.reactor.post(ReactorEvent::PacketQueueReady)
    }

    pub fn send_low_power_command(&self, cmd: crate::packet::Packet) {
        self.low_power.send_command(cmd);
    }

    pub fn upward_dispatcher(&self) -> &UpwardDispatcher {
        &self.upward
    }

    /// §4.F `turn_on_logging`: install a btsnoop logger at `path`, replacing
    /// any previously installed one.
    pub fn turn_on_logging<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let logger = BtSnoopLogger::open(path).map_err(|e| Error::Other(e.to_string()))?;
        *self.btsnoop.lock()? = Some(logger);
        Ok(())
    }

    /// §4.F `turn_off_logging`: uninstall the logger; subsequent logging
    /// calls become no-ops.
    pub fn turn_off_logging(&self) {
        if let Ok(mut guard) = self.btsnoop.lock() {
            *guard = None;
        }
    }

    /// §4.A "emit to btsnoop" / §6 `transmit_fragment`: log one H4-framed
    /// packet if a logger is currently installed.
    fn log_btsnoop(&self, direction: Direction, packet: &Packet) {
        let h4_type = packet.packet_type().map(PacketType::h4_type).unwrap_or(0);
        if let Ok(mut guard) = self.btsnoop.lock() {
            if let Some(logger) = guard.as_mut() {
                if let Err(e) = logger.log(direction, h4_type, packet.bytes()) {
                    log::warn!("btsnoop log write failed: {}", e);
                }
            }
        }
    }

    pub fn set_chip_power_on(&self, on: bool) -> Result<(), Error> {
        let power = if on { ChipPower::On } else { ChipPower::Off };
        self.vendor.lock()?.set_chip_power(power)
    }

    /// §4.E `do_preload`: post a task that opens the HAL and issues the
    /// async firmware-configure command.
    pub fn do_preload(self: &Arc<HciContext>) -> Result<(), Error> {
        *self.state.lock()? = LifecycleState::Preloading;
        let ctx = self.clone();
        self.reactor.post(ReactorEvent::LifecycleTask(Box::new(move || ctx.run_preload())))
    }

    fn run_preload(&self) {
        if let Err(e) = self.hal.lock().map_err(Error::from).and_then(|mut hal| hal.open()) {
            log::warn!("HAL open failed during preload: {}", e);
        }
        let submission = self.vendor.lock().map_err(Error::from).and_then(|mut vendor| vendor.send_configure_firmware());
        if let Err(e) = submission {
            log::warn!("firmware-configure submission failed: {}", e);
        }
    }

    fn on_firmware_configure_complete(&self, success: bool) {
        self.firmware_is_configured.store(success, Ordering::SeqCst);
        if let Ok(mut state) = self.state.lock() {
            *state = if success { LifecycleState::Configured } else { LifecycleState::Down };
        }
        self.upward.preload_finished(success);
    }

    /// §4.E `do_postload`: post a task that issues the async SCO-configure
    /// command; if submission itself fails, synthesize the failure callback
    /// locally so the chain does not stall.
    pub fn do_postload(self: &Arc<HciContext>) -> Result<(), Error> {
        *self.state.lock()? = LifecycleState::Postloading;
        let ctx = self.clone();
        self.reactor.post(ReactorEvent::LifecycleTask(Box::new(move || ctx.run_postload())))
    }

    fn run_postload(&self) {
        let submission = self.vendor.lock().map_err(Error::from).and_then(|mut vendor| vendor.send_configure_sco());
        if let Err(e) = submission {
            log::warn!("sco-configure submission failed: {}", e);
            self.on_sco_configure_complete(false);
        }
    }

    fn on_sco_configure_complete(&self, success: bool) {
        // The controller's ACL-size fetch this completion would normally
        // trigger is an out-of-scope collaborator (§1); success transitions
        // straight to RUNNING.
        if let Ok(mut state) = self.state.lock() {
            *state = if success { LifecycleState::Running } else { LifecycleState::Down };
        }
    }

    fn on_epilog_complete(&self) {
        self.stop_thread_from_epilog();
    }

    fn stop_thread_from_epilog(&self) {
        if let Ok(mut state) = self.state.lock() {
            *state = LifecycleState::Epiloging;
        }
        let _ = self.reactor.cancel_alarm(self.epilog_alarm);
        let _ = self.reactor.post_shutdown();
    }

    /// §4.E `shut_down`: idempotent via `has_shut_down`.
    pub fn shut_down(self: &Arc<HciContext>) {
        if self.has_shut_down.swap(true, Ordering::SeqCst) {
            log::warn!("shut_down called more than once; ignoring");
            return;
        }

        if self.firmware_is_configured.load(Ordering::SeqCst) {
            let _ = self.reactor.arm_alarm(self.epilog_alarm, self.config.epilog_wait_timeout);
            let vendor_result = self.vendor.lock().map(|mut v| v.send_epilog());
            if !matches!(vendor_result, Ok(Ok(()))) {
                self.stop_thread_from_epilog();
            }
        } else {
            let _ = self.reactor.post_shutdown();
        }

        let handle = self.thread.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        if let Ok(mut vendor) = self.vendor.lock() {
            let _ = vendor.set_chip_power(ChipPower::Off);
            vendor.close();
        }
        if let Ok(mut hal) = self.hal.lock() {
            hal.close();
        }
        if let Ok(mut fragmenter) = self.fragmenter.lock() {
            fragmenter.cleanup();
        }

        if let Ok(mut state) = self.state.lock() {
            *state = LifecycleState::Down;
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("lifecycle state mutex poisoned")
    }

    pub fn firmware_is_configured(&self) -> bool {
        self.firmware_is_configured.load(Ordering::SeqCst)
    }

    pub fn has_shut_down(&self) -> bool {
        self.has_shut_down.load(Ordering::SeqCst)
    }
}
