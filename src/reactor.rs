//! The epoll-based single-threaded reactor the event-loop thread
//! ("hci_thread") runs on (§4.G). Generalizes the teacher's
//! `AdapterThread`/`EPollResult`/`TimeoutManager` trio: one `epoll` instance,
//! one `eventfd`-backed wakeup channel for posted work, and any number of
//! one-shot `timerfd` alarms (the command watchdog, the epilog wait).

use crate::error::Error;
use crate::packet::PacketType;
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::sys::eventfd::{eventfd, EfdFlags};
use nix::unistd::{close, read, write};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// An owned raw fd, closed on drop. Mirrors the teacher's `FileDescriptor`.
struct OwnedFd(RawFd);

impl OwnedFd {
    fn raw(&self) -> RawFd {
        self.0
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlarmId(u32);

/// A one-shot timer backed by a Linux `timerfd`.
struct Alarm {
    fd: OwnedFd,
}

impl Alarm {
    fn new() -> Result<Self, Error> {
        let fd = unsafe { nix::libc::timerfd_create(nix::libc::CLOCK_MONOTONIC, nix::libc::TFD_NONBLOCK) };
        if fd < 0 {
            return Err(Error::from(nix::errno::Errno::last()));
        }
        Ok(Alarm { fd: OwnedFd(fd) })
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.raw()
    }

    /// Arm a one-shot expiry `duration` from now, replacing whatever was
    /// previously armed.
    fn set(&self, duration: Duration) -> Result<(), Error> {
        let spec = nix::libc::itimerspec {
            it_interval: nix::libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: nix::libc::timespec {
                tv_sec: duration.as_secs() as nix::libc::time_t,
                tv_nsec: i64::from(duration.subsec_nanos()) as nix::libc::c_long,
            },
        };
        let ret = unsafe { nix::libc::timerfd_settime(self.fd.raw(), 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(Error::from(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// Disarm; a disarmed alarm never fires.
    fn cancel(&self) -> Result<(), Error> {
        let spec = nix::libc::itimerspec {
            it_interval: nix::libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: nix::libc::timespec { tv_sec: 0, tv_nsec: 0 },
        };
        let ret = unsafe { nix::libc::timerfd_settime(self.fd.raw(), 0, &spec, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(Error::from(nix::errno::Errno::last()));
        }
        Ok(())
    }

    /// Drain the expiration counter so the fd stops reporting readable.
    fn drain(&self) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        match read(self.fd.raw(), &mut buf) {
            Ok(_) => Ok(()),
            Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => Ok(()),
            Err(e) => Err(Error::from(e)),
        }
    }
}

/// The generalized form of the teacher's `EPollResult`: one variant per kind
/// of thing the event-loop thread reacts to.
pub enum ReactorEvent {
    CommandQueueReady,
    PacketQueueReady,
    HalDataReady(PacketType),
    /// Arbitrary work posted from another thread (`do_preload`, `do_postload`,
    /// ...), generalizing the teacher's exit-only `eventfd` signal.
    LifecycleTask(Box<dyn FnOnce() + Send>),
    AlarmFired(AlarmId),
    Shutdown,
}

enum Registration {
    Wakeup,
    HalData(PacketType),
    Alarm(AlarmId),
    Shutdown,
}

/// Owns one `epoll` instance, the `eventfd` wakeup channel other threads post
/// through, and every registered alarm.
pub struct Reactor {
    epoll_fd: OwnedFd,
    wakeup: OwnedFd,
    shutdown: OwnedFd,
    posted: Mutex<VecDeque<ReactorEvent>>,
    registrations: Mutex<HashMap<RawFd, Registration>>,
    alarms: Mutex<HashMap<AlarmId, Alarm>>,
    next_alarm_id: AtomicU32,
}

impl Reactor {
    pub fn new() -> Result<Self, Error> {
        let epoll_fd = epoll_create1(EpollCreateFlags::empty())?;
        let wakeup_fd = eventfd(0, EfdFlags::EFD_NONBLOCK)?;
        let shutdown_fd = eventfd(0, EfdFlags::EFD_NONBLOCK)?;

        let reactor = Reactor {
            epoll_fd: OwnedFd(epoll_fd),
            wakeup: OwnedFd(wakeup_fd),
            shutdown: OwnedFd(shutdown_fd),
            posted: Mutex::new(VecDeque::new()),
            registrations: Mutex::new(HashMap::new()),
            alarms: Mutex::new(HashMap::new()),
            next_alarm_id: AtomicU32::new(0),
        };

        reactor.register_fd(reactor.wakeup.raw(), Registration::Wakeup)?;
        reactor.register_fd(reactor.shutdown.raw(), Registration::Shutdown)?;
        Ok(reactor)
    }

    fn register_fd(&self, fd: RawFd, registration: Registration) -> Result<(), Error> {
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN, fd as u64);
        epoll_ctl(self.epoll_fd.raw(), EpollOp::EpollCtlAdd, fd, &mut event)?;
        self.registrations.lock()?.insert(fd, registration);
        Ok(())
    }

    fn deregister_fd(&self, fd: RawFd) -> Result<(), Error> {
        epoll_ctl(self.epoll_fd.raw(), EpollOp::EpollCtlDel, fd, None)?;
        self.registrations.lock()?.remove(&fd);
        Ok(())
    }

    /// Bind the HAL's readiness fd for `packet_type` into the reactor.
    pub fn register_hal_fd(&self, fd: RawFd, packet_type: PacketType) -> Result<(), Error> {
        self.register_fd(fd, Registration::HalData(packet_type))
    }

    /// Allocate a new, disarmed alarm.
    pub fn new_alarm(&self) -> Result<AlarmId, Error> {
        let alarm = Alarm::new()?;
        let id = AlarmId(self.next_alarm_id.fetch_add(1, Ordering::Relaxed));
        self.register_fd(alarm.raw_fd(), Registration::Alarm(id))?;
        self.alarms.lock()?.insert(id, alarm);
        Ok(id)
    }

    pub fn arm_alarm(&self, id: AlarmId, duration: Duration) -> Result<(), Error> {
        let alarms = self.alarms.lock()?;
        match alarms.get(&id) {
            Some(alarm) => alarm.set(duration),
            None => Err(Error::Other(format!("unknown alarm {:?}", id))),
        }
    }

    pub fn cancel_alarm(&self, id: AlarmId) -> Result<(), Error> {
        let alarms = self.alarms.lock()?;
        match alarms.get(&id) {
            Some(alarm) => alarm.cancel(),
            None => Err(Error::Other(format!("unknown alarm {:?}", id))),
        }
    }

    pub fn free_alarm(&self, id: AlarmId) -> Result<(), Error> {
        let mut alarms = self.alarms.lock()?;
        if let Some(alarm) = alarms.remove(&id) {
            self.deregister_fd(alarm.raw_fd())?;
        }
        Ok(())
    }

    /// Post one event from any thread. Wakes the reactor if it is currently
    /// blocked in `poll`.
    pub fn post(&self, event: ReactorEvent) -> Result<(), Error> {
        self.posted.lock()?.push_back(event);
        let _ = write(self.wakeup.raw(), &1u64.to_ne_bytes());
        Ok(())
    }

    /// Ask the reactor to stop after its current `poll` call returns.
    pub fn post_shutdown(&self) -> Result<(), Error> {
        let _ = write(self.shutdown.raw(), &1u64.to_ne_bytes());
        Ok(())
    }

    /// Block in `epoll_wait` until at least one registered fd is ready (or
    /// `timeout` elapses), then drain every fd that fired into a batch of
    /// [`ReactorEvent`]s for the caller to process in order. Mirrors
    /// `AdapterThread::task`'s `match EPollResult::from(...)` loop body.
    pub fn poll(&self, timeout: Option<Duration>) -> Result<Vec<ReactorEvent>, Error> {
        let mut raw_events = [EpollEvent::empty(); 16];
        let timeout_ms = match timeout {
            Some(d) => d.as_millis() as isize,
            None => -1,
        };

        let ready = epoll_wait(self.epoll_fd.raw(), &mut raw_events, timeout_ms)?;
        let mut out = Vec::with_capacity(ready);

        for raw in &raw_events[..ready] {
            let fd = raw.data() as RawFd;
            let registration = {
                let registrations = self.registrations.lock()?;
                match registrations.get(&fd) {
                    Some(Registration::Wakeup) => Some(Registration::Wakeup),
                    Some(Registration::Shutdown) => Some(Registration::Shutdown),
                    Some(Registration::HalData(packet_type)) => Some(Registration::HalData(*packet_type)),
                    Some(Registration::Alarm(id)) => Some(Registration::Alarm(*id)),
                    None => None,
                }
            };

            match registration {
                Some(Registration::Wakeup) => {
                    let _ = drain_eventfd(fd);
                    let mut posted = self.posted.lock()?;
                    out.extend(posted.drain(..));
                }
                Some(Registration::Shutdown) => {
                    let _ = drain_eventfd(fd);
                    out.push(ReactorEvent::Shutdown);
                }
                Some(Registration::HalData(packet_type)) => {
                    out.push(ReactorEvent::HalDataReady(packet_type));
                }
                Some(Registration::Alarm(id)) => {
                    if let Some(alarm) = self.alarms.lock()?.get(&id) {
                        let _ = alarm.drain();
                    }
                    out.push(ReactorEvent::AlarmFired(id));
                }
                None => {
                    log::warn!("epoll reported an unregistered fd {}", fd);
                }
            }
        }

        Ok(out)
    }
}

fn drain_eventfd(fd: RawFd) -> Result<(), Error> {
    let mut buf = [0u8; 8];
    match read(fd, &mut buf) {
        Ok(_) => Ok(()),
        Err(nix::Error::Sys(nix::errno::Errno::EAGAIN)) => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}
