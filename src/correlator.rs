//! Command/response correlation and the command-pending watchdog (§4.B).
//!
//! Commands are matched to their command-complete/command-status event by
//! scanning the pending-response list oldest-first for a matching opcode,
//! not strictly by queue position — credits can leave more than one opcode
//! outstanding at once. [`Correlator::oldest_opcode`] copies the watchdog's
//! opcode out under the lock instead of returning a reference that could be
//! read after the lock is released, fixing the unlock-then-deref hazard
//! noted for the timeout path.

use crate::error::Error;
use std::any::Any;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A command awaiting its command-complete/command-status event.
///
/// `context` is opaque to the correlator; [`crate::scheduler::CommandWaiter`]
/// is what actually lives in it for this crate's own commands.
pub struct PendingCommand {
    pub opcode: u16,
    pub context: Box<dyn Any + Send>,
}

struct Inner {
    queue: VecDeque<PendingCommand>,
    deadline: Option<Instant>,
}

/// Tracks outstanding commands and the single watchdog deadline that covers
/// the pending-response list as a whole.
pub struct Correlator {
    inner: Mutex<Inner>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Correlator { inner: Mutex::new(Inner { queue: VecDeque::new(), deadline: None }), timeout }
    }

    /// Append to the pending-response list (tail).
    pub fn enqueue_pending(&self, opcode: u16, context: Box<dyn Any + Send>) -> Result<(), Error> {
        let mut inner = self.inner.lock()?;
        inner.queue.push_back(PendingCommand { opcode, context });
        Ok(())
    }

    /// Scan oldest-first and remove the first entry whose opcode matches.
    pub fn take_pending_by_opcode(&self, opcode: u16) -> Result<Option<PendingCommand>, Error> {
        let mut inner = self.inner.lock()?;
        let position = inner.queue.iter().position(|pending| pending.opcode == opcode);
        Ok(position.and_then(|i| inner.queue.remove(i)))
    }

    /// Cancel the watchdog if the pending-response list is now empty;
    /// otherwise rearm it for a fresh command-pending timeout.
    pub fn restart_watchdog(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock()?;
        inner.deadline = if inner.queue.is_empty() { None } else { Some(Instant::now() + self.timeout) };
        Ok(())
    }

    /// True if the watchdog deadline has passed as of `now`.
    pub fn is_expired(&self, now: Instant) -> Result<bool, Error> {
        let inner = self.inner.lock()?;
        Ok(matches!(inner.deadline, Some(deadline) if now >= deadline))
    }

    /// The deadline to arm the reactor's alarm against, if any command is
    /// outstanding.
    pub fn next_deadline(&self) -> Result<Option<Instant>, Error> {
        let inner = self.inner.lock()?;
        Ok(inner.deadline)
    }

    /// The opcode of the oldest pending command, for the watchdog's fatal
    /// log message. Copied out under the lock; the `PendingCommand` itself
    /// never escapes.
    pub fn oldest_opcode(&self) -> Result<Option<u16>, Error> {
        let inner = self.inner.lock()?;
        Ok(inner.queue.front().map(|pending| pending.opcode))
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        let inner = self.inner.lock()?;
        Ok(inner.queue.is_empty())
    }

    pub fn len(&self) -> Result<usize, Error> {
        let inner = self.inner.lock()?;
        Ok(inner.queue.len())
    }
}

/// Invoked when the command-pending watchdog expires. Per the Non-goal
/// "retrying a timed-out command is out of scope", expiry is always fatal;
/// this trait only exists so tests can observe that fact instead of the
/// process actually exiting.
pub trait FatalHandler: Send + Sync {
    fn on_fatal(&self, message: &str);
}

/// Production [`FatalHandler`]: log, give the line time to reach disk, exit.
pub struct ProcessKillFatalHandler {
    post_kill_sleep: Duration,
}

impl ProcessKillFatalHandler {
    pub fn new(post_kill_sleep: Duration) -> Self {
        ProcessKillFatalHandler { post_kill_sleep }
    }
}

impl Default for ProcessKillFatalHandler {
    fn default() -> Self {
        ProcessKillFatalHandler { post_kill_sleep: crate::config::POST_KILL_SLEEP }
    }
}

impl FatalHandler for ProcessKillFatalHandler {
    fn on_fatal(&self, message: &str) {
        log::error!("{}", message);
        std::thread::sleep(self.post_kill_sleep);
        std::process::exit(1);
    }
}
