//! The outbound command flow-control engine (§4.C): queues commands and data
//! packets, honors command credits, and dispatches through the fragmenter.
//! Runs entirely on the event-loop thread except for its admission methods
//! (`transmit_command`/`transmit_downward`), which the upper stack may call
//! from any thread.

use crate::correlator::Correlator;
use crate::error::Error;
use crate::fragmenter::Fragmenter;
use crate::low_power::LowPowerManager;
use crate::packet::{Packet, PacketType};
use std::any::Any;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

pub type CompleteCallback = Box<dyn FnOnce(Packet, Box<dyn Any + Send>) + Send>;
pub type StatusCallback = Box<dyn FnOnce(u8, Packet, Box<dyn Any + Send>) + Send>;

/// What lives in a [`crate::correlator::PendingCommand`]'s opaque context for
/// commands admitted through this scheduler.
///
/// `original_command` is a clone of the packet handed to the fragmenter,
/// kept alive so a command-status callback can be handed the command back
/// (§4.D: "invoke it with (status, original_command, ctx)") even though the
/// fragmenter already took ownership of the copy that went to the HAL.
pub struct CommandWaiter {
    pub original_command: Packet,
    pub on_complete: Option<CompleteCallback>,
    pub on_status: Option<StatusCallback>,
    pub ctx: Box<dyn Any + Send>,
}

struct QueuedCommand {
    opcode: u16,
    packet: Packet,
    on_complete: Option<CompleteCallback>,
    on_status: Option<StatusCallback>,
    ctx: Box<dyn Any + Send>,
}

pub struct Scheduler {
    command_queue: Mutex<VecDeque<QueuedCommand>>,
    packet_queue: Mutex<VecDeque<Packet>>,
    credits: AtomicU16,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            command_queue: Mutex::new(VecDeque::new()),
            packet_queue: Mutex::new(VecDeque::new()),
            credits: AtomicU16::new(crate::config::INITIAL_CREDITS),
        }
    }

    pub fn credits(&self) -> u16 {
        self.credits.load(Ordering::Relaxed)
    }

    /// Replace (never add to) the credit count, per the event-filter's
    /// reading of the command-complete/command-status credit field.
    pub fn replace_credits(&self, value: u16) {
        self.credits.store(value, Ordering::Relaxed);
    }

    /// Admission (§4.C): parse the opcode from the command's first two
    /// bytes, tag it outbound, and enqueue.
    pub fn transmit_command(
        &self,
        mut command: Packet,
        on_complete: Option<CompleteCallback>,
        on_status: Option<StatusCallback>,
        ctx: Box<dyn Any + Send>,
    ) -> Result<(), Error> {
        let bytes = command.bytes();
        let opcode = u16::from_le_bytes([bytes[0], bytes[1]]);
        command.set_event(PacketType::Command.outbound_tag());

        let mut queue = self.command_queue.lock()?;
        queue.push_back(QueuedCommand { opcode, packet: command, on_complete, on_status, ctx });
        Ok(())
    }

    /// Admission (§4.C): a COMMAND tag routes to `transmit_command` with no
    /// callbacks (logging a deprecation warning); everything else goes on
    /// the packet queue untouched by credits.
    pub fn transmit_downward(&self, event_tag: u16, mut data: Packet) -> Result<(), Error> {
        if PacketType::from_tag(event_tag) == Some(PacketType::Command) {
            log::warn!("transmit_downward called with a COMMAND tag; use transmit_command instead");
            return self.transmit_command(data, None, None, Box::new(()));
        }

        data.set_event(event_tag);
        let mut queue = self.packet_queue.lock()?;
        queue.push_back(data);
        Ok(())
    }

    pub fn command_queue_is_empty(&self) -> Result<bool, Error> {
        Ok(self.command_queue.lock()?.is_empty())
    }

    pub fn packet_queue_is_empty(&self) -> Result<bool, Error> {
        Ok(self.packet_queue.lock()?.is_empty())
    }

    /// Command-ready handler (§4.C). Event-loop thread only.
    pub fn drain_command_queue(
        &self,
        correlator: &Correlator,
        fragmenter: &mut dyn Fragmenter,
        low_power: &dyn LowPowerManager,
    ) -> Result<(), Error> {
        if self.credits() == 0 {
            return Ok(());
        }

        let queued = {
            let mut queue = self.command_queue.lock()?;
            queue.pop_front()
        };
        let queued = match queued {
            Some(queued) => queued,
            None => return Ok(()),
        };

        self.credits.fetch_sub(1, Ordering::Relaxed);

        let waiter = CommandWaiter {
            original_command: queued.packet.clone(),
            on_complete: queued.on_complete,
            on_status: queued.on_status,
            ctx: queued.ctx,
        };
        correlator.enqueue_pending(queued.opcode, Box::new(waiter))?;

        low_power.wake_assert();
        fragmenter.fragment_and_dispatch(queued.packet);
        low_power.transmit_done();

        correlator.restart_watchdog()
    }

    /// Data-packet-ready handler (§4.C): not gated by credits, never touches
    /// the pending-response list. Event-loop thread only.
    pub fn drain_packet_queue(&self, fragmenter: &mut dyn Fragmenter, low_power: &dyn LowPowerManager) -> Result<(), Error> {
        let packet = {
            let mut queue = self.packet_queue.lock()?;
            queue.pop_front()
        };
        let packet = match packet {
            Some(packet) => packet,
            None => return Ok(()),
        };

        low_power.wake_assert();
        fragmenter.fragment_and_dispatch(packet);
        low_power.transmit_done();
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::low_power::NoopLowPowerManager;
    use crate::test_support::RecordingFragmenter;
    use std::time::Duration;

    fn command_packet(opcode: u16) -> Packet {
        let mut packet = Packet::with_capacity(4, PacketType::Command.outbound_tag());
        let opcode_bytes = opcode.to_le_bytes();
        packet.bytes_mut()[0] = opcode_bytes[0];
        packet.bytes_mut()[1] = opcode_bytes[1];
        packet.bytes_mut()[2] = 0; // param length
        packet.set_len(3);
        packet
    }

    #[test]
    fn transmit_command_parses_opcode_from_first_two_bytes() {
        let scheduler = Scheduler::new();
        scheduler.transmit_command(command_packet(0x0c03), None, None, Box::new(())).unwrap();
        assert!(!scheduler.command_queue_is_empty().unwrap());
    }

    #[test]
    fn drain_command_queue_does_nothing_without_credits() {
        let scheduler = Scheduler::new();
        scheduler.replace_credits(0);
        scheduler.transmit_command(command_packet(0x0c03), None, None, Box::new(())).unwrap();

        let correlator = Correlator::new(Duration::from_secs(8));
        let mut fragmenter = RecordingFragmenter::new();
        scheduler.drain_command_queue(&correlator, &mut fragmenter, &NoopLowPowerManager).unwrap();

        assert!(!scheduler.command_queue_is_empty().unwrap());
        assert!(correlator.is_empty().unwrap());
    }

    #[test]
    fn drain_command_queue_spends_a_credit_and_enqueues_pending() {
        let scheduler = Scheduler::new();
        scheduler.transmit_command(command_packet(0x0c03), None, None, Box::new(())).unwrap();

        let correlator = Correlator::new(Duration::from_secs(8));
        let mut fragmenter = RecordingFragmenter::new();
        scheduler.drain_command_queue(&correlator, &mut fragmenter, &NoopLowPowerManager).unwrap();

        assert_eq!(scheduler.credits(), 0);
        assert_eq!(correlator.len().unwrap(), 1);
        assert_eq!(fragmenter.dispatched.len(), 1);
    }

    #[test]
    fn transmit_downward_with_command_tag_routes_through_transmit_command() {
        let scheduler = Scheduler::new();
        let packet = Packet::with_capacity(3, 0);
        scheduler.transmit_downward(PacketType::Command.outbound_tag(), packet).unwrap();

        assert!(!scheduler.command_queue_is_empty().unwrap());
        assert!(scheduler.packet_queue_is_empty().unwrap());
    }

    #[test]
    fn transmit_downward_with_acl_tag_goes_on_packet_queue() {
        let scheduler = Scheduler::new();
        let packet = Packet::with_capacity(4, 0);
        scheduler.transmit_downward(PacketType::Acl.outbound_tag(), packet).unwrap();

        assert!(scheduler.command_queue_is_empty().unwrap());
        assert!(!scheduler.packet_queue_is_empty().unwrap());
    }

    #[test]
    fn drain_packet_queue_ignores_credits() {
        let scheduler = Scheduler::new();
        scheduler.replace_credits(0);
        scheduler.transmit_downward(PacketType::Acl.outbound_tag(), Packet::with_capacity(4, 0)).unwrap();

        let mut fragmenter = RecordingFragmenter::new();
        scheduler.drain_packet_queue(&mut fragmenter, &NoopLowPowerManager).unwrap();

        assert!(scheduler.packet_queue_is_empty().unwrap());
        assert_eq!(fragmenter.dispatched.len(), 1);
    }
}
