//! Inspects inbound EVENT packets for command-complete/command-status,
//! updates credits, and feeds the correlator (§4.D).

use crate::correlator::Correlator;
use crate::error::Error;
use crate::packet::Packet;
use crate::scheduler::{CommandWaiter, Scheduler};
use std::any::Any;

const EVENT_COMMAND_COMPLETE: u8 = 0x0e;
const EVENT_COMMAND_STATUS: u8 = 0x0f;

/// Minimum body length (event code + paramLen + credits + opcode) for a
/// well-formed command-complete event; a shorter packet under-claims its own
/// `paramLen` and must not be indexed into.
const COMMAND_COMPLETE_MIN_LEN: usize = 5;

/// As [`COMMAND_COMPLETE_MIN_LEN`], for command-status (status + credits +
/// opcode after the event code and paramLen).
const COMMAND_STATUS_MIN_LEN: usize = 6;

/// Stateless: every operation it needs (credits, the pending-response list)
/// lives in the [`Scheduler`]/[`Correlator`] it is handed.
pub struct EventFilter;

impl EventFilter {
    /// Inspect `packet`. Returns `true` when the event was command-complete
    /// or command-status and has been fully consumed — the reassembler must
    /// not forward it upward in that case. Every other event code returns
    /// `false` unconsumed, `packet` still intact for the caller to forward.
    pub fn handle_event(packet: Packet, scheduler: &Scheduler, correlator: &Correlator) -> Result<(bool, Option<Packet>), Error> {
        if packet.bytes().is_empty() {
            return Ok((false, Some(packet)));
        }
        let event_code = packet.bytes()[0];

        match event_code {
            EVENT_COMMAND_COMPLETE if packet.bytes().len() < COMMAND_COMPLETE_MIN_LEN => {
                log::warn!(
                    "command-complete event too short ({} bytes); forwarding unconsumed",
                    packet.bytes().len()
                );
                Ok((false, Some(packet)))
            }

            EVENT_COMMAND_STATUS if packet.bytes().len() < COMMAND_STATUS_MIN_LEN => {
                log::warn!(
                    "command-status event too short ({} bytes); forwarding unconsumed",
                    packet.bytes().len()
                );
                Ok((false, Some(packet)))
            }

            EVENT_COMMAND_COMPLETE => {
                let (credits, opcode) = {
                    let bytes = packet.bytes();
                    (bytes[2] as u16, u16::from_le_bytes([bytes[3], bytes[4]]))
                };
                scheduler.replace_credits(credits);

                match correlator.take_pending_by_opcode(opcode)? {
                    Some(pending) => {
                        let waiter = downcast_waiter(pending.context);
                        if let Some(on_complete) = waiter.on_complete {
                            on_complete(packet, waiter.ctx);
                        }
                        // No completion callback: `packet` and `waiter.ctx` are
                        // simply dropped here.
                    }
                    None => {
                        log::warn!("command-complete for opcode {:#06x} with no pending command", opcode);
                    }
                }

                correlator.restart_watchdog()?;
                Ok((true, None))
            }

            EVENT_COMMAND_STATUS => {
                let (status, credits, opcode) = {
                    let bytes = packet.bytes();
                    (bytes[2], bytes[3] as u16, u16::from_le_bytes([bytes[4], bytes[5]]))
                };
                scheduler.replace_credits(credits);

                match correlator.take_pending_by_opcode(opcode)? {
                    Some(pending) => {
                        let waiter = downcast_waiter(pending.context);
                        if let Some(on_status) = waiter.on_status {
                            on_status(status, waiter.original_command, waiter.ctx);
                        }
                        // No status callback: `waiter.original_command` and
                        // `waiter.ctx` are simply dropped here.
                    }
                    None => {
                        log::warn!("command-status for opcode {:#06x} with no pending command", opcode);
                    }
                }
                // The inbound status packet itself is always freed, never
                // forwarded to a callback.

                correlator.restart_watchdog()?;
                Ok((true, None))
            }

            _ => Ok((false, Some(packet))),
        }
    }
}

fn downcast_waiter(context: Box<dyn Any + Send>) -> CommandWaiter {
    *context.downcast::<CommandWaiter>().expect("pending command context is always a CommandWaiter")
}
