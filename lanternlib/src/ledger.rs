//! Correlation of telecommands with their acknowledgments and replies
//!
//! The ledger is shared between the caller threads, which push commands and
//! wait for their outcome, and the receive loop, which pushes telemetry. All
//! state lives behind one mutex; every mutation wakes the waiters.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};

use lanternlibgs::{LanternError, LanternResult, Packet};

use crate::config::constants::{DEFAULT_MAX_COMMANDS, DEFAULT_MAX_TELEMETRY};

/// Error name of a successful execution acknowledgment
pub const ACK_OK: &str = "OK";

/// A telecommand and the telemetry that refers to it
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub packet_id: i64,
    pub command_id: i64,
    pub packet: Packet,
    /// Execution acknowledgment, set once
    pub ack: Option<Packet>,
    /// Reply fragments in arrival order
    pub replies: Vec<Packet>,
}

impl CommandRecord {
    pub fn new(packet: Packet) -> LanternResult<Self> {
        let packet_id = packet.header_field("packet_id")?;
        let command_id = packet.data_field("command_id")?;
        Ok(Self {
            packet_id,
            command_id,
            packet,
            ack: None,
            replies: Vec::new(),
        })
    }

    /// Outcome of the execution acknowledgment, `None` while pending
    pub fn outcome(&self) -> Option<LanternResult<()>> {
        self.ack.as_ref().map(|ack| match ack.error_name() {
            Some(ACK_OK) => Ok(()),
            Some(name) => Err(LanternError::Rejected(name.to_string())),
            None => Err(LanternError::malformed("acknowledgment without error field")),
        })
    }
}

struct LedgerState {
    commands: VecDeque<CommandRecord>,
    telemetry: VecDeque<Packet>,
}

struct CondPair<T> {
    lock: Mutex<T>,
    cvar: Condvar,
}

/// Bounded record of commands sent and telemetry received
pub struct Ledger {
    pair: CondPair<LedgerState>,
    max_commands: usize,
    max_telemetry: usize,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_COMMANDS, DEFAULT_MAX_TELEMETRY)
    }
}

impl Ledger {
    /// Ledger keeping at most `max_commands` records and `max_telemetry`
    /// packets. Zero limits are raised to one.
    pub fn new(max_commands: usize, max_telemetry: usize) -> Self {
        Self {
            pair: CondPair {
                lock: Mutex::new(LedgerState {
                    commands: VecDeque::new(),
                    telemetry: VecDeque::new(),
                }),
                cvar: Condvar::new(),
            },
            max_commands: max_commands.max(1),
            max_telemetry: max_telemetry.max(1),
        }
    }

    fn state(&self) -> LanternResult<MutexGuard<'_, LedgerState>> {
        Ok(self.pair.lock.lock()?)
    }

    /// Record a command that was just sent
    pub fn push_tc(&self, record: CommandRecord) -> LanternResult<()> {
        let mut state = self.state()?;

        // A wrapped packet id makes an older record unreachable
        if let Some(pos) = state.commands.iter().position(|r| r.packet_id == record.packet_id) {
            warn!(
                "Packet id {} reused, dropping the record of command {}",
                record.packet_id, state.commands[pos].command_id
            );
            state.commands.remove(pos);
        }
        state.commands.push_back(record);
        while state.commands.len() > self.max_commands {
            state.commands.pop_front();
        }

        drop(state);
        self.pair.cvar.notify_all();
        Ok(())
    }

    /// Remove the record of a command that never left
    pub(crate) fn discard_tc(&self, packet_id: i64) -> LanternResult<()> {
        let mut state = self.state()?;
        if let Some(pos) = state.commands.iter().rposition(|r| r.packet_id == packet_id) {
            state.commands.remove(pos);
        }
        Ok(())
    }

    /// Record telemetry and attach acknowledgments and replies to their command
    pub fn push_tm(&self, packet: Packet, is_ack: bool, is_reply: bool) -> LanternResult<()> {
        let mut state = self.state()?;

        if is_ack || is_reply {
            match packet.correlation_id() {
                Some(id) => match state.commands.iter_mut().find(|r| r.packet_id == id) {
                    Some(record) => {
                        if is_ack {
                            if record.ack.is_none() {
                                record.ack = Some(packet.clone());
                            } else {
                                debug!("Duplicate acknowledgment for packet {} ignored", id);
                            }
                        }
                        if is_reply {
                            record.replies.push(packet.clone());
                        }
                    }
                    None => warn!("No command with packet id {} for incoming telemetry", id),
                },
                None => warn!("Acknowledgment or reply without packet_id: {:?}", packet.data),
            }
        }

        state.telemetry.push_back(packet);
        while state.telemetry.len() > self.max_telemetry {
            state.telemetry.pop_front();
        }

        drop(state);
        self.pair.cvar.notify_all();
        Ok(())
    }

    /// Wait until the most recent command is acknowledged
    ///
    /// Returns `Ok` for an `OK` acknowledgment, [`LanternError::Rejected`]
    /// carrying the error name otherwise, and [`LanternError::Timeout`] when
    /// nothing arrives within `timeout`.
    pub fn validate_last_tc(&self, timeout: Duration) -> LanternResult<()> {
        self.wait_last(timeout, |_| true).map(|_| ())
    }

    /// Wait until the most recent command is acknowledged and its reply
    /// fragments satisfy `complete`, then return a snapshot of the record
    pub fn wait_last_reply<F>(&self, timeout: Duration, complete: F) -> LanternResult<CommandRecord>
    where
        F: Fn(&[Packet]) -> bool,
    {
        self.wait_last(timeout, |record| complete(&record.replies))
    }

    fn wait_last<F>(&self, timeout: Duration, ready: F) -> LanternResult<CommandRecord>
    where
        F: Fn(&CommandRecord) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state()?;

        loop {
            let last = state.commands.back().ok_or(LanternError::NoCommand)?;
            match last.outcome() {
                Some(Err(e)) => return Err(e),
                Some(Ok(())) if ready(last) => return Ok(last.clone()),
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LanternError::Timeout);
            }
            let (guard, _) = self.pair.cvar.wait_timeout(state, deadline - now)?;
            state = guard;
        }
    }

    /// Snapshot of the most recent command
    pub fn last_tc(&self) -> LanternResult<Option<CommandRecord>> {
        Ok(self.state()?.commands.back().cloned())
    }

    pub fn find_tc(&self, packet_id: i64) -> LanternResult<Option<CommandRecord>> {
        Ok(self
            .state()?
            .commands
            .iter()
            .find(|r| r.packet_id == packet_id)
            .cloned())
    }

    /// Snapshot of the retained telemetry, oldest first
    pub fn telemetry(&self) -> LanternResult<Vec<Packet>> {
        Ok(self.state()?.telemetry.iter().cloned().collect())
    }

    pub fn len_tc(&self) -> LanternResult<usize> {
        Ok(self.state()?.commands.len())
    }

    pub fn len_tm(&self) -> LanternResult<usize> {
        Ok(self.state()?.telemetry.len())
    }
}
