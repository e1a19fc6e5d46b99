use std::cmp::min;
use std::time::Duration;
use tracing::trace;
use crate::config::RetransmitPolicy;
use crate::connection::ConnectionState;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TimerKind {
    Connect,
    Retransmit,
    Close,
    TimeWait,
}

impl TimerKind {
    pub const ALL: [TimerKind; 4] = [TimerKind::Connect, TimerKind::Retransmit, TimerKind::Close, TimerKind::TimeWait];

    fn index(&self) -> usize {
        match self {
            TimerKind::Connect => 0,
            TimerKind::Retransmit => 1,
            TimerKind::Close => 2,
            TimerKind::TimeWait => 3,
        }
    }

    /// A timer that fires in any other state is stale and must not do anything, even if it was
    ///  not stopped in time
    pub fn applies_in(&self, state: ConnectionState) -> bool {
        use ConnectionState::*;

        match self {
            TimerKind::Connect => matches!(state, Request | Respond),
            TimerKind::Retransmit => matches!(state, Request | Respond | ClientClose | ServerClose),
            TimerKind::Close => matches!(state, ClientClose | ServerClose),
            TimerKind::TimeWait => matches!(state, TimeWait),
        }
    }
}

/// What the driver needs to do to make the scheduled timers match the connection's view
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimerCommand {
    Arm { kind: TimerKind, epoch: u64, delay: Duration },
    Stop { kind: TimerKind },
}

/// Bookkeeping for the four connection timers. The connection only records which timers are
///  armed; actually waiting is the driver's job, which picks up the resulting commands through
///  [`Timers::take_commands`] and reports expiry with the epoch it was armed with.
#[derive(Debug, Default)]
pub struct Timers {
    armed: [Option<u64>; 4],
    epochs: [u64; 4],
    commands: Vec<TimerCommand>,
}

impl Timers {
    /// Re-arming a running timer replaces it
    pub fn arm(&mut self, kind: TimerKind, delay: Duration) {
        let idx = kind.index();
        self.epochs[idx] += 1;
        self.armed[idx] = Some(self.epochs[idx]);
        trace!("arming {:?} timer for {:?}", kind, delay);
        self.commands.push(TimerCommand::Arm { kind, epoch: self.epochs[idx], delay });
    }

    /// Stopping a timer that is not armed does nothing
    pub fn stop(&mut self, kind: TimerKind) {
        if self.armed[kind.index()].take().is_some() {
            trace!("stopping {:?} timer", kind);
            self.commands.push(TimerCommand::Stop { kind });
        }
    }

    pub fn stop_all(&mut self) {
        for kind in TimerKind::ALL {
            self.stop(kind);
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.armed[kind.index()].is_some()
    }

    /// Consumes the arming if `epoch` is the current one. Timers are one-shot.
    #[must_use]
    pub fn fire(&mut self, kind: TimerKind, epoch: u64) -> bool {
        let slot = &mut self.armed[kind.index()];
        if *slot == Some(epoch) {
            *slot = None;
            true
        }
        else {
            false
        }
    }

    pub fn take_commands(&mut self) -> Vec<TimerCommand> {
        std::mem::take(&mut self.commands)
    }
}

/// The retransmission interval for control segments: it grows by a fixed-point factor (in
///  eighths) with every retransmission, up to a configured maximum
#[derive(Debug)]
pub struct RetransmitBackoff {
    interval: Duration,
    config_max_interval: Duration,
    config_factor_eighths: u32,
}

impl RetransmitBackoff {
    pub fn new(policy: &RetransmitPolicy) -> RetransmitBackoff {
        RetransmitBackoff {
            interval: policy.initial_interval,
            config_max_interval: policy.max_interval,
            config_factor_eighths: policy.factor_eighths.max(8),
        }
    }

    pub fn reset(&mut self, initial: Duration) {
        self.interval = min(initial, self.config_max_interval);
    }

    pub fn current(&self) -> Duration {
        self.interval
    }

    /// grows the interval and returns the new value
    pub fn next(&mut self) -> Duration {
        self.interval = (self.interval * self.config_factor_eighths) / 8;
        self.interval = min(self.interval, self.config_max_interval);
        self.interval
    }
}
