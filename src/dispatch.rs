// PulseWatch — Event Dispatcher
//
// One blocking wait over a small set of periodic timers and readiness sources.
// Each call to `run_once` waits until at least one source is ready, then runs
// the handler of every ready source exactly once, in the order they became
// ready.  Handlers run to completion before the next wait; there is no
// reentrancy and no other thread ever touches the application context.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::DISPATCH_WAIT_SLICE;
use crate::time::{Clock, Termination};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("timer period must be greater than zero")]
    InvalidPeriod,
    #[error("unknown timer {0:?}")]
    UnknownTimer(TimerId),
    #[error("nothing registered to wait on")]
    NothingToWaitOn,
    #[error("readiness source {name} failed: {reason}")]
    Source { name: &'static str, reason: String },
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(usize);

/// Something the dispatcher can ask "do you have work?" without blocking.
pub trait Readiness {
    fn name(&self) -> &'static str;

    fn poll_ready(&mut self) -> Result<bool, DispatchError>;
}

pub type Handler<C> = Box<dyn FnMut(&mut C, &mut Timers) -> Result<(), DispatchError>>;

struct TimerSlot {
    period: Duration,
    deadline: Instant,
}

/// The timer table, handed to every handler so it can reprogram periods.
pub struct Timers {
    clock: Box<dyn Clock>,
    slots: Vec<TimerSlot>,
}

impl Timers {
    fn new(clock: Box<dyn Clock>) -> Self {
        Self { clock, slots: Vec::new() }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    /// Re-arm `id` to fire every `period`, starting `period` from now.
    pub fn set_period(&mut self, id: TimerId, period: Duration) -> Result<(), DispatchError> {
        if period.is_zero() {
            return Err(DispatchError::InvalidPeriod);
        }
        let now = self.clock.now();
        let slot = self.slots.get_mut(id.0).ok_or(DispatchError::UnknownTimer(id))?;
        slot.period = period;
        slot.deadline = now + period;
        Ok(())
    }

    pub fn period(&self, id: TimerId) -> Option<Duration> {
        self.slots.get(id.0).map(|slot| slot.period)
    }

    fn add(&mut self, period: Duration) -> Result<TimerId, DispatchError> {
        if period.is_zero() {
            return Err(DispatchError::InvalidPeriod);
        }
        let deadline = self.clock.now() + period;
        self.slots.push(TimerSlot { period, deadline });
        Ok(TimerId(self.slots.len() - 1))
    }

    /// Expired timers ordered by deadline.  Each one is re-armed; expirations
    /// that piled up while we were busy collapse into a single dispatch.
    fn take_expired(&mut self, now: Instant) -> Vec<usize> {
        let mut expired: Vec<(Instant, usize)> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.deadline <= now)
            .map(|(index, slot)| (slot.deadline, index))
            .collect();
        expired.sort();

        for &(_, index) in &expired {
            let slot = &mut self.slots[index];
            let next = slot.deadline + slot.period;
            slot.deadline = if next <= now { now + slot.period } else { next };
        }
        expired.into_iter().map(|(_, index)| index).collect()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().map(|slot| slot.deadline).min()
    }
}

struct Source<C> {
    probe: Box<dyn Readiness>,
    handler: Handler<C>,
}

enum Ready {
    Timer(usize),
    Source(usize),
}

pub struct Dispatcher<C> {
    timers: Timers,
    timer_handlers: Vec<Handler<C>>,
    sources: Vec<Source<C>>,
    termination: Termination,
    wait_slice: Duration,
}

impl<C> Dispatcher<C> {
    pub fn new(clock: impl Clock + 'static, termination: Termination) -> Self {
        Self {
            timers: Timers::new(Box::new(clock)),
            timer_handlers: Vec::new(),
            sources: Vec::new(),
            termination,
            wait_slice: DISPATCH_WAIT_SLICE,
        }
    }

    pub fn register_timer<F>(&mut self, period: Duration, handler: F) -> Result<TimerId, DispatchError>
    where
        F: FnMut(&mut C, &mut Timers) -> Result<(), DispatchError> + 'static,
    {
        let id = self.timers.add(period)?;
        self.timer_handlers.push(Box::new(handler));
        Ok(id)
    }

    pub fn register_readiness<R, F>(&mut self, probe: R, handler: F) -> SourceId
    where
        R: Readiness + 'static,
        F: FnMut(&mut C, &mut Timers) -> Result<(), DispatchError> + 'static,
    {
        self.sources.push(Source {
            probe: Box::new(probe),
            handler: Box::new(handler),
        });
        SourceId(self.sources.len() - 1)
    }

    pub fn set_timer_period(&mut self, id: TimerId, period: Duration) -> Result<(), DispatchError> {
        self.timers.set_period(id, period)
    }

    pub fn timers(&self) -> &Timers {
        &self.timers
    }

    pub fn termination(&self) -> &Termination {
        &self.termination
    }

    /// Wait for the next batch of ready sources and dispatch each of them once.
    ///
    /// Returns early without dispatching anything if termination was requested.
    pub fn run_once(&mut self, ctx: &mut C) -> Result<(), DispatchError> {
        for ready in self.wait()? {
            match ready {
                Ready::Timer(index) => (self.timer_handlers[index])(ctx, &mut self.timers)?,
                Ready::Source(index) => (self.sources[index].handler)(ctx, &mut self.timers)?,
            }
        }
        Ok(())
    }

    /// Run until termination is requested or a handler fails.
    pub fn run(&mut self, ctx: &mut C) -> Result<(), DispatchError> {
        while !self.termination.is_requested() {
            self.run_once(ctx)?;
        }
        Ok(())
    }

    fn wait(&mut self) -> Result<Vec<Ready>, DispatchError> {
        if self.timer_handlers.is_empty() && self.sources.is_empty() {
            return Err(DispatchError::NothingToWaitOn);
        }

        loop {
            if self.termination.is_requested() {
                return Ok(Vec::new());
            }

            let now = self.timers.now();
            let mut ready: Vec<Ready> = self
                .timers
                .take_expired(now)
                .into_iter()
                .map(Ready::Timer)
                .collect();
            for (index, source) in self.sources.iter_mut().enumerate() {
                if source.probe.poll_ready()? {
                    log::trace!("source {} ready", source.probe.name());
                    ready.push(Ready::Source(index));
                }
            }
            if !ready.is_empty() {
                return Ok(ready);
            }

            // Sleep no longer than one slice so termination and readiness are
            // re-checked promptly.
            let slice_end = now + self.wait_slice;
            let wake = self
                .timers
                .next_deadline()
                .map_or(slice_end, |deadline| deadline.min(slice_end));
            self.timers.clock.sleep_until(wake);
        }
    }
}
