// PulseWatch — Test Doubles
//
// Fakes shared by the unit tests: a hand-advanced clock, scripted GPIO, a
// recording transport, a scripted provisioner/client pair, a fake PPG sensor
// and a scripted signal processor.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use embedded_hal::digital::{self, ErrorKind, ErrorType, InputPin, OutputPin};

use crate::cloud::{ClientError, IotClient, NetworkError, NetworkStatus, ProvisioningError, Provisioner};
use crate::drivers::{PpgSensor, SensorError};
use crate::events::{ClientEvent, PpgSample, SensorInfo};
use crate::spo2::{Estimate, SignalProcessor};
use crate::tasks::{SendError, Transport};
use crate::time::Clock;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to (or when something sleeps on it).
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Rc::default(),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset.set(self.offset.get() + by);
    }

    pub fn elapsed(&self) -> Duration {
        self.offset.get()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + self.offset.get()
    }

    fn sleep_until(&self, deadline: Instant) {
        let target = deadline.saturating_duration_since(self.base);
        if target > self.offset.get() {
            self.offset.set(target);
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinFault;

impl digital::Error for PinFault {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Other
    }
}

/// Input pin replaying a fixed level sequence, then holding the last level.
#[derive(Debug)]
pub struct ScriptedPin {
    levels: VecDeque<bool>,
    last: bool,
    fail: bool,
}

impl ScriptedPin {
    pub fn levels(levels: impl IntoIterator<Item = bool>) -> Self {
        Self {
            levels: levels.into_iter().collect(),
            last: true,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::levels([])
        }
    }

    fn next(&mut self) -> Result<bool, PinFault> {
        if self.fail {
            return Err(PinFault);
        }
        if let Some(level) = self.levels.pop_front() {
            self.last = level;
        }
        Ok(self.last)
    }
}

impl ErrorType for ScriptedPin {
    type Error = PinFault;
}

impl InputPin for ScriptedPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.next()
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.next().map(|high| !high)
    }
}

/// Output pin recording every level written (`true` = high).
#[derive(Debug, Clone, Default)]
pub struct RecordingPin {
    history: Rc<RefCell<Vec<bool>>>,
    fail: Rc<Cell<bool>>,
}

impl RecordingPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> Vec<bool> {
        self.history.borrow().clone()
    }

    pub fn level(&self) -> Option<bool> {
        self.history.borrow().last().copied()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail.set(fail);
    }

    fn write(&mut self, high: bool) -> Result<(), PinFault> {
        if self.fail.get() {
            return Err(PinFault);
        }
        self.history.borrow_mut().push(high);
        Ok(())
    }
}

impl ErrorType for RecordingPin {
    type Error = PinFault;
}

impl OutputPin for RecordingPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub events: Vec<String>,
    pub reports: Vec<String>,
    /// Refuse every hand-off with `SendError::NotConnected`.
    pub fail: bool,
}

impl Transport for RecordingTransport {
    fn send_event(&mut self, message: &str) -> Result<(), SendError> {
        if self.fail {
            return Err(SendError::NotConnected);
        }
        self.events.push(message.to_owned());
        Ok(())
    }

    fn report_state(&mut self, document: &str) -> Result<(), SendError> {
        if self.fail {
            return Err(SendError::NotConnected);
        }
        self.reports.push(document.to_owned());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

/// Network whose readiness answers follow a script, repeating the last one.
#[derive(Debug)]
pub struct ScriptedNetwork {
    answers: VecDeque<Result<bool, NetworkError>>,
    last: Result<bool, NetworkError>,
}

impl ScriptedNetwork {
    pub fn ready() -> Self {
        Self::script([Ok(true)])
    }

    pub fn script(answers: impl IntoIterator<Item = Result<bool, NetworkError>>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            last: Ok(true),
        }
    }
}

impl NetworkStatus for ScriptedNetwork {
    fn is_ready(&mut self) -> Result<bool, NetworkError> {
        if let Some(answer) = self.answers.pop_front() {
            self.last = answer;
        }
        self.last.clone()
    }
}

/// Provisioner following a script of outcomes; succeeds once it runs out.
#[derive(Debug, Default)]
pub struct ScriptedProvisioner {
    outcomes: VecDeque<Result<(), ProvisioningError>>,
    attempts: u32,
    last_scope_id: Option<String>,
}

impl ScriptedProvisioner {
    pub fn failing(times: usize) -> Self {
        Self::script((0..times).map(|_| Err(ProvisioningError::Generic("refused".into()))))
    }

    pub fn script(outcomes: impl IntoIterator<Item = Result<(), ProvisioningError>>) -> Self {
        Self {
            outcomes: outcomes.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_scope_id(&self) -> Option<String> {
        self.last_scope_id.clone()
    }
}

impl Provisioner for ScriptedProvisioner {
    type Client = ScriptedClient;

    fn provision(&mut self, scope_id: &str, _timeout: Duration) -> Result<ScriptedClient, ProvisioningError> {
        self.attempts += 1;
        self.last_scope_id = Some(scope_id.to_owned());
        self.outcomes.pop_front().unwrap_or(Ok(()))?;
        Ok(ScriptedClient::default())
    }
}

/// Client that records what it is given and hands back injected events.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    keep_alive: Option<Duration>,
    sent: Vec<String>,
    reported: Vec<String>,
    inbox: VecDeque<ClientEvent>,
    ready: VecDeque<ClientEvent>,
    work_calls: usize,
}

impl ScriptedClient {
    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive
    }

    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    pub fn reported(&self) -> &[String] {
        &self.reported
    }

    pub fn work_calls(&self) -> usize {
        self.work_calls
    }

    /// Deliver `event` on the next `do_work`.
    pub fn inject(&mut self, event: ClientEvent) {
        self.inbox.push_back(event);
    }
}

impl IotClient for ScriptedClient {
    fn set_keep_alive(&mut self, period: Duration) -> Result<(), ClientError> {
        self.keep_alive = Some(period);
        Ok(())
    }

    fn send_event(&mut self, message: &str) -> Result<(), ClientError> {
        self.sent.push(message.to_owned());
        Ok(())
    }

    fn send_reported_state(&mut self, document: &str) -> Result<(), ClientError> {
        self.reported.push(document.to_owned());
        Ok(())
    }

    fn do_work(&mut self) {
        self.work_calls += 1;
        self.ready.extend(self.inbox.drain(..));
    }

    fn poll_event(&mut self) -> Option<ClientEvent> {
        self.ready.pop_front()
    }
}

// ---------------------------------------------------------------------------
// Sensor & signal processing
// ---------------------------------------------------------------------------

/// PPG sensor whose data-ready line fires every `step` of a manual clock.
#[derive(Debug)]
pub struct FakeSensor {
    clock: ManualClock,
    step: Duration,
    reads: usize,
    stall_after: Option<usize>,
    fail_init: bool,
    init_calls: usize,
    shutdown_calls: usize,
}

impl FakeSensor {
    pub fn new(clock: ManualClock, step: Duration) -> Self {
        Self {
            clock,
            step,
            reads: 0,
            stall_after: None,
            fail_init: false,
            init_calls: 0,
            shutdown_calls: 0,
        }
    }

    /// Stop signalling data-ready after `samples` reads.
    pub fn stalling_after(mut self, samples: usize) -> Self {
        self.stall_after = Some(samples);
        self
    }

    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls
    }

    pub fn shutdown_calls(&self) -> usize {
        self.shutdown_calls
    }
}

impl PpgSensor for FakeSensor {
    fn init(&mut self) -> Result<(), SensorError> {
        self.init_calls += 1;
        if self.fail_init {
            return Err(SensorError::Bus(embedded_hal::i2c::ErrorKind::Other));
        }
        Ok(())
    }

    fn info(&mut self) -> Result<SensorInfo, SensorError> {
        Ok(SensorInfo { revision: 3, part_id: 0x15 })
    }

    fn is_sample_ready(&mut self) -> Result<bool, SensorError> {
        self.clock.advance(self.step);
        Ok(self.stall_after.map_or(true, |limit| self.reads < limit))
    }

    fn read_sample(&mut self) -> Result<PpgSample, SensorError> {
        self.reads += 1;
        Ok(PpgSample {
            red: 60_000,
            ir: 100_000,
        })
    }

    fn shutdown(&mut self) -> Result<(), SensorError> {
        self.shutdown_calls += 1;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ProcessorLog {
    script: VecDeque<Estimate>,
    last: Estimate,
    window_lengths: Vec<usize>,
}

/// Signal processor returning scripted estimates; clones share one log.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProcessor(Rc<RefCell<ProcessorLog>>);

impl ScriptedProcessor {
    pub fn repeat(estimate: Estimate) -> Self {
        Self::script([estimate])
    }

    pub fn script(estimates: impl IntoIterator<Item = Estimate>) -> Self {
        let log = ProcessorLog {
            script: estimates.into_iter().collect(),
            ..ProcessorLog::default()
        };
        Self(Rc::new(RefCell::new(log)))
    }

    pub fn calls(&self) -> usize {
        self.0.borrow().window_lengths.len()
    }

    pub fn window_lengths(&self) -> Vec<usize> {
        self.0.borrow().window_lengths.clone()
    }
}

impl SignalProcessor for ScriptedProcessor {
    fn estimate(&mut self, ir: &[u32], red: &[u32]) -> Estimate {
        let mut log = self.0.borrow_mut();
        log.window_lengths.push(ir.len().min(red.len()));
        if let Some(next) = log.script.pop_front() {
            log.last = next;
        }
        log.last
    }
}
