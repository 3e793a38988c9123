// PulseWatch — Console Buttons & LED
//
// A background thread reads commands from stdin:
//   a / h  → press button A (heartbeat)
//   b / m  → press button B (measure)
//   q      → request shutdown
// SIGINT / SIGTERM request shutdown the same way, so teardown still runs.
// Each press is seen by the poller as one LOW sample followed by HIGH, which is
// exactly one falling edge.

use std::convert::Infallible;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use embedded_hal::digital::{ErrorType, InputPin, OutputPin};

use crate::time::Termination;

/// Button whose presses are queued from another thread.
#[derive(Debug, Default)]
pub struct ConsoleButton {
    presses: Arc<AtomicUsize>,
    held: bool,
}

impl ConsoleButton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for queuing presses from any thread.
    pub fn presser(&self) -> Presser {
        Presser(Arc::clone(&self.presses))
    }

    fn sample_high(&mut self) -> bool {
        if self.held {
            self.held = false;
            return true;
        }
        let taken = self
            .presses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        self.held = taken;
        !taken
    }
}

#[derive(Debug, Clone)]
pub struct Presser(Arc<AtomicUsize>);

impl Presser {
    pub fn press(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

impl ErrorType for ConsoleButton {
    type Error = Infallible;
}

impl InputPin for ConsoleButton {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.sample_high())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.sample_high())
    }
}

/// Spawn the stdin reader.  The thread ends at EOF or on `q`.
pub fn spawn_console(heartbeat: Presser, measure: Presser, termination: Termination) -> io::Result<()> {
    thread::Builder::new().name("console".into()).spawn(move || {
        for line in io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            match line.trim() {
                "a" | "h" => heartbeat.press(),
                "b" | "m" => measure.press(),
                "q" => {
                    termination.request();
                    break;
                }
                "" => {}
                other => log::warn!("unknown command {:?} (a/h = heartbeat, b/m = measure, q = quit)", other),
            }
        }
    })?;
    Ok(())
}

/// Turn SIGINT and SIGTERM into a termination request.  Installable once per
/// process.
pub fn request_termination_on_signal(termination: Termination) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        log::info!("termination signal received");
        termination.request();
    })
}

/// Output pin that logs level changes of an active-low LED.
#[derive(Debug, Default)]
pub struct LogLed {
    lit: Option<bool>,
}

impl LogLed {
    pub fn new() -> Self {
        Self::default()
    }

    fn drive(&mut self, lit: bool) {
        if self.lit != Some(lit) {
            log::info!("status LED {}", if lit { "on" } else { "off" });
        }
        self.lit = Some(lit);
    }
}

impl ErrorType for LogLed {
    type Error = Infallible;
}

impl OutputPin for LogLed {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.drive(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.drive(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Button;

    #[test]
    fn each_queued_press_is_one_edge() {
        let pin = ConsoleButton::new();
        let presser = pin.presser();
        let mut button = Button::new("A", pin);

        presser.press();
        presser.press();
        let edges = (0..10).filter(|_| button.poll().unwrap()).count();
        assert_eq!(edges, 2);
    }

    #[cfg(unix)]
    #[test]
    fn sigterm_requests_termination() {
        use std::process::Command;
        use std::time::{Duration, Instant};

        let termination = Termination::new();
        request_termination_on_signal(termination.clone()).unwrap();
        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !termination.is_requested() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(termination.is_requested());
    }

    #[test]
    fn idle_button_reads_high() {
        let mut pin = ConsoleButton::new();
        assert!(pin.is_high().unwrap());
        assert!(!pin.is_low().unwrap());
    }
}
