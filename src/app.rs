// PulseWatch — Application Context
//
// Owns every component and hooks them to the dispatcher:
//   - 1 ms timer: poll buttons A (heartbeat) and B (measurement run)
//   - cloud timer (20 s, stretched by backoff): connection lifecycle tick
// Notifications from the cloud (authenticated, twin documents) are handled
// right after the tick that produced them.

use std::time::Duration;

use embedded_hal::digital::{InputPin, OutputPin};

use crate::cloud::{NetworkStatus, Provisioner};
use crate::config::{BUTTON_POLL_PERIOD, CLOUD_DEFAULT_POLL_SECS};
use crate::dispatch::{DispatchError, Dispatcher, TimerId, Timers};
use crate::drivers::{PpgSensor, SensorError};
use crate::events::{Notification, SensorInfo};
use crate::input::Button;
use crate::tasks::acquisition::AcquisitionPipeline;
use crate::tasks::connection::ConnectionManager;
use crate::tasks::telemetry::send_heartbeat;
use crate::tasks::twin::{report_sensor_info, TwinSynchronizer};

pub struct App<N, P: Provisioner, S, L, B> {
    connection: ConnectionManager<N, P>,
    twin: TwinSynchronizer<L>,
    sensor: S,
    sensor_info: SensorInfo,
    acquisition: AcquisitionPipeline,
    heartbeat_button: Button<B>,
    measure_button: Button<B>,
    cloud_timer: Option<TimerId>,
}

impl<N, P, S, L, B> App<N, P, S, L, B>
where
    N: NetworkStatus,
    P: Provisioner,
    S: PpgSensor,
    L: OutputPin,
    B: InputPin,
{
    /// Assemble the application; reads the sensor identity once up front.
    pub fn new(
        connection: ConnectionManager<N, P>,
        twin: TwinSynchronizer<L>,
        mut sensor: S,
        acquisition: AcquisitionPipeline,
        heartbeat_button: Button<B>,
        measure_button: Button<B>,
    ) -> Result<Self, SensorError> {
        let sensor_info = sensor.info()?;
        log::info!(
            "heart rate click revision {}, part id {}",
            sensor_info.revision_string(),
            sensor_info.part_id_string()
        );
        Ok(Self {
            connection,
            twin,
            sensor,
            sensor_info,
            acquisition,
            heartbeat_button,
            measure_button,
            cloud_timer: None,
        })
    }

    pub fn connection(&self) -> &ConnectionManager<N, P> {
        &self.connection
    }

    pub fn twin(&self) -> &TwinSynchronizer<L> {
        &self.twin
    }

    /// Button timer: a failed GPIO read stops the main loop.
    pub fn poll_buttons(&mut self) -> Result<(), DispatchError> {
        if self.heartbeat_button.poll().map_err(fatal)? {
            log::info!("button {} pressed: sending heartbeat", self.heartbeat_button.name());
            if let Err(e) = send_heartbeat(&mut self.connection) {
                log::warn!("heartbeat not sent: {}", e);
            }
        }
        if self.measure_button.poll().map_err(fatal)? {
            log::info!("button {} pressed: starting measurement", self.measure_button.name());
            self.measure();
        }
        Ok(())
    }

    /// Blocking measurement run; failures are logged, never fatal.
    pub fn measure(&mut self) {
        if let Err(e) = self.acquisition.run(&mut self.sensor, &mut self.connection) {
            log::error!("{}", e);
        }
    }

    /// Cloud timer: one lifecycle tick.  Returns the new timer period if the
    /// tick changed it.
    pub fn cloud_tick(&mut self) -> Option<Duration> {
        let outcome = self.connection.tick();
        for notification in outcome.notifications {
            match notification {
                Notification::Authenticated => {
                    report_sensor_info(&mut self.connection, &self.sensor_info);
                }
                Notification::TwinUpdate(payload) => {
                    if let Err(e) = self.twin.apply(&payload, &mut self.connection) {
                        log::warn!("ignoring twin update: {}", e);
                    }
                }
            }
        }
        outcome.reschedule
    }

    fn on_cloud_timer(&mut self, timers: &mut Timers) -> Result<(), DispatchError> {
        match (self.cloud_tick(), self.cloud_timer) {
            (Some(period), Some(id)) => timers.set_period(id, period),
            _ => Ok(()),
        }
    }

    /// Leave the LED dark and the sensor powered down.
    pub fn teardown(&mut self) {
        if let Err(e) = self.twin.led_mut().set(false) {
            log::warn!("{}", e);
        }
        if let Err(e) = self.sensor.shutdown() {
            log::warn!("sensor shutdown failed: {}", e);
        }
    }
}

impl<N, P, S, L, B> App<N, P, S, L, B>
where
    N: NetworkStatus + 'static,
    P: Provisioner + 'static,
    S: PpgSensor + 'static,
    L: OutputPin + 'static,
    B: InputPin + 'static,
{
    pub fn register(&mut self, dispatcher: &mut Dispatcher<Self>) -> Result<(), DispatchError> {
        dispatcher.register_timer(BUTTON_POLL_PERIOD, |app: &mut Self, _| app.poll_buttons())?;
        let cloud = dispatcher.register_timer(
            Duration::from_secs(u64::from(CLOUD_DEFAULT_POLL_SECS)),
            |app: &mut Self, timers| app.on_cloud_timer(timers),
        )?;
        self.cloud_timer = Some(cloud);
        Ok(())
    }

    /// Register, run until termination or a fatal error, then tear down.
    pub fn run(mut self, mut dispatcher: Dispatcher<Self>) -> Result<(), DispatchError> {
        let result = self.register(&mut dispatcher).and_then(|()| {
            log::info!("entering main loop");
            dispatcher.run(&mut self)
        });
        log::info!("leaving main loop");
        self.teardown();
        result
    }
}

fn fatal(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Fatal(e.to_string())
}
