// PulseWatch — Firmware Entry Point
//
// Boot sequence:
//   1. Initialise logging and read the DPS scope id.
//   2. Bring up the network (Wi-Fi station on the ESP32-C3).
//   3. Open the MAX30102 on I2C and read its identity registers.
//   4. Wire buttons A/B and the status LED into the application.
//   5. Run the dispatcher until termination or a fatal error.
//
// Off-target the same application runs against a simulated sensor, console
// buttons (a / b / q on stdin, SIGINT / SIGTERM also stop) and a loopback cloud:
//   cargo run -- <scope-id>

use std::process::ExitCode;

fn main() -> ExitCode {
    platform::init_logging();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config = platform::load_config()?;
    log::info!("PulseWatch starting, DPS scope id {}", config.scope_id);
    platform::run(config)
}

// ---------------------------------------------------------------------------
// ESP32-C3
// ---------------------------------------------------------------------------
#[cfg(target_os = "espidf")]
mod platform {
    use std::thread;
    use std::time::Duration;

    use anyhow::{anyhow, Context};
    use esp_idf_hal::gpio::{IOPin, InputPin, OutputPin, PinDriver, Pull};
    use esp_idf_hal::i2c::{I2cConfig, I2cDriver};
    use esp_idf_hal::modem::Modem;
    use esp_idf_hal::prelude::*;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};

    use pulsewatch::app::App;
    use pulsewatch::cloud::esp::{DeviceIdentity, DpsProvisioner, WifiStation};
    use pulsewatch::config::{AppConfig, I2C_BAUDRATE_KHZ};
    use pulsewatch::dispatch::Dispatcher;
    use pulsewatch::drivers::led::StatusLed;
    use pulsewatch::drivers::max30102::Max30102;
    use pulsewatch::input::Button;
    use pulsewatch::spo2::RfEstimator;
    use pulsewatch::tasks::acquisition::AcquisitionPipeline;
    use pulsewatch::tasks::connection::ConnectionManager;
    use pulsewatch::tasks::twin::TwinSynchronizer;
    use pulsewatch::time::{SystemClock, Termination};

    const WIFI_CONNECT_ATTEMPTS: u32 = 5;
    const WIFI_RETRY_DELAY: Duration = Duration::from_secs(2);

    const IDENTITY: DeviceIdentity = DeviceIdentity {
        registration_id: env!("PULSEWATCH_REGISTRATION_ID"),
        certificate: concat!(env!("PULSEWATCH_DEVICE_CERT"), "\0"),
        private_key: concat!(env!("PULSEWATCH_DEVICE_KEY"), "\0"),
    };

    pub fn init_logging() {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
    }

    pub fn load_config() -> anyhow::Result<AppConfig> {
        Ok(AppConfig::with_scope_id(env!("PULSEWATCH_SCOPE_ID"))?)
    }

    pub fn run(config: AppConfig) -> anyhow::Result<()> {
        let peripherals = Peripherals::take()?;
        let sys_loop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;

        // The station stays up for the life of the firmware; readiness is
        // re-checked on every cloud tick.
        let _wifi = connect_wifi(peripherals.modem, sys_loop, nvs)?;

        // ---- Sensor -------------------------------------------------------
        let i2c = I2cDriver::new(
            peripherals.i2c0,
            peripherals.pins.gpio6, // SDA
            peripherals.pins.gpio7, // SCL
            &I2cConfig::new().baudrate(I2C_BAUDRATE_KHZ.kHz().into()),
        )?;
        let int = PinDriver::input(peripherals.pins.gpio2.downgrade_input())?;
        let sensor = Max30102::new(i2c, int);

        // ---- Buttons (pull-up, active LOW) and LED ------------------------
        let mut button_a = PinDriver::input(peripherals.pins.gpio3.downgrade())?;
        button_a.set_pull(Pull::Up)?;
        let mut button_b = PinDriver::input(peripherals.pins.gpio5.downgrade())?;
        button_b.set_pull(Pull::Up)?;
        let led = PinDriver::output(peripherals.pins.gpio4.downgrade_output())?;

        let app = App::new(
            ConnectionManager::new(WifiStation, DpsProvisioner::new(IDENTITY), config.scope_id),
            TwinSynchronizer::new(StatusLed::new(led)?),
            sensor,
            AcquisitionPipeline::new(RfEstimator, SystemClock),
            Button::new("A", button_a),
            Button::new("B", button_b),
        )
        .context("sensor identification failed")?;

        app.run(Dispatcher::new(SystemClock, Termination::new()))?;
        Ok(())
    }

    fn connect_wifi(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
    ) -> anyhow::Result<EspWifi<'static>> {
        let ssid = env!("PULSEWATCH_WIFI_SSID");
        let password = env!("PULSEWATCH_WIFI_PASS");

        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
            password: password.try_into().map_err(|_| anyhow!("wifi password too long"))?,
            auth_method: if password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPAWPA2Personal
            },
            ..Default::default()
        }))?;
        wifi.start()?;
        log::info!("wifi started, connecting to `{}`", ssid);

        for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
            match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
                Ok(()) => {
                    log::info!("wifi connected on attempt {}", attempt);
                    break;
                }
                Err(e) => {
                    log::warn!("wifi connect attempt {}/{} failed: {}", attempt, WIFI_CONNECT_ATTEMPTS, e);
                    let _ = wifi.disconnect();
                    thread::sleep(WIFI_RETRY_DELAY);
                }
            }
        }
        drop(wifi);
        Ok(esp_wifi)
    }
}

// ---------------------------------------------------------------------------
// Development host
// ---------------------------------------------------------------------------
#[cfg(not(target_os = "espidf"))]
mod platform {
    use pulsewatch::app::App;
    use pulsewatch::cloud::sim::{AlwaysOnline, LoopbackProvisioner};
    use pulsewatch::config::AppConfig;
    use pulsewatch::dispatch::Dispatcher;
    use pulsewatch::drivers::led::StatusLed;
    use pulsewatch::drivers::max30102::Max30102;
    use pulsewatch::input::Button;
    use pulsewatch::sim::console::{request_termination_on_signal, spawn_console, ConsoleButton, LogLed};
    use pulsewatch::sim::max30102::SimulatedMax30102;
    use pulsewatch::spo2::RfEstimator;
    use pulsewatch::tasks::acquisition::AcquisitionPipeline;
    use pulsewatch::tasks::connection::ConnectionManager;
    use pulsewatch::tasks::twin::TwinSynchronizer;
    use pulsewatch::time::{SystemClock, Termination};
    use tracing_subscriber::EnvFilter;

    /// Twin document the loopback cloud delivers after connecting.
    const DESIRED_ENV: &str = "PULSEWATCH_DESIRED";

    pub fn init_logging() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
    }

    pub fn load_config() -> anyhow::Result<AppConfig> {
        Ok(AppConfig::from_args(std::env::args().skip(1))?)
    }

    pub fn run(config: AppConfig) -> anyhow::Result<()> {
        let termination = Termination::new();

        let model = SimulatedMax30102::new(SystemClock);
        let sensor = Max30102::new(model.bus(), model.int_pin());

        let button_a = ConsoleButton::new();
        let button_b = ConsoleButton::new();
        spawn_console(button_a.presser(), button_b.presser(), termination.clone())?;
        request_termination_on_signal(termination.clone())?;
        log::info!("console: 'a' heartbeat, 'b' measure, 'q' quit");

        let mut provisioner = LoopbackProvisioner::new();
        if let Ok(document) = std::env::var(DESIRED_ENV) {
            provisioner = provisioner.with_desired(document);
        }

        let app = App::new(
            ConnectionManager::new(AlwaysOnline, provisioner, config.scope_id),
            TwinSynchronizer::new(StatusLed::new(LogLed::new())?),
            sensor,
            AcquisitionPipeline::new(RfEstimator, SystemClock),
            Button::new("A", button_a),
            Button::new("B", button_b),
        )?;

        app.run(Dispatcher::new(SystemClock, termination))?;
        Ok(())
    }
}
