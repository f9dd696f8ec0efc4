use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use thermostatd::Actuator;
use thermostatd::Config;
use thermostatd::Controller;
use thermostatd::Thermostat;
use thermostatd::api;
use thermostatd::config::GpioBackendKind;
use thermostatd::config::IsolationKind;
use thermostatd::config::LoggingConfig;
use thermostatd::prompt;
use thermostatd_sensor::Dht22;
use thermostatd_sensor::Gpio;
use thermostatd_sensor::ProcessIsolation;
use thermostatd_sensor::RetryingSensor;
use thermostatd_sensor::ThreadIsolation;
use thermostatd_sensor::gpio::GpioBackend;
use thermostatd_sensor::gpio::MockGpio;
use thermostatd_sensor::gpio::Waveform;
use thermostatd_sensor::reading::frame_bytes;
use tokio::io::BufReader;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long shutdown waits for blocking work, such as a pending stdin read.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(version, about = "Thermostat daemon driving heating, cooling and fan relays from a DHT22")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "thermostatd.toml")]
    config: PathBuf,

    /// Read temperature overrides and mode changes from stdin
    #[arg(long)]
    manual: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Perform one sensor read and print the outcome as a JSON line
    #[command(hide = true)]
    ReadSensor,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    init_logging(&config.logging);

    if let Some(Command::ReadSensor) = cli.command {
        return read_sensor(&config);
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let result = runtime.block_on(run(&cli, config));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

/// Logs go to stderr; stdout carries the `read-sensor` result.
fn init_logging(logging: &LoggingConfig) {
    let filter = Targets::new()
        .with_default(LevelFilter::from(logging.level))
        .with_targets(
            logging
                .overrides
                .iter()
                .map(|(target, level)| (target.clone(), LevelFilter::from(*level))),
        );

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn read_sensor(config: &Config) -> anyhow::Result<()> {
    let gpio = build_gpio(config)?;
    let outcome = sensor_driver(config, gpio).read();
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}

async fn run(cli: &Cli, config: Config) -> anyhow::Result<()> {
    tracing::info!("thermostatd starting");
    tracing::info!("Loaded config from: {}", cli.config.display());

    let gpio = build_gpio(&config)?;
    tracing::info!(
        "Relays: heating {}, cooling {}, fan {}",
        config.relays.heating,
        config.relays.cooling,
        config.relays.fan
    );

    let thermostat = Thermostat::new(config.thermostat.initial_state());
    let actuator = Actuator::new(gpio.clone(), config.relays);
    let (controller, handle) = Controller::new(thermostat, actuator, config.sensor.poll_interval());

    let controller = if config.sensor.enabled {
        controller.with_source(build_sensor(cli, &config, gpio)?)
    } else {
        tracing::info!("Sensor disabled, temperature only changes through manual overrides");
        controller
    };

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = if config.api.enabled {
        let handle = handle.clone();
        let api_config = config.api.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(&api_config.listen, api_config.port, handle, api_shutdown_rx).await
            {
                tracing::error!("HTTP API server failed: {:#}", e);
            }
        }))
    } else {
        tracing::info!("HTTP API disabled");
        None
    };

    if cli.manual {
        let handle = handle.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            if let Err(e) = prompt::run(stdin, tokio::io::stdout(), handle).await {
                tracing::warn!("Manual prompt stopped: {}", e);
            }
        });
    }

    tracing::info!("Press Ctrl+C to exit");
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
        }
    };
    let result = controller.run(shutdown).await;

    api_shutdown_tx.send(()).ok();
    if let Some(task) = api_task {
        task.await.ok();
    }

    result.context("control loop failed")?;
    tracing::info!("thermostatd shutdown complete");
    Ok(())
}

fn build_gpio(config: &Config) -> anyhow::Result<Gpio> {
    let backend: Arc<dyn GpioBackend> = match config.gpio.backend {
        GpioBackendKind::Cdev => cdev_backend()?,
        GpioBackendKind::Simulated => {
            tracing::info!(
                "Using simulated GPIO, sensor reports {:.1}°C at {:.1}%RH",
                config.gpio.simulated_temperature,
                config.gpio.simulated_humidity
            );
            let mock = MockGpio::new();
            let frame = frame_bytes(config.gpio.simulated_humidity, config.gpio.simulated_temperature);
            mock.set_waveform(config.sensor.line_id(), Waveform::dht22(frame, 1));
            Arc::new(mock)
        }
    };
    Ok(Gpio::new(backend, config.gpio.consumer.clone()))
}

#[cfg(feature = "hardware-gpio")]
fn cdev_backend() -> anyhow::Result<Arc<dyn GpioBackend>> {
    Ok(Arc::new(thermostatd_sensor::gpio::CdevBackend::new()))
}

#[cfg(not(feature = "hardware-gpio"))]
fn cdev_backend() -> anyhow::Result<Arc<dyn GpioBackend>> {
    anyhow::bail!("built without the hardware-gpio feature; set gpio.backend = \"simulated\"")
}

fn sensor_driver(config: &Config, gpio: Gpio) -> Dht22 {
    Dht22::new(gpio, config.sensor.line_id())
        .with_threshold(config.sensor.bit_threshold.into())
        .with_sample_budget(config.sensor.sample_budget)
}

fn build_sensor(cli: &Cli, config: &Config, gpio: Gpio) -> anyhow::Result<RetryingSensor> {
    let policy = config.sensor.retry_policy();
    tracing::info!(
        "Sensor on {} ({:?} isolation, {} attempts, {:?} timeout, polling every {:?})",
        config.sensor.line_id(),
        config.sensor.isolation,
        policy.max_attempts,
        policy.timeout,
        config.sensor.poll_interval()
    );

    let sensor = match config.sensor.isolation {
        IsolationKind::Process => {
            let exe = std::env::current_exe().context("failed to locate own executable")?;
            let isolation = ProcessIsolation::new(exe)
                .arg("--config")
                .arg(&cli.config)
                .arg("read-sensor");
            RetryingSensor::new(isolation, policy)
        }
        IsolationKind::Thread => {
            let driver = sensor_driver(config, gpio);
            let isolation = ThreadIsolation::new(move |cancel| driver.read_with_cancel(cancel));
            RetryingSensor::new(isolation, policy)
        }
    };
    Ok(sensor)
}
