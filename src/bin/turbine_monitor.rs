//! Desktop turbine monitor.
//!
//! Connects to AWS IoT Core (or a Greengrass core) with the device
//! certificate and runs the monitoring loop against simulated hardware:
//! a mock servo, an accelerometer at rest, and a fixed ADC reading.
//!
//! # Usage
//!
//! ```sh
//! turbine_monitor --config config.json [--verbose] [--simulate-rpm 120]
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Clean shutdown (Ctrl+C) |
//! | 1 | Bad arguments or a fatal runtime error |
//! | 2 | Missing or invalid configuration |
//!
//! # Threads
//!
//! - `main`: monitoring loop (sampling, safety, telemetry)
//! - `shadow-sync`: dispatches deltas and commands
//! - `rotor-sim`: rotation pulses when `--simulate-rpm` is given
//! - `mqtt-transport-*`: tokio workers for the broker session

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn, Level};

use turbine_sync::hal::{MockAccelerometer, MockAdc, MockServo};
use turbine_sync::services::{
    connect, connect_via_discovery, ConnectError, ConnectionConfig, DiscoveryPolicy,
    FileHostCache, HttpsDiscoveryClient, IotClient, StatusListener,
};
use turbine_sync::traits::StdDelay;
use turbine_sync::{
    BrakeController, Config, RotationCounter, SensorSampler, ShadowSyncEngine, ShadowUpdater,
    SharedDevice, Topics, TurbineMonitor,
};

/// Pause between whole-connect retries against IoT Core.
const CONNECT_RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Dispatcher poll interval while the inbox is empty.
const DISPATCH_IDLE_MS: u64 = 50;

/// Grace period for flushing the session on exit.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

type Device = SharedDevice<MockServo, StdDelay>;

// ============================================================================
// Arguments
// ============================================================================

#[derive(Debug)]
struct Args {
    config: PathBuf,
    verbose: bool,
    simulate_rpm: Option<f32>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut config = None;
        let mut verbose = false;
        let mut simulate_rpm = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    config = Some(PathBuf::from(
                        args.next().ok_or("--config needs a path")?,
                    ));
                }
                "--verbose" | "-v" => verbose = true,
                "--simulate-rpm" => {
                    let value = args.next().ok_or("--simulate-rpm needs a value")?;
                    let rpm = value
                        .parse::<f32>()
                        .ok()
                        .filter(|rpm| *rpm > 0.0)
                        .ok_or_else(|| format!("invalid rpm: {value}"))?;
                    simulate_rpm = Some(rpm);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(Self {
            config: config.ok_or("missing --config <path>")?,
            verbose,
            simulate_rpm,
        })
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_thread_names(true)
        .with_target(false)
        .init();
}

// ============================================================================
// Main
// ============================================================================

fn main() -> ExitCode {
    let args = match Args::parse(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!("usage: turbine_monitor --config <path> [--verbose] [--simulate-rpm <rpm>]");
            return ExitCode::from(1);
        }
    };
    init_logging(args.verbose);

    let config = match Config::load(&args.config).and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), error = %e, "configuration rejected");
            return ExitCode::from(2);
        }
    };

    match run(config, args.simulate_rpm) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let chain = format!("{e:#}");
            error!(error = %chain, "turbine monitor failed");
            ExitCode::from(1)
        }
    }
}

fn run(config: Config, simulate_rpm: Option<f32>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("mqtt-transport")
        .build()
        .context("building tokio runtime")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            flag.store(true, Ordering::Release);
        }
    });

    // Hardware
    let brake = BrakeController::new(MockServo::new(), StdDelay, config.brake_settings());
    let device: Arc<Device> = Arc::new(SharedDevice::new(brake, &config));
    let counter = Arc::new(RotationCounter::new());
    let sampler = SensorSampler::new(
        Arc::clone(&counter),
        MockAccelerometer::new(),
        MockAdc::with_raw(512),
    );
    if let Some(rpm) = simulate_rpm {
        spawn_rotor(counter, rpm, Arc::clone(&shutdown))?;
    }

    // Transport
    let topics = Topics::new(&config.identity());
    let status_device = Arc::clone(&device);
    let status: StatusListener = Arc::new(move |s| status_device.set_connection_status(s));

    let client = match runtime.block_on(connect_device(&config, &topics, status, &shutdown))? {
        Some(client) => client,
        None => {
            info!("stopped before a connection was made");
            return Ok(());
        }
    };

    // Shadow dispatcher
    let updater = ShadowUpdater::new(client.clone(), StdDelay, &topics, config.retry_policy());
    let mut engine = ShadowSyncEngine::new(Arc::clone(&device), updater, topics.clone());
    let engine_flag = Arc::clone(&shutdown);
    let dispatcher = thread::Builder::new()
        .name("shadow-sync".into())
        .spawn(move || engine.run(&engine_flag, &mut StdDelay, DISPATCH_IDLE_MS))
        .context("spawning shadow dispatcher")?;

    // Monitoring loop on this thread
    let mut monitor = TurbineMonitor::new(device, sampler, client.clone(), StdDelay, &config)
        .with_shutdown_flag(Arc::clone(&shutdown));
    monitor.run();

    shutdown.store(true, Ordering::Release);
    if dispatcher.join().is_err() {
        warn!("shadow dispatcher panicked");
    }
    runtime.block_on(client.disconnect(DISCONNECT_GRACE));
    info!("turbine monitor stopped");
    Ok(())
}

/// Connect to IoT Core (retrying until shutdown) or through discovery.
///
/// Returns `None` if shutdown was requested before a session came up.
async fn connect_device(
    config: &Config,
    topics: &Topics,
    status: StatusListener,
    shutdown: &AtomicBool,
) -> anyhow::Result<Option<IotClient>> {
    let settings = ConnectionConfig::load(config).await?;

    if config.runtime.connection.use_greengrass {
        let discovery = HttpsDiscoveryClient::new(&config.device_thing.gg_host, &settings)?;
        let cache = FileHostCache::new(config.host_cache_file(), config.group_ca_file());
        let policy = DiscoveryPolicy {
            attempts: config.runtime.connection.discovery_attempts,
            ..DiscoveryPolicy::default()
        };
        let client = connect_via_discovery(&discovery, &cache, policy, |candidate| {
            let core = settings.for_core(candidate.endpoint, candidate.ca.into_bytes());
            let status = Arc::clone(&status);
            async move { connect(&core, topics, status).await }
        })
        .await
        .context("Greengrass connection failed")?;
        return Ok(Some(client));
    }

    loop {
        if shutdown.load(Ordering::Acquire) {
            return Ok(None);
        }
        match connect(&settings, topics, Arc::clone(&status)).await {
            Ok(client) => return Ok(Some(client)),
            Err(e @ ConnectError::Exhausted { .. }) => {
                warn!(error = %e, retry_in = ?CONNECT_RETRY_PAUSE, "IoT Core unreachable");
                tokio::time::sleep(CONNECT_RETRY_PAUSE).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Feed rotation pulses at a fixed rate.
fn spawn_rotor(counter: Arc<RotationCounter>, rpm: f32, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let period = Duration::from_secs_f32(60.0 / rpm);
    info!(rpm, "simulating rotor");
    thread::Builder::new()
        .name("rotor-sim".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(period);
                counter.record_pulse();
            }
        })
        .context("spawning rotor simulator")?;
    Ok(())
}
