use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dpvr_config::AppConfig;
use dpvr_imu::device::{udev_rule, FeatureReportSource};
use dpvr_imu::driver::Driver;
use dpvr_imu::{MadgwickFilter, MockReportSource, RotationEvent};
use dpvr_stream::{Broadcaster, StreamServer};
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "dpvr",
    version,
    about = "Orientation of a DPVR headset, on the console or as server-sent events"
)]
struct Cli {
    /// Config file (defaults to <config dir>/dpvr/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a udev rule that lets users access the device
    UdevRule {
        /// Name of the group
        #[arg(short, long, default_value = "video")]
        group: String,
        /// Access mode of the device
        #[arg(short, long, default_value = "660")]
        mode: String,
    },
    /// Continuously print the rotation computed from sensor data as JSON
    Console {
        #[command(flatten)]
        source: SourceArgs,
    },
    /// Serve the rotation computed from sensor data as server-sent events (SSE)
    Server {
        /// The port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// The hostname to listen on
        #[arg(short = 'H', long)]
        hostname: Option<String>,
        /// The origin to allow (for CORS requests)
        #[arg(short, long)]
        origin: Option<String>,
        /// The URL path for server-sent events
        #[arg(short, long = "url-sse")]
        url_sse: Option<String>,
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Use a synthetic stationary headset instead of USB HID
    #[arg(long)]
    mock: bool,
}

/// Where each new orientation goes.
enum Output {
    Console,
    Stream(Broadcaster),
}

impl Output {
    /// Breaks once the output can no longer be written, e.g. a closed stdout pipe.
    fn emit(&self, event: RotationEvent) -> ControlFlow<()> {
        match self {
            Output::Console => {
                if let Err(e) = print_rotation(&mut io::stdout().lock(), &event) {
                    info!(?e, "Console output closed");
                    return ControlFlow::Break(());
                }
            }
            Output::Stream(broadcaster) => {
                if let Err(e) = broadcaster.publish(&event) {
                    warn!(?e, "Failed to encode rotation event");
                }
            }
        }
        ControlFlow::Continue(())
    }
}

/// One JSON object per line.
fn print_rotation(out: &mut impl Write, event: &RotationEvent) -> io::Result<()> {
    serde_json::to_writer(&mut *out, &event.rotation)?;
    out.write_all(b"\n")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries console output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dpvr=info,dpvr_imu=info,dpvr_stream=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => dpvr_config::load_config_from(path)?,
        None => dpvr_config::load_config().unwrap_or_else(|e| {
            warn!(?e, "Failed to load config, using defaults");
            AppConfig::default()
        }),
    };

    match cli.command {
        Command::UdevRule { group, mode } => {
            println!(
                "{}",
                udev_rule(
                    config.device.vendor_id,
                    config.device.product_id,
                    &mode,
                    &group
                )
            );
            Ok(())
        }
        Command::Console { source } => run(&config, source.mock, Output::Console, None).await,
        Command::Server {
            port,
            hostname,
            origin,
            url_sse,
            source,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(hostname) = hostname {
                config.server.host = hostname;
            }
            if origin.is_some() {
                config.server.origin = origin;
            }
            if let Some(path) = url_sse {
                config.server.path = path;
            }

            let broadcaster = Broadcaster::new();
            let server = StreamServer::bind(&config.server, broadcaster.clone()).await?;
            run(&config, source.mock, Output::Stream(broadcaster), Some(server)).await
        }
    }
}

/// Open the configured device and run the pipeline until Ctrl-C or a device failure.
async fn run(
    config: &AppConfig,
    mock: bool,
    output: Output,
    server: Option<StreamServer>,
) -> Result<()> {
    let filter = MadgwickFilter::new(config.fusion.madgwick_beta, config.fusion.sample_rate_hz)
        .with_initialisation(config.fusion.initialise);

    if mock {
        warn!("Using synthetic headset (no real head tracking)");
        let period = Duration::try_from_secs_f64(filter.default_period())
            .context("Invalid fusion sample rate")?;
        let driver = Driver::new(MockReportSource::stationary(period), filter);
        run_pipeline(driver, output, server).await
    } else {
        let driver =
            Driver::open_hid(config.device.vendor_id, config.device.product_id, filter)
                .context("Failed to open headset")?;
        run_pipeline(driver, output, server).await
    }
}

async fn run_pipeline<S>(
    mut driver: Driver<S>,
    output: Output,
    server: Option<StreamServer>,
) -> Result<()>
where
    S: FeatureReportSource + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_task = server.map(|server| tokio::spawn(server.run(shutdown_rx.clone())));

    // Device reads block, so the sampling loop gets its own thread.
    let loop_shutdown = shutdown_rx.clone();
    let mut sampling = tokio::task::spawn_blocking(move || {
        let result = dpvr_imu::run_sampling_loop(&mut driver, &loop_shutdown, |d, _| {
            output.emit(RotationEvent {
                rotation: d.euler_angles(),
            })
        });
        if let Err(e) = driver.close() {
            warn!(?e, "Failed to close headset");
        }
        result
    });

    let joined = tokio::select! {
        joined = &mut sampling => joined,
        Ok(()) = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            shutdown_tx.send_replace(true);
            sampling.await
        }
    };

    shutdown_tx.send_replace(true);
    if let Some(task) = server_task {
        task.await.context("Stream server task failed")??;
    }

    let samples = joined.context("Sampling task failed")??;
    info!(samples, "Done");
    Ok(())
}
