use anyhow::{Context, Result};
use clap::Parser;
use robot_config::{load_bus, load_calibration, load_network, CalibrationSet, REQUIRED_MOTOR_IDS};
use safety_guard::SafetyArbiter;
use servo_transport::{MockLink, SerialLink, ServoBus};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use teleop_net::IngressListener;
use teleop_protocol::TickLogWriter;
use tracing::{debug, info, info_span};
use uuid::Uuid;

mod control;
mod metrics;
mod sink;

use control::{ControlLoop, PresentRead, SessionEnd};
use metrics::LoopMetrics;

#[derive(Parser)]
#[command(name = "teleop-daemon")]
#[command(about = "Serve one operator connection and drive the arm's servo bus")]
struct Args {
    /// Network config (listener and staleness timeouts)
    #[arg(long, default_value = "configs/network.yaml")]
    network: PathBuf,

    /// Servo bus config (device, protocol, control table)
    #[arg(long, default_value = "configs/dynamixel.yaml")]
    bus: PathBuf,

    /// Joint calibration JSON
    #[arg(long, default_value = "configs/robot_calibration.json")]
    calibration: PathBuf,

    /// Directory for tick logs
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Override the listening port from the network config
    #[arg(long)]
    port: Option<u16>,

    /// Use the simulated servo bus instead of a serial device
    #[arg(long)]
    mock: bool,

    /// Write the prometheus text exposition here on exit
    #[arg(long)]
    metrics_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();

    let mut network = load_network(&args.network)?;
    if let Some(port) = args.port {
        network.tcp.pi_port = port;
    }
    let bus_file = load_bus(&args.bus)?;
    let calibration = load_calibration(&args.calibration)?;
    info!(joints = calibration.len(), "calibration loaded");

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("installing ctrl-c handler")?;

    let settings = Settings {
        args: &args,
        network,
        bus_file,
    };
    if args.mock {
        return serve::<MockLink>(settings, calibration, &shutdown);
    }
    #[cfg(feature = "serial")]
    {
        serve::<servo_transport::SerialPortLink>(settings, calibration, &shutdown)
    }
    #[cfg(not(feature = "serial"))]
    {
        anyhow::bail!("built without the `serial` feature; rerun with --mock")
    }
}

struct Settings<'a> {
    args: &'a Args,
    network: robot_config::NetworkConfig,
    bus_file: robot_config::BusFile,
}

fn serve<L: SerialLink>(
    settings: Settings<'_>,
    calibration: CalibrationSet,
    shutdown: &AtomicBool,
) -> Result<()> {
    let Settings {
        args,
        network,
        bus_file,
    } = settings;
    let tcp = &network.tcp;
    let metrics = LoopMetrics::new().context("registering metrics")?;

    let mut bus = ServoBus::<L>::new(bus_file.bus_config(), REQUIRED_MOTOR_IDS);
    bus.open().context("opening servo bus")?;

    let (log, log_path) = TickLogWriter::create_in(&args.log_dir).context("creating tick log")?;
    info!(path = %log_path.display(), "tick log started");

    let now = Instant::now();
    let arbiter = SafetyArbiter::new(
        calibration,
        tcp.stale_timeout(),
        tcp.hard_stop_timeout(),
        now,
    );
    let present = PresentRead {
        enabled: bus_file.behavior.enable_present_read,
        period: bus_file.behavior.present_period(),
    };
    let mut control = ControlLoop::new(bus, arbiter, log, metrics.clone(), present, now);
    control.startup().context("enabling torque")?;

    let served = run_session(&mut control, tcp, shutdown);

    let log = control.shutdown();
    debug!(rows = log.rows(), "tick log closed");
    let text = metrics.encode_text();
    debug!("metrics:\n{text}");
    if let Some(path) = &args.metrics_out {
        std::fs::write(path, &text).with_context(|| format!("writing {}", path.display()))?;
    }
    info!("shutdown complete");
    served
}

fn run_session<L: SerialLink, S: sink::TickSink>(
    control: &mut ControlLoop<L, S>,
    tcp: &robot_config::TcpConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    let listener = IngressListener::bind(tcp.bind_addr(), tcp.read_timeout())
        .with_context(|| format!("binding {}", tcp.bind_addr()))?;
    let accepted = listener.accept_until(shutdown);
    let Some(conn) = accepted.context("accepting operator")? else {
        info!("interrupted before a client connected");
        return Ok(());
    };

    let session = info_span!("session", id = %Uuid::new_v4(), peer = %conn.peer());
    let _guard = session.enter();
    let mut reader = teleop_net::lines(conn);
    match control.serve(&mut reader, shutdown) {
        SessionEnd::Connection(err) => info!(reason = %err, "connection ended"),
        SessionEnd::Shutdown => info!("shutdown requested"),
    }
    debug!(
        mode = ?control.mode(),
        targets = ?control.last_targets(),
        received = control.stats().rx_count,
        "session over"
    );
    reader.get_ref().close();
    Ok(())
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
