use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use robot_config::{load_bus, load_calibration, load_network, REQUIRED_MOTOR_IDS};
use servo_transport::{BusConfig, MockLink, SerialLink, ServoBus};
use std::io::Write;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use teleop_protocol::record::wall_time_s;
use tracing::info;

mod replay;
mod send;

#[derive(Parser, Debug)]
#[command(
    name = "teleop",
    version,
    about = "Teleoperated arm bench tools",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use the simulated servo bus (portable)
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Servo bus config
    #[arg(long, global = true, default_value = "configs/dynamixel.yaml")]
    bus: PathBuf,

    /// Joint calibration JSON
    #[arg(long, global = true, default_value = "configs/robot_calibration.json")]
    calibration: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ping servo ids 1..6
    BusPing,
    /// Torque on, hold, then torque off
    BusTorque {
        /// Seconds to hold torque
        #[arg(long, default_value_t = 2.0)]
        hold_s: f64,
    },
    /// Torque on and move every joint to its calibration midpoint
    BusHome,
    /// Check that a serial device opens at a baud rate
    PortTest {
        #[arg(long, default_value = "/dev/ttyUSB0")]
        device: String,
        #[arg(long, default_value_t = 1_000_000)]
        baud: u32,
    },
    /// List serial ports
    PortList,
    /// Replay the commanded targets of a tick log
    Replay {
        /// Path to a .ticklog file
        path: PathBuf,
        /// Playback speed multiplier (1.0 = real time)
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },
    /// Stream commands to a running controller
    Send {
        /// Controller address host:port
        #[arg(long, default_value = "127.0.0.1:5055")]
        addr: String,
        /// Commands per second
        #[arg(long, default_value_t = 30.0)]
        rate_hz: f64,
        /// Number of commands to send
        #[arg(long, default_value_t = 90)]
        count: u64,
        #[arg(long, default_value_t = 0.9)]
        confidence: f64,
        #[arg(long, action = ArgAction::SetTrue)]
        estop: bool,
        /// Send torque=false
        #[arg(long, action = ArgAction::SetTrue)]
        no_torque: bool,
        /// Set the home feature
        #[arg(long, action = ArgAction::SetTrue)]
        home: bool,
        /// Joint target as id=position; repeatable
        #[arg(long = "joint")]
        joints: Vec<String>,
    },
    /// Load and print every config file
    ConfigCheck {
        #[arg(long, default_value = "configs/network.yaml")]
        network: PathBuf,
    },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::PortList => port_list(cli.mock),
        Commands::PortTest { device, baud } => port_test(cli.mock, device, *baud),
        Commands::Send {
            addr,
            rate_hz,
            count,
            confidence,
            estop,
            no_torque,
            home,
            joints,
        } => {
            let template = send::CommandTemplate {
                confidence: *confidence,
                estop: *estop,
                torque: !*no_torque,
                home: *home,
                joints: send::parse_joints(joints)?,
            };
            send_commands(addr, *rate_hz, *count, &template)
        }
        Commands::ConfigCheck { network } => config_check(network, &cli.bus, &cli.calibration),
        _ => {
            let config = load_bus(&cli.bus)?.bus_config();
            if cli.mock {
                return bus_command::<MockLink>(&cli, config);
            }
            #[cfg(feature = "serial")]
            {
                bus_command::<servo_transport::SerialPortLink>(&cli, config)
            }
            #[cfg(not(feature = "serial"))]
            {
                bail!("built without the `serial` feature; rerun with --mock")
            }
        }
    }
}

fn bus_command<L: SerialLink>(cli: &Cli, config: BusConfig) -> Result<()> {
    let mut bus = ServoBus::<L>::new(config, REQUIRED_MOTOR_IDS);
    bus.open().context("opening servo bus")?;
    let result = match &cli.command {
        Commands::BusPing => {
            for id in REQUIRED_MOTOR_IDS {
                if !bus.ping(id) {
                    println!("PING id={id}: FAIL");
                    continue;
                }
                match bus.model_number(id) {
                    Ok(model) => println!("PING id={id}: OK model={model}"),
                    Err(err) => println!("PING id={id}: OK (model read failed: {err})"),
                }
            }
            Ok(())
        }
        Commands::BusTorque { hold_s } => bus_torque(&mut bus, *hold_s),
        Commands::BusHome => {
            let calibration = load_calibration(&cli.calibration)?;
            bus.torque_all(true).context("enabling torque")?;
            bus.sync_write_positions(&calibration.midpoints())
                .context("writing home pose")?;
            println!("Sent home pose");
            Ok(())
        }
        Commands::Replay { path, speed } => {
            let calibration = load_calibration(&cli.calibration)?;
            let records = replay::load_records(path)?;
            println!(
                "replay: {} ({} records, speed {speed})",
                path.display(),
                records.len()
            );
            let writes = replay::replay(&mut bus, &records, &calibration, *speed, thread::sleep)?;
            println!("Replay complete ({writes} writes)");
            Ok(())
        }
        other => Err(anyhow::anyhow!("{other:?} does not use the servo bus")),
    };
    bus.close();
    result
}

fn bus_torque<L: SerialLink>(bus: &mut ServoBus<L>, hold_s: f64) -> Result<()> {
    println!("Torque ON");
    bus.torque_all(true).context("enabling torque")?;
    thread::sleep(Duration::from_secs_f64(hold_s.max(0.0)));
    println!("Torque OFF");
    bus.torque_all(false).context("releasing torque")?;
    Ok(())
}

fn port_list(mock: bool) -> Result<()> {
    let ports = if mock {
        MockLink::list()?
    } else {
        #[cfg(feature = "serial")]
        {
            servo_transport::SerialPortLink::list()?
        }
        #[cfg(not(feature = "serial"))]
        {
            bail!("built without the `serial` feature; rerun with --mock")
        }
    };
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for p in ports {
        println!("{}\t{}", p.name, p.driver);
    }
    Ok(())
}

fn port_test(mock: bool, device: &str, baud: u32) -> Result<()> {
    if mock {
        let _link = MockLink::open(device, baud)?;
    } else {
        #[cfg(feature = "serial")]
        {
            let _link = servo_transport::SerialPortLink::open(device, baud)?;
        }
        #[cfg(not(feature = "serial"))]
        {
            bail!("built without the `serial` feature; rerun with --mock")
        }
    }
    println!("Opened {device} at {baud}");
    Ok(())
}

fn send_commands(
    addr: &str,
    rate_hz: f64,
    count: u64,
    template: &send::CommandTemplate,
) -> Result<()> {
    if !(rate_hz.is_finite() && rate_hz > 0.0) {
        bail!("rate must be positive, got {rate_hz}");
    }
    let period = Duration::from_secs_f64(1.0 / rate_hz);
    let mut stream = TcpStream::connect(addr).with_context(|| format!("connecting to {addr}"))?;
    stream.set_nodelay(true)?;
    info!(addr, count, rate_hz, "streaming commands");
    let start = Instant::now();
    for seq in 0..count {
        let line = template.command(seq, wall_time_s()).to_line();
        stream
            .write_all(line.as_bytes())
            .with_context(|| format!("sending seq {seq}"))?;
        let next = start + period.mul_f64((seq + 1) as f64);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    println!("sent {count} commands to {addr}");
    Ok(())
}

fn config_check(network: &Path, bus: &Path, calibration: &Path) -> Result<()> {
    let net = load_network(network)?;
    let bus_file = load_bus(bus)?;
    let calib = load_calibration(calibration)?;
    println!("{}", serde_json::to_string_pretty(&net)?);
    println!("{}", serde_json::to_string_pretty(&bus_file.bus_config())?);
    println!("{}", serde_json::to_string_pretty(&bus_file.behavior)?);
    for joint in calib.iter() {
        println!(
            "motor {}: [{}, {}] offset {} home {}",
            joint.motor_id,
            joint.range_min,
            joint.range_max,
            joint.homing_offset,
            joint.midpoint()
        );
    }
    println!("config OK");
    Ok(())
}

fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
