//! Command line front end for a servo bus.
//!
//! ```sh
//! servobus ports
//! servobus --port /dev/ttyACM0 --ids 1,2,3,4,5,6 positions
//! servobus --config servobus.json calibrate
//! servobus --config servobus.json move 1=45 2=-10.5
//! servobus --simulate --ids 1,2 watch
//! ```
//!
//! `calibrate` releases torque and walks through the three reference
//! poses; press Enter once every joint is in position. Commands that enable
//! torque hold the joints until Enter, torque is released on exit.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use cu_servobus::sim::SimulatedBus;
use cu_servobus::{
    list_ports, BusConfig, BusTransport, Engine, MemoryStore, PointName, PollEvent, PollSettings,
    PositionPoller, ServoBus, ServoId,
};
use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive Feetech serial bus servos")]
struct Args {
    /// JSON bus configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port, overrides the configuration
    #[arg(short, long)]
    port: Option<String>,

    /// Comma separated servo ids, overrides the configuration
    #[arg(long, value_delimiter = ',')]
    ids: Vec<ServoId>,

    /// Calibration file, overrides the configuration
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Run against an in-memory bus instead of hardware
    #[arg(long)]
    simulate: bool,

    /// Log more
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports on this machine
    Ports,
    /// Print engine status
    Status,
    /// Print raw positions
    Positions,
    /// Print calibrated angles in degrees
    Angles,
    /// Switch torque on or off
    Torque {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },
    /// Move every joint to 0°
    Center,
    /// Move joints, e.g. `move 1=45 3=-20`
    Move {
        #[arg(required = true, value_parser = parse_target)]
        targets: Vec<(ServoId, f64)>,
    },
    /// Record a new calibration interactively
    Calibrate,
    /// Print angles whenever a joint moves, until Enter
    Watch {
        #[arg(long, default_value_t = 250)]
        interval_ms: u64,
    },
}

fn parse_target(s: &str) -> Result<(ServoId, f64), String> {
    let (id, angle) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=DEGREES, got '{s}'"))?;
    let id = id.trim().parse().map_err(|e| format!("servo id '{id}': {e}"))?;
    let angle = angle.trim().parse().map_err(|e| format!("angle '{angle}': {e}"))?;
    Ok((id, angle))
}

fn bus_config(args: &Args) -> anyhow::Result<BusConfig> {
    let mut config = match &args.config {
        Some(path) => BusConfig::load(path)?,
        None => BusConfig::new(
            args.port.clone().unwrap_or_else(|| "sim".to_string()),
            Vec::new(),
        ),
    };
    if let Some(port) = &args.port {
        config.port = port.clone();
    }
    if !args.ids.is_empty() {
        config.servo_ids = args.ids.clone();
    }
    if let Some(path) = &args.calibration {
        config.calibration_file = path.clone();
    }
    if config.port == "sim" && !args.simulate {
        bail!("no serial port given, use --port, --config or --simulate");
    }
    config.validate()?;
    Ok(config)
}

fn wait_for_enter(prompt: &str) -> anyhow::Result<()> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

fn print_angles(angles: &BTreeMap<ServoId, f64>) {
    let line: Vec<String> = angles.iter().map(|(id, a)| format!("s{id}:{a:>7.1}°")).collect();
    println!("  {}", line.join("  "));
}

fn calibrate<T: BusTransport>(engine: &Engine<T>) -> anyhow::Result<()> {
    let ids = engine.servo_ids();
    engine.start_calibration()?;
    println!("Torque released. Move the arm by hand.\n");

    let poses = [
        (PointName::Zero, "the zero pose (every joint at 0°)"),
        (PointName::Max, "the +90° pose"),
        (PointName::Min, "the -90° pose"),
    ];
    for (point, pose) in poses {
        if let Err(e) = wait_for_enter(&format!("Put every joint in {pose}, then press Enter. ")) {
            engine.cancel_calibration()?;
            return Err(e);
        }
        for &id in &ids {
            let value = engine.set_calibration_point(id, point, None)?;
            println!("  servo {id:>3}: {point} = {value:>4}");
        }
    }

    let set = engine.end_calibration()?;
    println!("\nCalibration saved at {}:", set.timestamp);
    for (id, p) in &set.servos {
        let dir = if p.is_reversed() { "  (reversed)" } else { "" };
        println!(
            "  servo {id:>3}: zero={:>4}  min={:>4}  max={:>4}{dir}",
            p.zero, p.min, p.max
        );
    }
    Ok(())
}

fn watch<T: BusTransport + 'static>(engine: &Engine<T>, interval_ms: u64) -> anyhow::Result<()> {
    println!("Watching joints, press Enter to stop.");
    let settings = PollSettings {
        interval: std::time::Duration::from_millis(interval_ms),
        ..PollSettings::default()
    };
    let failed = Arc::new(AtomicBool::new(false));
    let failed2 = failed.clone();
    let mut poller = PositionPoller::spawn(engine.clone(), settings, move |event| match event {
        PollEvent::Angles(angles) => print_angles(&angles),
        PollEvent::Failed(_) => failed2.store(true, Ordering::Relaxed),
    });
    wait_for_enter("")?;
    poller.stop();
    if failed.load(Ordering::Relaxed) {
        log::warn!("some polls failed, see log above");
    }
    Ok(())
}

/// Torque is released on exit, so keep the joints held until the operator is ready.
fn hold() -> anyhow::Result<()> {
    wait_for_enter("Holding position, press Enter to release torque and exit. ")
}

fn print_ports() -> anyhow::Result<()> {
    for port in list_ports()? {
        println!("{port}");
    }
    Ok(())
}

fn run<T: BusTransport + 'static>(engine: Engine<T>, command: Command) -> anyhow::Result<()> {
    if !matches!(command, Command::Ports) {
        engine.connect().context("connecting to the bus")?;
    }
    match command {
        Command::Ports => print_ports()?,
        Command::Status => println!("{}", serde_json::to_string_pretty(&engine.status())?),
        Command::Positions => {
            for (id, pos) in engine.get_positions()? {
                println!("  servo {id:>3}: {pos:>4}");
            }
        }
        Command::Angles => print_angles(&engine.get_angles()?),
        Command::Torque { state } => {
            engine.set_torque(state == "on")?;
            if engine.get_torque() {
                hold()?;
            }
        }
        Command::Center => {
            engine.set_torque(true)?;
            engine.center()?;
            hold()?;
        }
        Command::Move { targets } => {
            engine.set_torque(true)?;
            engine.set_angle(&targets.into_iter().collect())?;
            hold()?;
        }
        Command::Calibrate => calibrate(&engine)?,
        Command::Watch { interval_ms } => watch(&engine, interval_ms)?,
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        ConfigBuilder::new().set_time_level(LevelFilter::Off).build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    if matches!(args.command, Command::Ports) {
        return print_ports();
    }

    let config = bus_config(&args)?;
    if args.simulate {
        let sim = SimulatedBus::with_servos(&config.servo_ids);
        run(Engine::new(ServoBus::new(config, sim, MemoryStore::default())?), args.command)
    } else {
        run(Engine::open_serial(config)?, args.command)
    }
}
