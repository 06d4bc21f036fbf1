//! CLI entry point for the lickport rig supervisor
//!
//! # Usage
//!
//! List serial ports:
//! ```bash
//! lickport-rig ports
//! ```
//!
//! Preview a schedule:
//! ```bash
//! lickport-rig schedule --labels vanilla,almond,banana,cherry --blocks 2
//! ```
//!
//! Run on hardware (operator triggers are read from stdin):
//! ```bash
//! lickport-rig run --config config/rig.toml --labels vanilla,almond
//! ```
//!
//! Dry run against simulated boards:
//! ```bash
//! lickport-rig simulate --labels vanilla,almond --iti-ms 500 --ttc-ms 2000 --sample-ms 500
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use lickport_rig::config::RigConfig;
use lickport_rig::hardware::sim::{spawn_random_licks, SimOptions, SimulatedBoards};
use lickport_rig::hardware::LinkPair;
use lickport_rig::ingest::EventQueue;
use lickport_rig::logging::{self, OutputFormat, TracingConfig};
use lickport_rig::records;
use lickport_rig::schedule::{self, IntervalSpec, ScheduleRequest};
use lickport_rig::{Phase, RigHandle, RigNotification, TrialStateMachine};

#[derive(Parser)]
#[command(name = "lickport-rig")]
#[command(about = "Supervisor for a two-port lick choice rig", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/rig.toml")]
    config: PathBuf,

    /// Log output format (overrides configuration)
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports visible to this host
    Ports,

    /// Generate a schedule and print it
    Schedule {
        #[command(flatten)]
        schedule: ScheduleArgs,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Run a session on the configured serial ports
    Run {
        #[command(flatten)]
        schedule: ScheduleArgs,
    },

    /// Run a session against simulated boards with random licks
    Simulate {
        #[command(flatten)]
        schedule: ScheduleArgs,

        /// Mean time between simulated licks
        #[arg(long, default_value = "400")]
        lick_interval_ms: u64,

        /// Simulated door travel time
        #[arg(long, default_value = "50")]
        door_travel_ms: u64,
    },
}

/// Overrides applied on top of the configured schedule defaults
#[derive(Args, Debug, Default)]
struct ScheduleArgs {
    /// Stimulus labels for slots 1, 2, ... (comma separated)
    #[arg(long, value_delimiter = ',')]
    labels: Vec<String>,

    /// Number of blocks
    #[arg(long)]
    blocks: Option<u32>,

    /// Fixed ITI in ms (no jitter)
    #[arg(long)]
    iti_ms: Option<u64>,

    /// Fixed TTC window in ms (no jitter)
    #[arg(long)]
    ttc_ms: Option<u64>,

    /// Fixed sample length in ms (no jitter)
    #[arg(long)]
    sample_ms: Option<u64>,

    /// Seed for reproducible schedules
    #[arg(long)]
    seed: Option<u64>,
}

impl ScheduleArgs {
    fn request(&self, config: &RigConfig) -> ScheduleRequest {
        let mut request = config.schedule.to_request();
        for (slot, label) in self.labels.iter().enumerate() {
            if let Some(existing) = request.labels.get_mut(slot) {
                *existing = label.trim().to_string();
            }
        }
        if let Some(blocks) = self.blocks {
            request.block_count = blocks;
        }
        if let Some(ms) = self.iti_ms {
            request.iti = IntervalSpec::fixed(ms);
        }
        if let Some(ms) = self.ttc_ms {
            request.ttc = IntervalSpec::fixed(ms);
        }
        if let Some(ms) = self.sample_ms {
            request.sample = IntervalSpec::fixed(ms);
        }
        request
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RigConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let mut tracing_config = TracingConfig::from_rig_config(&config)?;
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    logging::init(tracing_config)?;
    tracing::debug!(config = %cli.config.display(), "Configuration loaded");

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Schedule { schedule, json } => print_schedule(&config, &schedule, json),
        Commands::Run { schedule } => run_hardware(&config, &schedule).await,
        Commands::Simulate {
            schedule,
            lick_interval_ms,
            door_travel_ms,
        } => simulate(&config, &schedule, lick_interval_ms, door_travel_ms).await,
    }
}

fn list_ports() -> Result<()> {
    let ports = serialport::available_ports().context("enumerating serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let kind = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            serialport::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{:<24} {}", port.port_name, kind);
    }
    Ok(())
}

fn print_schedule(config: &RigConfig, args: &ScheduleArgs, json: bool) -> Result<()> {
    let request = args.request(config);
    let mut rng = args
        .seed
        .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
    let trials = schedule::generate(&request, &mut rng)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&trials)?);
        return Ok(());
    }
    println!(
        "{:>5} {:>5}  {:<16} {:<16} {:>8} {:>8} {:>8}",
        "block", "trial", "port A", "port B", "iti_ms", "ttc_ms", "sample"
    );
    for t in &trials {
        println!(
            "{:>5} {:>5}  {:<16} {:<16} {:>8} {:>8} {:>8}",
            t.trial_block,
            t.trial_number,
            t.port_a_stimulus,
            t.port_b_stimulus,
            t.iti_ms,
            t.ttc_ms,
            t.sample_ms
        );
    }
    Ok(())
}

fn spawn_machine(
    config: &RigConfig,
    links: LinkPair,
    queue: EventQueue,
    seed: Option<u64>,
) -> RigHandle {
    let mut machine = TrialStateMachine::new(config.timing.clone(), links, queue);
    if let Some(seed) = seed {
        machine = machine.with_seed(seed);
    }
    let (rig, _task) = machine.spawn();
    rig
}

async fn run_hardware(config: &RigConfig, args: &ScheduleArgs) -> Result<()> {
    if config.motor.port.is_empty() || config.laser.port.is_empty() {
        bail!("both [motor] and [laser] ports must be configured for a hardware run");
    }
    let (sender, queue) = EventQueue::new();
    let links = LinkPair::open(config, sender).await?;
    let rig = spawn_machine(config, links, queue, args.seed);

    rig.generate_schedule(args.request(config)).await?;
    rig.start().await?;
    println!("Run started. Commands: start, stop, reset, status, export, quit");
    operator_console(config, args, &rig).await
}

async fn operator_console(config: &RigConfig, args: &ScheduleArgs, rig: &RigHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let result = match line.trim() {
            "" => continue,
            "start" => rig.start().await.map(|p| println!("phase: {p}")),
            "stop" => rig.stop().await.map(|p| println!("phase: {p}")),
            "generate" => rig
                .generate_schedule(args.request(config))
                .await
                .map(|p| println!("phase: {p}")),
            "reset" => rig.reset().await.map(|p| println!("phase: {p}")),
            "status" => rig.snapshot().await.map(|s| {
                println!(
                    "phase: {} trial: {} running: {} licks A/B: {}/{}",
                    s.phase, s.current_trial_number, s.is_running, s.port_a_licks, s.port_b_licks
                );
            }),
            "export" => export(config, rig).await,
            "quit" | "exit" => break,
            other => {
                println!("unknown command '{other}'");
                continue;
            }
        };
        if let Err(e) = result {
            println!("rejected: {e}");
        }
    }

    if rig.snapshot().await?.is_running {
        rig.stop().await?;
    }
    Ok(())
}

async fn export(config: &RigConfig, rig: &RigHandle) -> lickport_rig::RigResult<()> {
    let snapshot = rig.snapshot().await?;
    let paths = records::export_to_dir(
        &config.export.output_dir,
        &snapshot.trials,
        &snapshot.event_log,
    )?;
    println!("trials: {}", paths.trials.display());
    println!("events: {}", paths.events.display());
    Ok(())
}

async fn simulate(
    config: &RigConfig,
    args: &ScheduleArgs,
    lick_interval_ms: u64,
    door_travel_ms: u64,
) -> Result<()> {
    let boards = SimulatedBoards::spawn(SimOptions {
        door_travel: Duration::from_millis(door_travel_ms),
        timestamps: true,
        ..SimOptions::default()
    });
    let licker = spawn_random_licks(
        boards.licks.clone(),
        Duration::from_millis(lick_interval_ms),
        args.seed,
    );

    let (sender, queue) = EventQueue::new();
    let links = LinkPair::from_streams(boards.motor, boards.laser, sender);
    let rig = spawn_machine(config, links, queue, args.seed);
    let mut notifications = rig.subscribe();

    rig.generate_schedule(args.request(config)).await?;
    rig.start().await?;

    loop {
        match notifications.recv().await {
            Ok(RigNotification::TrialCompleted {
                trial_number,
                outcome,
            }) => println!(
                "trial {trial_number}: A={} B={} ttc_actual_ms={:?}",
                outcome.port_a_licks, outcome.port_b_licks, outcome.ttc_actual_ms
            ),
            Ok(RigNotification::Fault { reason }) => println!("fault: {reason}"),
            Ok(RigNotification::PhaseChanged {
                from: Phase::Stopping,
                to: Phase::Idle,
                ..
            }) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Notification stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    licker.abort();
    export(config, &rig).await?;
    Ok(())
}
