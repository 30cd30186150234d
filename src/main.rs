use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use fleet_lite::command_file::{CommandFileParser, LineCommandFileParser};
use fleet_lite::config::{HandoverConfig, SchedulerConfig, DEFAULT_CONTROL_PORT};
use fleet_lite::configuration::{append_extra_args, ArgsConfigurationFactory, ConfigurationFactory};
use fleet_lite::dashboard::run_dashboard;
use fleet_lite::device::LocalDevicePool;
use fleet_lite::scheduler::CommandScheduler;
use fleet_lite::shutdown::install_shutdown_handler;
use fleet_lite::worker::ShellInvocationExecutor;

#[derive(Parser, Debug)]
#[command(name = "fleet-lite")]
#[command(version)]
#[command(about = "A fair, device-aware command scheduler for device fleets")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the scheduler
    Run(RunArgs),

    /// Parse a command file and print the commands it defines
    CheckCmdfile(CheckArgs),
}

// =============================================================================
// Run Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// Command file to load (repeatable)
    #[arg(long = "cmdfile")]
    cmdfiles: Vec<PathBuf>,

    /// Extra arguments appended to every command of the loaded command files
    #[arg(long = "cmdfile-arg", allow_hyphen_values = true)]
    cmdfile_args: Vec<String>,

    /// Watch command files and reload them when they change
    #[arg(long)]
    reload_cmdfiles: bool,

    /// Interval between command file checks
    #[arg(long, default_value = "20000")]
    cmdfile_poll_interval_ms: u64,

    /// Shut down if a command file fails to load or reload
    #[arg(long)]
    shutdown_on_cmdfile_error: bool,

    /// Serial of a device to manage (repeatable)
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Number of placeholder devices to create
    #[arg(long, default_value = "0")]
    placeholder_devices: usize,

    /// Upper bound on the scheduling loop sleep
    #[arg(long, default_value = "30000")]
    poll_interval_ms: u64,

    /// Window between a stop request and forced interruption (0 disables)
    #[arg(long, default_value = "0")]
    stop_escalation_ms: u64,

    /// Exit once no command is left
    #[arg(long)]
    shutdown_on_empty: bool,

    // === Handover Options ===
    /// Start the handover control listener
    #[arg(long)]
    handover: bool,

    /// Port of the handover control listener
    #[arg(long, default_value_t = DEFAULT_CONTROL_PORT)]
    control_port: u16,

    /// Take the fleet over from a scheduler already bound to the control port
    #[arg(long, requires = "handover")]
    auto_handover: bool,

    /// Port for the web dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// A single command to add, after `--`
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Parser, Debug)]
struct CheckArgs {
    /// Command file to parse
    path: PathBuf,

    /// Extra arguments appended to every command
    #[arg(long = "cmdfile-arg", allow_hyphen_values = true)]
    cmdfile_args: Vec<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct CheckedCommandOutput {
    name: String,
    args: Vec<String>,
    loop_mode: bool,
    devices: Vec<String>,
    error: Option<String>,
}

// =============================================================================
// Scheduler
// =============================================================================

async fn run_scheduler(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let pool = Arc::new(LocalDevicePool::new());
    for serial in &args.devices {
        pool.add_device(serial, None);
    }
    pool.add_placeholder_devices(args.placeholder_devices);

    let handover = HandoverConfig {
        enabled: args.handover,
        control_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), args.control_port),
        auto_handover: args.auto_handover,
        ..HandoverConfig::default()
    };
    let mut config = SchedulerConfig::new(args.poll_interval_ms)
        .with_stop_escalation(args.stop_escalation_ms)
        .with_handover(handover);
    if args.reload_cmdfiles {
        config = config.with_command_file_reload(args.cmdfile_poll_interval_ms);
    }
    config.shutdown_on_command_file_error = args.shutdown_on_cmdfile_error;

    tracing::info!(
        devices = ?args.devices,
        placeholder_devices = args.placeholder_devices,
        poll_interval_ms = config.poll_interval_ms,
        handover = config.handover.enabled,
        dashboard_port = ?args.dashboard_port,
        "Starting fleet-lite scheduler"
    );

    let scheduler = CommandScheduler::new(config, pool, Arc::new(ShellInvocationExecutor::new()));

    for path in &args.cmdfiles {
        match scheduler.add_command_file(path, &args.cmdfile_args).await {
            Ok(ids) => tracing::info!(path = %path.display(), commands = ids.len(), "Command file loaded"),
            Err(e) if args.shutdown_on_cmdfile_error => {
                return Err(format!("Failed to load {}: {}", path.display(), e).into());
            }
            Err(e) => tracing::error!(path = %path.display(), error = %e, "Failed to load command file"),
        }
    }
    if !args.command.is_empty() {
        scheduler.add_command(&args.command).await?;
    }
    if args.shutdown_on_empty {
        scheduler.shutdown_on_empty().await;
    }

    if let Some(port) = args.dashboard_port {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        tokio::spawn(run_dashboard(addr, scheduler.clone()));
    }

    let signals = install_shutdown_handler()?;
    let handle = scheduler.start();

    {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            signals.graceful.cancelled().await;
            scheduler.shutdown().await;
            signals.hard.cancelled().await;
            scheduler.shutdown_hard().await;
        });
    }

    handle.await?;
    tracing::info!(exit_code = %scheduler.last_invocation_exit_code(), "Scheduler exited");
    Ok(())
}

// =============================================================================
// Command File Check
// =============================================================================

fn check_cmdfile(args: CheckArgs) -> Result<(), Box<dyn std::error::Error>> {
    let parsed = LineCommandFileParser::new().parse(&args.path)?;
    let factory = ArgsConfigurationFactory::new();

    let outputs: Vec<CheckedCommandOutput> = parsed
        .commands
        .into_iter()
        .map(|mut cmd_args| {
            append_extra_args(&mut cmd_args, &args.cmdfile_args);
            match factory.create_configuration(&cmd_args) {
                Ok(config) => CheckedCommandOutput {
                    name: config.name.clone(),
                    loop_mode: config.is_loop_mode(),
                    devices: config.device_configs.iter().map(|d| d.name.clone()).collect(),
                    args: cmd_args,
                    error: None,
                },
                Err(e) => CheckedCommandOutput {
                    name: cmd_args.first().cloned().unwrap_or_default(),
                    loop_mode: false,
                    devices: Vec::new(),
                    args: cmd_args,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect();

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&outputs)?);
        }
        OutputFormat::Table => {
            println!("{:<20} {:<6} {:<20} ARGS", "NAME", "LOOP", "DEVICES");
            println!("{}", "-".repeat(80));
            for out in &outputs {
                let args_display = match out.error {
                    Some(ref e) => format!("ERROR: {}", e),
                    None => out.args.join(" "),
                };
                println!(
                    "{:<20} {:<6} {:<20} {}",
                    out.name,
                    out.loop_mode,
                    out.devices.join(","),
                    args_display
                );
            }
        }
    }

    if outputs.iter().any(|o| o.error.is_some()) {
        return Err("Command file contains invalid commands".into());
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => {
            run_scheduler(run_args).await?;
        }
        Commands::CheckCmdfile(check_args) => {
            check_cmdfile(check_args)?;
        }
    }

    Ok(())
}
