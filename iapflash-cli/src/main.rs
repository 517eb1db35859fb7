//! iapflash CLI - Command-line tool for updating firmware over an IAP
//! serial bootloader.
//!
//! ## Features
//!
//! - Flash raw firmware images with a progress bar
//! - Show firmware version metadata and the transfer plan
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use iapflash::{DataBits, FlowControl, Parity, SerialConfig, StopBits};
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Default baud rate when neither CLI, environment nor config set one.
pub(crate) const DEFAULT_BAUD: u32 = 115200;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Errors that select a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or setup problem (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Cancelled by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// iapflash - Update firmware over a serial IAP bootloader.
///
/// Environment variables:
///   IAPFLASH_PORT              - Default serial port
///   IAPFLASH_BAUD              - Default baud rate (default: 115200)
///   IAPFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "iapflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    iapflash info app.bin\n  \
    iapflash -p /dev/ttyUSB0 flash app.bin\n  \
    iapflash -p COM3 -b 57600 --parity even flash --chunk-size 512 app.bin")]
struct Cli {
    /// Serial port to use (prompted for if not specified).
    #[arg(short, long, global = true, env = "IAPFLASH_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "IAPFLASH_BAUD")]
    baud: Option<u32>,

    /// Parity (none, even, odd).
    #[arg(long, global = true)]
    parity: Option<Parity>,

    /// Stop bits (1, 2).
    #[arg(long, global = true)]
    stop_bits: Option<StopBits>,

    /// Data bits (5, 6, 7, 8).
    #[arg(long, global = true)]
    data_bits: Option<DataBits>,

    /// Flow control (none, software, hardware).
    #[arg(long, global = true)]
    flow_control: Option<FlowControl>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "IAPFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash a firmware image to the target.
    Flash {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Data bytes per packet (1-1024) [default: 1024].
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Milliseconds to wait for the ACK to the header while the target
        /// erases flash, 0 waits forever [default: 5000].
        #[arg(long)]
        header_timeout_ms: Option<u64>,

        /// Milliseconds to wait for the ACK to each packet, 0 waits forever
        /// [default: 100]. Raise it for targets that program slowly.
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Ignore unexpected bytes from the target instead of aborting.
        #[arg(long)]
        lenient: bool,
    },

    /// Show information about a firmware image.
    Info {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    iapflash::set_interrupt_checker(was_interrupted);

    debug!(
        "iapflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Flash {
            firmware,
            chunk_size,
            header_timeout_ms,
            timeout_ms,
            lenient,
        } => {
            let options = commands::flash::FlashOptions {
                chunk_size: *chunk_size,
                header_timeout_ms: *header_timeout_ms,
                timeout_ms: *timeout_ms,
                lenient: *lenient,
            };
            commands::flash::cmd_flash(cli, &mut config, firmware, &options)
        },
        Commands::Info { firmware, json } => commands::info::cmd_info(&config, firmware, *json),
        Commands::ListPorts { json } => commands::info::cmd_list_ports(*json),
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
            Ok(())
        },
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Cancelled(_) => 130,
        };
    }
    if matches!(
        err.downcast_ref::<iapflash::Error>(),
        Some(iapflash::Error::Cancelled)
    ) || was_interrupted()
    {
        return 130;
    }
    1
}

/// Get serial port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if selected.from_discovery && !cli.non_interactive {
        ask_remember_port(&selected.name, config)?;
    }

    Ok(selected.name)
}

/// Build the serial configuration: CLI and environment, then config file,
/// then defaults.
pub(crate) fn serial_config(cli: &Cli, config: &Config, port_name: &str) -> Result<SerialConfig> {
    let usage = |e: iapflash::Error| -> anyhow::Error { CliError::Usage(e.to_string()).into() };
    let file = &config.port;

    let parity = match (cli.parity, file.parity.as_deref()) {
        (Some(p), _) => p,
        (None, Some(s)) => s.parse().map_err(usage)?,
        (None, None) => Parity::default(),
    };
    let stop_bits = match (cli.stop_bits, file.stop_bits.as_deref()) {
        (Some(s), _) => s,
        (None, Some(s)) => s.parse().map_err(usage)?,
        (None, None) => StopBits::default(),
    };
    let data_bits = match (cli.data_bits, file.data_bits) {
        (Some(d), _) => d,
        (None, Some(bits)) => DataBits::try_from(bits).map_err(usage)?,
        (None, None) => DataBits::default(),
    };
    let flow_control = match (cli.flow_control, file.flow_control.as_deref()) {
        (Some(f), _) => f,
        (None, Some(s)) => s.parse().map_err(usage)?,
        (None, None) => FlowControl::default(),
    };
    let baud = cli.baud.or(file.baud).unwrap_or(DEFAULT_BAUD);

    let serial = SerialConfig::new(port_name, baud)
        .with_parity(parity)
        .with_stop_bits(stop_bits)
        .with_data_bits(data_bits)
        .with_flow_control(flow_control);
    serial.validate().map_err(usage)?;
    Ok(serial)
}
