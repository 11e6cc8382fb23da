//! nexflash CLI - Command-line tool for uploading firmware to Nextion
//! serial displays.
//!
//! ## Features
//!
//! - Upload `.tft` firmware images over the display's native protocol
//! - Automatic baud-rate discovery and transfer-speed negotiation
//! - Interactive serial port selection
//! - Serial monitor for display diagnostics
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Whether Ctrl-C was pressed.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Check if the user requested an interrupt.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// CLI failure classes mapped to distinct exit codes.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Usage or setup problem (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// User interrupt or cancelled prompt (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// nexflash - upload firmware to Nextion serial displays.
///
/// Environment variables:
///   NEXFLASH_PORT              - Default serial port
///   NEXFLASH_BAUD              - Default transfer baud rate (default: 256000)
///   NEXFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "nexflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "NEXFLASH_PORT")]
    port: Option<String>,

    /// Transfer baud rate negotiated during the upload handshake.
    #[arg(
        short,
        long,
        global = true,
        default_value = "256000",
        env = "NEXFLASH_BAUD"
    )]
    baud: u32,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "NEXFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// List all available ports (including unknown types).
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Upload a firmware image to the display.
    Upload {
        /// Path to the firmware image (.tft).
        firmware: PathBuf,

        /// Open the serial monitor after uploading.
        #[arg(long)]
        monitor: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Open a serial monitor on the display link.
    Monitor {
        /// Baud rate for monitoring (default: 115200).
        #[arg(long, default_value = "115200")]
        monitor_baud: u32,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    match run() {
        Ok(()) => {},
        Err(err) => {
            if let Some(cli_err) = err.downcast_ref::<CliError>() {
                match cli_err {
                    CliError::Usage(msg) => {
                        eprintln!("{} {msg}", style("Error:").red().bold());
                        std::process::exit(2);
                    },
                    CliError::Cancelled(msg) => {
                        eprintln!("{} {msg}", style("Cancelled:").yellow().bold());
                        std::process::exit(130);
                    },
                }
            }
            eprintln!("{} {err:#}", style("Error:").red().bold());
            std::process::exit(1);
        },
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if std::env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

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

    debug!(
        "nexflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // First Ctrl-C requests cooperative cancellation; a second one exits.
    ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(130);
        }
    })
    .ok();

    // Load configuration
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Upload { firmware, monitor } => {
            commands::upload::cmd_upload(&cli, &mut config, firmware)?;
            if *monitor {
                eprintln!();
                commands::monitor::cmd_monitor(&cli, &mut config, 115200)?;
            }
        },
        Commands::ListPorts { json } => {
            commands::list_ports::cmd_list_ports(*json);
        },
        Commands::Monitor { monitor_baud } => {
            commands::monitor::cmd_monitor(&cli, &mut config, *monitor_baud)?;
        },
        Commands::Completions { shell } => {
            commands::completions::cmd_completions(*shell);
        },
    }

    Ok(())
}

/// Get serial port from CLI args, config, or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    // Ask to remember if not a known device and interactive mode
    if !selected.is_known && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
