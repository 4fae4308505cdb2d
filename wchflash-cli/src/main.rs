//! wchflash CLI - Command-line tool for flashing WCH microcontrollers.
//!
//! ## Features
//!
//! - Flash `.bin`, `.hex` and `.elf` images over USB-ISP
//! - Erase code flash
//! - Identify the attached chip
//! - Production mode: flash every device as it is plugged in
//! - Simulated engine for running without hardware
//! - Shell completion generation
//! - Environment variable support

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod connect;

use commands::completions::{cmd_completions, cmd_completions_install};
use commands::flash::{cmd_erase, cmd_flash, cmd_identify, cmd_watch};
use commands::info::{cmd_chips, cmd_devices, cmd_info};
use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl-C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// Interrupted by the user (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for an error returned by a command.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<CliError>().map_or(1, CliError::exit_code)
}

/// wchflash - Connect, identify and flash WCH microcontrollers.
///
/// Environment variables:
///   WCHFLASH_CONFIG            - Path to a configuration file
///   WCHFLASH_SIMULATE          - Use the simulated engine and device
///   WCHFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "wchflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub(crate) verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub(crate) quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH", env = "WCHFLASH_CONFIG")]
    pub(crate) config_path: Option<PathBuf>,

    /// Use the simulated engine with a simulated attached device.
    #[arg(long, global = true, env = "WCHFLASH_SIMULATE")]
    pub(crate) simulate: bool,

    /// Seconds to wait for a supported device.
    #[arg(long, global = true, value_name = "SECS", default_value_t = 30)]
    pub(crate) wait: u64,

    /// Non-interactive mode (never prompt).
    #[arg(long, global = true, env = "WCHFLASH_NON_INTERACTIVE")]
    pub(crate) non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List supported devices currently attached.
    Devices {
        /// Output the device list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// List known chips.
    Chips {
        /// Output the chip table as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Validate a firmware file and show what would be flashed.
    Info {
        /// Path to the firmware file (.bin, .hex or .elf).
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Wait for a device, connect and print the chip identity.
    Identify,

    /// Flash a firmware file, then verify and reset.
    Flash {
        /// Path to the firmware file (.bin, .hex or .elf).
        firmware: PathBuf,

        /// Skip verification after flashing.
        #[arg(long)]
        no_verify: bool,

        /// Do not reset the chip after flashing.
        #[arg(long)]
        no_reset: bool,
    },

    /// Erase the chip's code flash.
    Erase {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Flash every supported device as it is plugged in, until Ctrl-C.
    Watch {
        /// Path to the firmware file (.bin, .hex or .elf).
        firmware: PathBuf,

        /// Stop after this many devices.
        #[arg(long, value_name = "N")]
        count: Option<u32>,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
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

    debug!("wchflash v{} (verbose level: {})", env!("CARGO_PKG_VERSION"), cli.verbose);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Devices { json } => cmd_devices(cli, &config, *json),
        Commands::Chips { json } => cmd_chips(*json),
        Commands::Info { firmware, json } => cmd_info(firmware, *json),
        Commands::Identify => cmd_identify(cli, &config),
        Commands::Flash {
            firmware,
            no_verify,
            no_reset,
        } => cmd_flash(cli, &config, firmware, *no_verify, *no_reset),
        Commands::Erase { yes } => cmd_erase(cli, &config, *yes),
        Commands::Watch { firmware, count } => cmd_watch(cli, &config, firmware, *count),
        Commands::Completions { shell, install } => {
            if *install {
                cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: wchflash completions bash \
                         (or use wchflash completions --install)"
                            .into(),
                    )
                })?;
                cmd_completions(shell);
                Ok(())
            }
        },
    }
}
