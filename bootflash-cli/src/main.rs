//! bootflash CLI - Command-line tool for flashing firmware through minimal
//! USB bootloaders.
//!
//! ## Features
//!
//! - Flash raw binary images page by page with read-back verification
//! - Protocol v1 (legacy) and v2 bootloaders
//! - Bounded retries on unreliable links
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Parser, ValueEnum};
use console::style;
use env_logger::Env;
use log::{debug, warn};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use bootflash::ProtocolVersion;
use config::Config;

/// Exit status for any failure.
const EXIT_FAILURE: i32 = 1;

/// Exit status after Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures that originate in the CLI itself.
#[derive(Debug, thiserror::Error)]
enum CliError {
    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Operation cancelled by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// bootflash - Flash firmware through a USB control-transfer bootloader.
///
/// Environment variables:
///   BOOTFLASH_PROTOCOL       - Protocol version (v1, v2)
///   BOOTFLASH_MAX_RETRIES    - Resends allowed per page (0 = unlimited)
///   BOOTFLASH_RETRY_TIMEOUT  - Seconds a page may keep failing (0 = unlimited)
///   BOOTFLASH_TIMEOUT_MS     - Timeout of each USB transfer
///   BOOTFLASH_VID            - Bootloader USB vendor ID (hex)
///   BOOTFLASH_PID            - Bootloader USB product ID (hex)
#[derive(Parser)]
#[command(name = "bootflash")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raw firmware image to flash.
    #[arg(value_name = "FIRMWARE")]
    firmware: PathBuf,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// Bootloader protocol version.
    #[arg(long, value_enum, env = "BOOTFLASH_PROTOCOL")]
    protocol: Option<Protocol>,

    /// Resends allowed for a single page (0 = unlimited, default 32).
    #[arg(long, value_name = "N", env = "BOOTFLASH_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Seconds a single page may keep failing verification (0 = unlimited).
    #[arg(long, value_name = "SECS", env = "BOOTFLASH_RETRY_TIMEOUT")]
    retry_timeout: Option<u64>,

    /// Timeout of each USB control transfer in milliseconds (default 1000).
    #[arg(
        long,
        value_name = "MS",
        env = "BOOTFLASH_TIMEOUT_MS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    timeout_ms: Option<u64>,

    /// Bootloader USB vendor ID in hex (e.g. 1209).
    #[arg(long, value_parser = parse_hex_u16, env = "BOOTFLASH_VID")]
    vid: Option<u16>,

    /// Bootloader USB product ID in hex (e.g. deaf).
    #[arg(long, value_parser = parse_hex_u16, env = "BOOTFLASH_PID")]
    pid: Option<u16>,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Print the update summary as JSON on stdout.
    #[arg(long)]
    json: bool,
}

/// Supported protocol versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Protocol {
    /// Legacy bootloader (1209:b00b, no finalize).
    #[value(aliases = ["1", "legacy"])]
    V1,
    /// Current bootloader (1209:deaf).
    #[value(alias = "2")]
    V2,
}

impl From<Protocol> for ProtocolVersion {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::V1 => Self::V1,
            Protocol::V2 => Self::V2,
        }
    }
}

/// Parse a hexadecimal USB identifier (0x prefix optional).
fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let s = s.trim();
    let s = s
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u16::from_str_radix(s, 16).map_err(|e| format!("Invalid hex id: {e}"))
}

/// Map an error to the process exit status.
fn exit_code(err: &anyhow::Error) -> i32 {
    let interrupted = err
        .chain()
        .any(|cause| {
            matches!(
                cause.downcast_ref::<CliError>(),
                Some(CliError::Cancelled(_))
            ) || matches!(
                cause.downcast_ref::<bootflash::Error>(),
                Some(bootflash::Error::Interrupted)
            )
        });
    if interrupted {
        EXIT_INTERRUPTED
    } else {
        EXIT_FAILURE
    }
}

/// What the user can do about an error, if anything.
fn remediation(err: &anyhow::Error) -> Option<&'static str> {
    let lib_err = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<bootflash::Error>())?;

    match lib_err {
        bootflash::Error::DeviceNotFound => Some(
            "Unplug the device, hold the bootloader button while plugging it back in, then retry.",
        ),
        bootflash::Error::NotInBootloaderMode { .. } => Some(
            "The device is running its application. Replug it with the bootloader button held.",
        ),
        bootflash::Error::HandshakeFailed(_) => Some(
            "Check --protocol, or replug the device to reset the bootloader to idle.",
        ),
        bootflash::Error::LinkUnreliable { .. } => Some(
            "Try another cable or USB port, or raise --max-retries.",
        ),
        e if e.is_transport() => Some("The USB link failed. Replug the device and retry."),
        _ => None,
    }
}

fn init_logging(cli: &Cli) {
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
}

fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        // A second Ctrl-C does not wait for the current transfer
        if INTERRUPTED.swap(true, Ordering::Relaxed) {
            std::process::exit(EXIT_INTERRUPTED);
        }
    });
    if let Err(e) = result {
        warn!("Failed to install Ctrl-C handler: {e}");
        return;
    }
    bootflash::set_interrupt_checker(was_interrupted);
}

fn run(cli: &Cli) -> Result<()> {
    debug!(
        "bootflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    commands::flash::cmd_flash(cli, &config)
}

fn main() {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        eprintln!("{} {err:#}", style("Error:").red().bold());
        if let Some(hint) = remediation(&err) {
            eprintln!("  {} {hint}", style("hint:").yellow());
        }
        std::process::exit(exit_code(&err));
    }
}
