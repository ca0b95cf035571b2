//! Flash command implementation.

use anyhow::{Context, Result};
use bootflash::protocol::retry::DEFAULT_MAX_RETRIES;
use bootflash::protocol::{MAX_ANNOUNCED_PAGES, total_pages};
use bootflash::transport::DEFAULT_TIMEOUT;
use bootflash::{
    DEFAULT_PAGE_SIZE, DeviceFilter, FirmwareImage, ProtocolVersion, RetryPolicy, RetryStats,
    Session, Transport, UsbEnumerator, UsbId, open_bootloader,
};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

/// Flash parameters after merging flags, environment and config files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlashSettings {
    pub(crate) version: ProtocolVersion,
    pub(crate) filter: DeviceFilter,
    pub(crate) policy: RetryPolicy,
    pub(crate) timeout: Duration,
}

impl FlashSettings {
    /// Resolve settings; `cli` already carries flag and environment values.
    pub(crate) fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let version = match (cli.protocol, config.flash.protocol.as_deref()) {
            (Some(protocol), _) => protocol.into(),
            (None, Some(name)) => ProtocolVersion::from_name(name).ok_or_else(|| {
                CliError::Config(format!(
                    "unknown protocol '{name}' in config (expected v1 or v2)"
                ))
            })?,
            (None, None) => ProtocolVersion::default(),
        };

        let mut filter = version.device_filter();
        let vid = cli.vid.or(config.device.vid);
        let pid = cli.pid.or(config.device.pid);
        if vid.is_some() || pid.is_some() {
            filter = filter.with_id(UsbId::new(
                vid.unwrap_or(filter.id.vid),
                pid.unwrap_or(filter.id.pid),
            ));
        }

        // 0 means unlimited for both limits
        let max_retries = cli
            .max_retries
            .or(config.flash.max_retries)
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let retry_timeout = cli
            .retry_timeout
            .or(config.flash.retry_timeout_secs)
            .unwrap_or(0);
        let policy = RetryPolicy::default()
            .with_max_retries((max_retries > 0).then_some(max_retries))
            .with_max_elapsed((retry_timeout > 0).then(|| Duration::from_secs(retry_timeout)));

        let timeout = match cli
            .timeout_ms
            .or(config.flash.timeout_ms)
        {
            Some(0) => {
                return Err(CliError::Config("transfer timeout must be greater than 0".into()).into());
            },
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_TIMEOUT,
        };

        Ok(Self {
            version,
            filter,
            policy,
            timeout,
        })
    }
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted by user".into()).into())
    } else {
        Ok(())
    }
}

fn progress_bar(quiet: bool, pages: u64) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(pages);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages")
    {
        Ok(bar_style) => pb.set_style(bar_style.progress_chars("#>-")),
        Err(e) => debug!("Invalid progress template: {e}"),
    }
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

fn describe_stats(stats: &RetryStats) -> String {
    match stats.max_retry_page {
        Some(page) => format!(
            "Retries: {} total, at most {} on page {page}",
            stats.total_retries, stats.max_retries_seen
        ),
        None => "Retries: none".to_string(),
    }
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config) -> Result<()> {
    let settings = FlashSettings::resolve(cli, config)?;
    let firmware = &cli.firmware;
    debug!("Flash settings: {settings:?}");

    let mut image = FirmwareImage::open(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let pages = total_pages(image.size(), DEFAULT_PAGE_SIZE);
    if pages > MAX_ANNOUNCED_PAGES {
        return Err(bootflash::Error::ImageTooLarge {
            pages,
            max: MAX_ANNOUNCED_PAGES,
        })
        .with_context(|| format!("Firmware {} does not fit", firmware.display()));
    }

    if !cli.quiet {
        eprintln!(
            "{} Firmware: {} ({} bytes, {pages} pages of {DEFAULT_PAGE_SIZE} bytes)",
            style("📦").cyan(),
            firmware.display(),
            image.size()
        );
    }

    ensure_not_interrupted()?;

    let enumerator = UsbEnumerator::new().context("Failed to initialise USB")?;
    let mut transport = open_bootloader(&enumerator, &settings.filter)
        .with_context(|| format!("Failed to open bootloader {}", settings.filter.id))?;
    transport.set_timeout(settings.timeout)?;
    if !cli.quiet {
        eprintln!(
            "{} Using {} (protocol {})",
            style("🔌").cyan(),
            transport.name(),
            settings.version
        );
    }

    let mut session = Session::new(transport, settings.version).with_retry_policy(settings.policy);

    let identity = session
        .hello()
        .context("Handshake failed")?;
    if !cli.quiet {
        eprintln!("{} Bootloader: {identity}", style("✓").green());
    }

    session.init_update(pages)?;

    let pb = progress_bar(cli.quiet, pages);
    let result = session.write_pages(&mut image, |done, _| pb.set_position(u64::from(done)));
    if let Err(e) = result {
        pb.abandon();
        return Err(e).with_context(|| format!("Transfer failed at page {}", session.current_page()));
    }
    pb.finish_and_clear();

    session.finalize()?;
    session.bye()?;

    let summary = session.summary(image.size())?;

    if !cli.quiet {
        eprintln!("{} {}", style("ℹ").blue(), describe_stats(&summary.stats));
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    if !cli.quiet {
        eprintln!("\n{} All done", style("🎉").green().bold());
    }

    Ok(())
}
