//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use iapflash::{
    Error as IapError, FirmwareImage, IapFlasher, MAX_PACKET_SIZE, NativePort, ProgressSink,
    SessionConfig, UnknownBytePolicy,
};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::path::Path;
use std::time::Duration;

use crate::commands::info::format_size;
use crate::config::Config;
use crate::{Cli, CliError, get_port, serial_config, use_fancy_output, was_interrupted};

/// Transfer options given on the command line.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlashOptions {
    pub chunk_size: Option<usize>,
    pub header_timeout_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub lenient: bool,
}

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Build the session configuration: CLI first, then config file, then
/// protocol defaults.
pub(crate) fn session_config(options: &FlashOptions, config: &Config) -> Result<SessionConfig> {
    let transfer = &config.transfer;
    let chunk_size = options
        .chunk_size
        .or(transfer.chunk_size)
        .unwrap_or(MAX_PACKET_SIZE);
    let mut session = SessionConfig::default().with_max_chunk_size(chunk_size);

    // 0 ms waits forever.
    let deadline = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
    if let Some(ms) = options.header_timeout_ms.or(transfer.header_timeout_ms) {
        session = session.with_header_timeout(deadline(ms));
    }
    if let Some(ms) = options.timeout_ms.or(transfer.ack_timeout_ms) {
        session = session.with_ack_timeout(deadline(ms));
    }
    if options.lenient || transfer.lenient {
        session = session.with_unknown_byte_policy(UnknownBytePolicy::Ignore);
    }

    session
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    Ok(session)
}

/// Progress bar driven by transfer notifications.
struct BarSink {
    pb: ProgressBar,
}

impl ProgressSink for BarSink {
    fn on_progress(&mut self, bytes_sent: u64, total: u64) {
        self.pb.set_length(total);
        self.pb.set_position(bytes_sent);
    }

    fn on_completed(&mut self) {
        self.pb.finish_with_message("done");
    }

    fn on_failed(&mut self, error: &IapError) {
        self.pb.abandon_with_message(format!("failed: {error}"));
    }
}

fn progress_bar(cli: &Cli, total: u64) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }

    let pb = ProgressBar::new(total);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
            )
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    options: &FlashOptions,
) -> Result<()> {
    let session = session_config(options, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }

    let mut image = FirmwareImage::open(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let total = image.total_length();

    match image.read_metadata() {
        Ok(meta) => {
            if !cli.quiet {
                eprintln!(
                    "{} Version {}, {}",
                    style("ℹ").blue(),
                    style(meta).bold(),
                    format_size(total)
                );
            }
        },
        Err(e) => warn!("No version record in {}: {e}", firmware.display()),
    }

    let port_name = get_port(cli, config)?;
    let serial = serial_config(cli, config, &port_name)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            style(&port_name).green(),
            serial.baud_rate
        );
    }

    let port = NativePort::open(&serial)
        .with_context(|| format!("Failed to open serial port {port_name}"))?;
    ensure_not_interrupted()?;

    let pb = progress_bar(cli, total);
    let mut flasher = IapFlasher::with_config(port, session);
    let result = flasher.flash(image, BarSink { pb: pb.clone() });

    if !pb.is_finished() {
        pb.abandon();
    }

    let report = match result {
        Ok(report) => report,
        Err(IapError::Cancelled) => {
            return Err(CliError::Cancelled("Transfer cancelled".to_string()).into());
        },
        Err(e) => return Err(e).context("Firmware update failed"),
    };

    if !cli.quiet {
        eprintln!(
            "\n{} Firmware update completed: {} in {} packets ({:.1}s)",
            style("🎉").green().bold(),
            format_size(report.total_size),
            report.packets_sent,
            report.elapsed.as_secs_f64()
        );
    }

    Ok(())
}
