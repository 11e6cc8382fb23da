//! Upload command implementation.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use nexflash::protocol::MAX_PACKET_SIZE;
use nexflash::{NativePort, Port as _, SerialConfig, SessionState, UploadConfig, UploadTask};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

/// Human-readable description of the prepare phase for the spinner.
fn describe(state: &SessionState) -> &'static str {
    use nexflash::{PrepareState, UpgradeState};

    match (state.prepare, state.upgrade) {
        (PrepareState::InProgress, UpgradeState::HandshakeSent) => {
            "negotiating with the display (this takes a while)..."
        },
        (PrepareState::Done, UpgradeState::Ready) => "display ready",
        (PrepareState::Error, _) | (_, UpgradeState::Error) => "negotiation failed",
        _ => "starting...",
    }
}

/// Upload command implementation.
pub(crate) fn cmd_upload(cli: &Cli, config: &mut Config, firmware: &PathBuf) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Loading firmware image {}",
            style("📦").cyan(),
            style(firmware.display()).bold()
        );
    }

    let data = std::fs::read(firmware)
        .with_context(|| format!("Failed to read firmware image {}", firmware.display()))?;
    if data.is_empty() {
        return Err(CliError::Usage(format!(
            "firmware image {} is empty",
            firmware.display()
        ))
        .into());
    }
    if !cli.quiet {
        eprintln!(
            "{} Image size: {} bytes ({} packets)",
            style("ℹ").blue(),
            data.len(),
            data.len().div_ceil(MAX_PACKET_SIZE)
        );
    }

    // Get port
    let port_name = get_port(cli, config)?;
    if !cli.quiet {
        eprintln!(
            "{} Using port {} (transfer speed {} bps)",
            style("🔌").cyan(),
            style(&port_name).green(),
            cli.baud
        );
    }

    // The prepare sequence negotiates the rate itself; open at the
    // factory default.
    let serial = SerialConfig::new(port_name.as_str(), nexflash::protocol::DEFAULT_BAUD);
    let port = NativePort::open(&serial)
        .with_context(|| format!("Failed to open serial port {port_name}"))?;

    let upload_config = UploadConfig::default().with_upload_baud(cli.baud);
    let expected = data.len() as u64;
    let task = UploadTask::start(port, upload_config, expected);

    // Negotiation spinner
    let spinner = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    while !task.is_finished() {
        if was_interrupted() {
            task.cancel();
        }
        spinner.set_message(describe(&task.status()));
        std::thread::sleep(Duration::from_millis(120));
    }
    spinner.finish_and_clear();

    let mut uploader = task
        .join()
        .context("Display did not become ready for upload")?;
    if !cli.quiet {
        eprintln!(
            "{} Display ready at {} bps",
            style("✓").green(),
            uploader.port().baud_rate()
        );
    }

    // Transfer progress bar
    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(expected);
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
    };

    for (index, packet) in data.chunks(MAX_PACKET_SIZE).enumerate() {
        if was_interrupted() {
            pb.abandon_with_message("interrupted");
            return Err(CliError::Cancelled("Upload interrupted".to_string()).into());
        }
        uploader
            .send_packet(packet)
            .with_context(|| format!("Packet {} (offset {}) failed", index + 1, index * MAX_PACKET_SIZE))?;
        pb.inc(packet.len() as u64);
    }

    uploader.finish()?;
    pb.finish_with_message("done");

    let final_baud = uploader.port().baud_rate();
    let mut port = uploader.into_port();
    port.close().ok();

    if !cli.quiet {
        eprintln!(
            "\n{} Upload complete: {} bytes at {} bps. The display is rebooting into the new firmware.",
            style("🎉").green().bold(),
            data.len(),
            final_baud
        );
    }

    Ok(())
}
