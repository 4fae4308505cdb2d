//! Identify, flash, erase and watch command implementations.

use anyhow::{Context, Result};
use console::style;
use dialoguer::Confirm;
use log::{debug, warn};
use std::path::Path;
use std::time::Duration;
use wchflash::{FileSource, FlashSession, SessionState};

use crate::config::Config;
use crate::connect::Bench;
use crate::{Cli, CliError, was_interrupted};

fn device_wait(cli: &Cli) -> Duration {
    Duration::from_secs(cli.wait)
}

/// Validate and select the firmware, reporting what was accepted.
fn load_firmware(cli: &Cli, session: &FlashSession, firmware: &Path) -> Result<()> {
    if !cli.quiet {
        eprintln!("{} Loading firmware: {}", style("📦").cyan(), firmware.display());
    }
    let validated = session
        .select_firmware(&FileSource::new(firmware))
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;

    if !cli.quiet {
        let image = &validated.image;
        eprintln!(
            "{} {} image, {} bytes to flash from the start of code flash, data from 0x{:08X}",
            style("✓").green(),
            image.format,
            image.payload().len(),
            image.base_address
        );
        for warning in &validated.warnings {
            eprintln!("{} {warning}", style("⚠").yellow());
        }
    }
    Ok(())
}

/// Identify command implementation.
pub(crate) fn cmd_identify(cli: &Cli, config: &Config) -> Result<()> {
    let bench = Bench::open(cli, config, config.session_config()?)?;
    let chip = bench.wait_ready(cli, Some(device_wait(cli)))?;

    if let Some(device) = bench.session.current_device() {
        eprintln!(
            "{} {} via {}",
            style("🔌").cyan(),
            device.display_name,
            device.transport_mode
        );
    }
    println!("{chip}");
    if !cli.quiet && chip.flash_size_bytes > 0 {
        eprintln!(
            "  {} {} KiB flash, encryption {}",
            style("ℹ").blue(),
            chip.flash_size_bytes / 1024,
            if chip.supports_encryption { "supported" } else { "not supported" }
        );
    }
    bench.close();
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, firmware: &Path, no_verify: bool, no_reset: bool) -> Result<()> {
    let mut session_config = config.session_config()?;
    if no_verify {
        session_config.verify_after_flash = false;
    }
    if no_reset {
        session_config.reset_after_flash = false;
    }

    let bench = Bench::open(cli, config, session_config)?;
    load_firmware(cli, &bench.session, firmware)?;

    let chip = bench.wait_ready(cli, Some(device_wait(cli)))?;
    if !cli.quiet {
        eprintln!("{} Connected: {chip}", style("✓").green());
    }

    bench.drive(cli, FlashSession::flash)?;
    if !cli.quiet {
        eprintln!("\n{} Flashing completed", style("🎉").green().bold());
    }
    bench.close();
    Ok(())
}

/// Erase command implementation.
pub(crate) fn cmd_erase(cli: &Cli, config: &Config, yes: bool) -> Result<()> {
    if !yes && !cli.non_interactive {
        let confirmed = Confirm::new()
            .with_prompt("Erase the entire code flash of the attached chip?")
            .default(false)
            .interact()
            .context("Could not read confirmation (use --yes in scripts)")?;
        if !confirmed {
            return Err(CliError::Cancelled("Erase cancelled".into()).into());
        }
    }

    let bench = Bench::open(cli, config, config.session_config()?)?;
    let chip = bench.wait_ready(cli, Some(device_wait(cli)))?;
    if !cli.quiet {
        eprintln!("{} Connected: {chip}", style("✓").green());
    }

    bench.drive(cli, FlashSession::erase)?;
    if !cli.quiet {
        eprintln!("{} Erase completed", style("✓").green().bold());
    }
    bench.close();
    Ok(())
}

/// Watch command implementation: flash every device that shows up.
pub(crate) fn cmd_watch(cli: &Cli, config: &Config, firmware: &Path, count: Option<u32>) -> Result<()> {
    let mut bench = Bench::open(cli, config, config.session_config()?)?;
    load_firmware(cli, &bench.session, firmware)?;

    if !cli.quiet {
        eprintln!(
            "{} Production mode: plug in devices to flash them (Ctrl-C to stop)",
            style("ℹ").blue()
        );
    }

    let mut flashed = 0u32;
    let mut failed = 0u32;
    let result = loop {
        if count.is_some_and(|n| flashed + failed >= n) {
            break Ok(());
        }

        let chip = match bench.wait_ready(cli, None) {
            Ok(chip) => chip,
            Err(e) if e.downcast_ref::<CliError>().is_some() => break Err(e),
            Err(e) => {
                failed += 1;
                warn!("{e:#}");
                eprintln!("{} {e:#}", style("✗").red());
                if let Err(e) = next_device(cli, &mut bench) {
                    break Err(e);
                }
                continue;
            },
        };

        let n = flashed + failed + 1;
        if !cli.quiet {
            eprintln!("{} Device #{n}: {chip}", style("🔌").cyan());
        }
        match bench.drive(cli, FlashSession::flash) {
            Ok(_) => {
                flashed += 1;
                eprintln!("{} Device #{n} done", style("✓").green().bold());
            },
            Err(e) if e.downcast_ref::<CliError>().is_some() => break Err(e),
            Err(e) => {
                failed += 1;
                eprintln!("{} Device #{n} failed: {e:#}", style("✗").red().bold());
            },
        }

        if let Err(e) = next_device(cli, &mut bench) {
            break Err(e);
        }
    };

    eprintln!(
        "\n{} {flashed} flashed, {failed} failed",
        style("Summary:").bold()
    );
    bench.close();
    match result {
        // Ctrl-C is how production mode ends
        Err(e) if was_interrupted() => {
            debug!("Watch stopped: {e:#}");
            Ok(())
        },
        other => other,
    }
}

/// Wait for the finished device to go away before taking the next one.
fn next_device(cli: &Cli, bench: &mut Bench) -> Result<()> {
    if bench.is_simulated() {
        return bench.replug_simulated();
    }
    if !cli.quiet {
        eprintln!("{} Remove the device to continue", style("⏏").dim());
    }
    bench.wait_state(None, |s| *s == SessionState::Disconnected)?;
    Ok(())
}
