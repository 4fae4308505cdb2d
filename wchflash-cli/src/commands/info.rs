//! Device listing, chip table and firmware info command implementations.

use {
    crate::{Cli, config::Config, connect::SIMULATED_DEVICE},
    anyhow::{Context, Result},
    console::style,
    log::warn,
    std::path::Path,
    wchflash::{
        DeviceDescriptor, FileSource, Validated, enumerate_devices, device::format_device_list, select,
        target::chips,
    },
};

fn kib(bytes: u32) -> String {
    if bytes % 1024 == 0 {
        format!("{} KiB", bytes / 1024)
    } else {
        format!("{bytes} bytes")
    }
}

/// List devices command implementation.
pub(crate) fn cmd_devices(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let allow = config.allow_list()?;
    let mut devices = match enumerate_devices(&allow) {
        Ok(devices) => devices,
        // the simulated device is still worth listing
        Err(e) if cli.simulate => {
            warn!("Failed to enumerate host devices: {e}");
            Vec::new()
        },
        Err(e) => return Err(e).context("Failed to enumerate devices"),
    };
    if cli.simulate {
        devices.insert(
            0,
            DeviceDescriptor::new(
                SIMULATED_DEVICE.0,
                SIMULATED_DEVICE.1,
                "Simulated USB-ISP bootloader",
                "sim:0",
            ),
        );
    }

    if json {
        let list: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                let entry = allow.lookup(d.vendor_id, d.product_id);
                serde_json::json!({
                    "vid": d.vendor_id,
                    "pid": d.product_id,
                    "name": d.name,
                    "locator": d.locator,
                    "transport": entry.map(|e| e.transport.name()),
                    "label": entry.map(|e| e.label.as_str()),
                })
            })
            .collect();
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "devices": list,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Supported devices").bold().underlined());
    if devices.is_empty() {
        eprintln!("  {}", style("No supported device attached").dim());
    } else {
        for line in format_device_list(&devices, &allow) {
            eprintln!("  {} {}", style("•").green(), style(line).cyan());
        }
    }
    Ok(())
}

/// Chip table command implementation.
pub(crate) fn cmd_chips(json: bool) -> Result<()> {
    if json {
        let list: Vec<serde_json::Value> = chips()
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "chip_id": c.chip_id,
                    "device_type": c.device_type,
                    "flash_size": c.flash_size,
                    "encryption": c.supports_encryption,
                })
            })
            .collect();
        let output = serde_json::json!({ "ok": true, "data": { "chips": list } });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    eprintln!("{}", style("Known chips").bold().underlined());
    eprintln!(
        "  {:<14} {:>8} {:>10}  {}",
        style("Name").bold(),
        style("ID").bold(),
        style("Flash").bold(),
        style("Encrypted").bold()
    );
    for c in chips() {
        eprintln!(
            "  {:<14} {:>8} {:>10}  {}",
            c.name,
            format!("0x{:02x}{:02x}", c.chip_id, c.device_type),
            kib(c.flash_size),
            if c.supports_encryption { "yes" } else { "no" }
        );
    }
    Ok(())
}

/// Firmware info command implementation.
pub(crate) fn cmd_info(firmware: &Path, json: bool) -> Result<()> {
    let validated = select(&FileSource::new(firmware))
        .with_context(|| format!("Failed to validate {}", firmware.display()))?;

    if json {
        return print_info_json(&validated);
    }

    let image = &validated.image;
    eprintln!("{}", style("Firmware Information").bold().underlined());
    eprintln!("  {} {}", style("File:").dim(), image.source_name);
    eprintln!("  {} {}", style("Format:").dim(), image.format);
    eprintln!("  {} {} bytes", style("Source size:").dim(), image.size_bytes);
    eprintln!("  {} {} bytes", style("Payload size:").dim(), image.payload().len());
    eprintln!("  {} 0x{:08X}", style("Load address:").dim(), image.base_address);

    let fits: Vec<&str> = chips()
        .iter()
        .filter(|c| image.payload().len() <= c.flash_size as usize)
        .map(|c| c.name)
        .collect();
    eprintln!("  {} {} of {} known chips", style("Fits:").dim(), fits.len(), chips().len());

    for warning in &validated.warnings {
        eprintln!("  {} {warning}", style("⚠").yellow());
    }
    Ok(())
}

fn print_info_json(validated: &Validated) -> Result<()> {
    let image = &validated.image;
    let warnings: Vec<String> = validated.warnings.iter().map(ToString::to_string).collect();
    let output = serde_json::json!({
        "ok": true,
        "data": {
            "file": image.source_name,
            "format": image.format.name(),
            "size": image.size_bytes,
            "payload_size": image.payload().len(),
            "base_address": image.base_address,
            "large": validated.is_large(),
            "warnings": warnings,
        }
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kib() {
        assert_eq!(kib(64 * 1024), "64 KiB");
        assert_eq!(kib(1000), "1000 bytes");
    }

    #[test]
    fn test_cmd_info_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, [0u8; 64]).unwrap();
        let err = cmd_info(&path, false).unwrap_err();
        assert!(format!("{err:#}").contains("txt"));
    }
}
