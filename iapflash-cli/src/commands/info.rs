//! Info and list-ports command implementations.

use anyhow::{Context, Result};
use console::style;
use iapflash::{FW_META_OFFSET, FirmwareImage, TransferHeader};
use std::path::Path;

use crate::commands::flash::{FlashOptions, session_config};
use crate::config::Config;
use crate::serial::{discover_ports, port_label};

/// Format a byte count as `N bytes (M kB)`.
pub(crate) fn format_size(bytes: u64) -> String {
    format!("{bytes} bytes ({} kB)", bytes / 1024)
}

/// Info command implementation.
pub(crate) fn cmd_info(config: &Config, firmware: &Path, json: bool) -> Result<()> {
    // Plan with the same chunk size `flash` would use.
    let chunk_size = session_config(&FlashOptions::default(), config)?.max_chunk_size;

    let mut image = FirmwareImage::open(firmware)
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    let total = image.total_length();
    let metadata = image.read_metadata().ok();

    let header = TransferHeader::for_image(total, chunk_size)
        .with_context(|| format!("Cannot plan a transfer of {}", firmware.display()))?;
    let packets = header.packet_count(chunk_size);

    if json {
        let info = serde_json::json!({
            "path": firmware.display().to_string(),
            "size": total,
            "version": metadata.map(|m| m.version()),
            "metadata": metadata,
            "chunk_size": chunk_size,
            "header": header,
            "packets": packets,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware").bold().underlined());
    eprintln!("  File:     {}", firmware.display());
    eprintln!("  Size:     {}", format_size(total));
    match metadata {
        Some(meta) => eprintln!("  Version:  {}", style(meta).cyan().bold()),
        None => eprintln!(
            "  Version:  {}",
            style(format!("n/a (no record at 0x{FW_META_OFFSET:04X})")).dim()
        ),
    }

    eprintln!("\n{}", style("Transfer").bold().underlined());
    eprintln!("  Chunk size:   {chunk_size} bytes");
    eprintln!("  Header size:  {} bytes", header.total_size);
    eprintln!("  Header count: {} chunks", header.chunk_count);
    eprintln!("  Packets:      {packets}");

    Ok(())
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = discover_ports();

    if json {
        let ports: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
    } else {
        for port in &ports {
            eprintln!("  {} {}", style("•").green(), port_label(port));
        }
    }

    Ok(())
}
