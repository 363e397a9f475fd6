//! cdc-probe — poke at USB CDC devices from the command line
//!
//! Lists visible devices, opens one (first match or explicit VID/PID), dumps
//! its descriptors, optionally transmits a line and echoes whatever the
//! device sends back for a few seconds.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use usbh::{HostBackend, RusbBackend, setup_logging};
use usbh_cdc::{CdcDriver, DeviceConfig, DriverConfig};

#[derive(Parser, Debug)]
#[command(name = "cdc-probe")]
#[command(author, version, about = "Probe USB CDC devices: list, open, echo traffic")]
struct Args {
    /// List visible USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Vendor ID of the device to open (hex); requires --pid
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Product ID of the device to open (hex); requires --vid
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Interface number to claim
    #[arg(long, default_value_t = 0)]
    interface: u8,

    /// Line to transmit after opening
    #[arg(long)]
    send: Option<String>,

    /// Seconds to keep reading before exiting
    #[arg(long, default_value_t = 5)]
    watch: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn parse_hex_u16(s: &str) -> std::result::Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let backend = Arc::new(RusbBackend::new().context("USB host stack unavailable")?);

    if args.list_devices {
        for dev in backend.devices()? {
            println!(
                "{}  {:04x}:{:04x}  {}  {}",
                dev.addr,
                dev.vendor_id,
                dev.product_id,
                dev.product.as_deref().unwrap_or("-"),
                dev.manufacturer.as_deref().unwrap_or("-"),
            );
        }
        return Ok(());
    }

    let driver = CdcDriver::install(backend, DriverConfig::default())
        .context("failed to install CDC driver")?;
    let dev = driver
        .create(DeviceConfig {
            vid: args.vid,
            pid: args.pid,
            interface: args.interface,
            ..Default::default()
        })
        .context("failed to open a CDC device")?;

    driver.print_descriptors(dev)?;

    if let Some(line) = &args.send {
        let sent = driver.write(dev, line.as_bytes())?;
        println!("queued {} of {} bytes", sent, line.len());
    }

    let deadline = Instant::now() + Duration::from_secs(args.watch);
    let mut buf = [0u8; 512];
    while Instant::now() < deadline {
        let n = driver.read(dev, &mut buf)?;
        if n > 0 {
            println!("rx {} bytes: {}", n, String::from_utf8_lossy(&buf[..n]));
        } else {
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    driver.delete(dev)?;
    driver.uninstall().context("failed to uninstall CDC driver")?;
    Ok(())
}
