//! USB host CDC driver
//!
//! Presents each attached USB CDC function (modems, serial bridges) as a
//! byte-stream endpoint with buffered, non-blocking read/write. A single
//! background task multiplexes transfer completions from the host stack into
//! per-device ring buffers while application tasks produce and consume bytes
//! through opaque handles.
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbh::RusbBackend;
//! use usbh_cdc::{CdcDriver, DeviceConfig, DriverConfig};
//!
//! # fn main() -> usbh_cdc::Result<()> {
//! let backend = Arc::new(RusbBackend::new()?);
//! let driver = CdcDriver::install(backend, DriverConfig::default())?;
//!
//! // Open the first CDC device the host knows about
//! let dev = driver.create(DeviceConfig::default())?;
//! driver.write(dev, b"AT\r\n")?;
//!
//! let mut buf = [0u8; 256];
//! let n = driver.read(dev, &mut buf)?;
//! println!("received {} bytes", n);
//!
//! driver.delete(dev)?;
//! driver.uninstall()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod descriptors;
pub mod device;
pub mod driver;
pub mod error;
mod registry;
mod ring_buffer;
mod transfers;

pub use config::{
    DEFAULT_BUFFER_SIZE, DeviceCallback, DeviceConfig, DriverConfig, EventCallbacks,
    NewDeviceCallback,
};
pub use device::DeviceState;
pub use driver::CdcDriver;
pub use error::{CdcError, Result};
pub use registry::CdcHandle;
