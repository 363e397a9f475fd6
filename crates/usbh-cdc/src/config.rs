//! Driver and device configuration

use crate::error::{CdcError, Result};
use crate::registry::CdcHandle;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use usbh::DeviceInfo;

/// Ring buffer capacity used when a size of 0 is configured.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Fired from the driver task when a new device finishes enumeration, before
/// any device record for it exists. Useful for peeking VID/PID and deciding
/// what to `create`.
///
/// The device cannot be created from inside this callback; hand the identity
/// off to another task instead.
pub type NewDeviceCallback = Arc<dyn Fn(&DeviceInfo) + Send + Sync>;

/// Per-device event callback. Runs on the driver task or the host stack's
/// context, never on an application task; it must not block and must not
/// call back into `create`/`delete`/`uninstall`.
pub type DeviceCallback = Arc<dyn Fn(CdcHandle) + Send + Sync>;

/// Driver-wide configuration, passed to [`CdcDriver::install`](crate::CdcDriver::install).
#[derive(Clone)]
pub struct DriverConfig {
    /// Stack size of the driver task; `None` uses the platform default.
    pub task_stack_size: Option<usize>,
    /// Guard period `uninstall` waits for the driver task to stop.
    pub stop_timeout: Duration,
    /// Upper bound on simultaneously created devices.
    pub max_devices: usize,
    /// Callback for newly enumerated devices.
    pub new_device_cb: Option<NewDeviceCallback>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            task_stack_size: None,
            stop_timeout: Duration::from_secs(5),
            max_devices: 8,
            new_device_cb: None,
        }
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("task_stack_size", &self.task_stack_size)
            .field("stop_timeout", &self.stop_timeout)
            .field("max_devices", &self.max_devices)
            .field("new_device_cb", &self.new_device_cb.is_some())
            .finish()
    }
}

/// Event callbacks registered per device.
#[derive(Clone, Default)]
pub struct EventCallbacks {
    /// Device opened (after `create`, and again after a matching re-attach).
    pub connect: Option<DeviceCallback>,
    /// Device went away; the record stays until `delete`.
    pub disconnect: Option<DeviceCallback>,
    /// Bytes were appended to the RX buffer.
    pub recv_data: Option<DeviceCallback>,
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("connect", &self.connect.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .field("recv_data", &self.recv_data.is_some())
            .finish()
    }
}

/// Per-device configuration for [`CdcDriver::create`](crate::CdcDriver::create).
///
/// `vid`/`pid` must be configured together; leaving both `None` opens the
/// first enumerated device regardless of identity.
#[derive(Clone, Default)]
pub struct DeviceConfig {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// Interface number to claim on the matched device.
    pub interface: u8,
    /// RX ring capacity in bytes; 0 selects [`DEFAULT_BUFFER_SIZE`].
    pub rx_buffer_size: usize,
    /// TX ring capacity in bytes; 0 selects [`DEFAULT_BUFFER_SIZE`].
    pub tx_buffer_size: usize,
    pub callbacks: EventCallbacks,
}

impl DeviceConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.vid.is_some() != self.pid.is_some() {
            return Err(CdcError::InvalidArg("vid and pid must be configured together"));
        }
        Ok(())
    }

    pub(crate) fn rx_capacity(&self) -> usize {
        if self.rx_buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.rx_buffer_size
        }
    }

    pub(crate) fn tx_capacity(&self) -> usize {
        if self.tx_buffer_size == 0 {
            DEFAULT_BUFFER_SIZE
        } else {
            self.tx_buffer_size
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("vid", &self.vid)
            .field("pid", &self.pid)
            .field("interface", &self.interface)
            .field("rx_buffer_size", &self.rx_buffer_size)
            .field("tx_buffer_size", &self.tx_buffer_size)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
