//! Host-stack boundary traits
//!
//! A class driver registers itself as the stack's (single) client, receives
//! hot-plug notifications through [`HostHooks`], opens interfaces as
//! [`DevicePort`]s and exchanges bulk data through asynchronous transfer
//! submissions. Completion closures run on the backend's own context: they
//! must not block and must not call back into driver entry points that could
//! wait on that same context.

use crate::error::HostResult;
use crate::types::{ConfigDescriptor, DeviceAddr, DeviceDescriptor, DeviceInfo};
use std::sync::Arc;

/// Completion callback for an IN transfer: the bytes received, or the error
/// that terminated the transfer.
pub type InComplete = Box<dyn FnOnce(HostResult<Vec<u8>>) + Send>;

/// Completion callback for an OUT transfer: the byte count written.
pub type OutComplete = Box<dyn FnOnce(HostResult<usize>) + Send>;

/// Hot-plug notifications, delivered from the host stack's own context.
///
/// Implementations must hand the event off (e.g. onto a queue) rather than
/// doing real work inline; the stack's event pump is stalled until the hook
/// returns.
pub trait HostHooks: Send + Sync {
    /// A device finished enumeration and is visible to `devices()`.
    fn device_attached(&self, info: DeviceInfo);

    /// The device at `addr` was detached; any open port on it is dead.
    fn device_detached(&self, addr: DeviceAddr);
}

/// Narrow view of the platform USB host stack used by class drivers.
pub trait HostBackend: Send + Sync {
    /// Register the driver as the stack's client. Hooks fire until
    /// [`HostBackend::deregister_client`]. At most one client may be
    /// registered; a second registration fails with
    /// [`HostError::Busy`](crate::HostError::Busy).
    fn register_client(&self, hooks: Arc<dyn HostHooks>) -> HostResult<()>;

    /// Drop the client registration and stop hook delivery.
    fn deregister_client(&self);

    /// Snapshot of devices currently known to the stack.
    fn devices(&self) -> HostResult<Vec<DeviceInfo>>;

    /// Open `interface` on the device at `addr` for bulk I/O.
    fn open(&self, addr: DeviceAddr, interface: u8) -> HostResult<Arc<dyn DevicePort>>;
}

/// An opened interface: one bulk IN / bulk OUT endpoint pair plus descriptor
/// access.
///
/// Submissions are asynchronous; the completion closure fires exactly once
/// unless the port is closed first, in which case pending submissions are
/// dropped.
pub trait DevicePort: Send + Sync + std::fmt::Debug {
    /// Identity of the device this port belongs to.
    fn info(&self) -> DeviceInfo;

    /// Submit an IN transfer for up to `max_len` bytes.
    fn submit_in(&self, max_len: usize, complete: InComplete) -> HostResult<()>;

    /// Submit an OUT transfer carrying `data`.
    fn submit_out(&self, data: Vec<u8>, complete: OutComplete) -> HostResult<()>;

    /// Standard device descriptor.
    fn device_descriptor(&self) -> HostResult<DeviceDescriptor>;

    /// Active configuration descriptor.
    fn config_descriptor(&self) -> HostResult<ConfigDescriptor>;

    /// Cancel outstanding transfers and release the interface. Idempotent.
    fn close(&self);
}
