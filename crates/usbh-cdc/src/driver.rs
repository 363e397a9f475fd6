//! Driver lifecycle, task and public API
//!
//! One background task owns the driver's host-stack client registration and
//! serializes hot-plug handling and transfer arming; everything else reaches
//! it through a bounded event queue. Application-facing operations are
//! non-blocking, with the single exception of `uninstall`, which waits
//! (bounded by the configured guard period) for the task to acknowledge
//! shutdown.

use crate::config::{DeviceConfig, DriverConfig, NewDeviceCallback};
use crate::descriptors;
use crate::device::{DeviceRecord, DeviceState};
use crate::error::{CdcError, Result};
use crate::registry::{CdcHandle, Registry};
use crate::transfers::{arm_rx, arm_tx};
use async_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use usbh::{DeviceAddr, DeviceInfo, HostBackend, HostError, HostHooks};

/// Depth of the driver event queue.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Work items for the driver task.
#[derive(Debug)]
pub(crate) enum DriverEvent {
    /// Host stack finished enumerating a device.
    Attached(DeviceInfo),
    /// The device at this address disappeared.
    Detached(DeviceAddr),
    /// A record was created and opened; finish setup on the task.
    Opened(CdcHandle),
    /// Bytes were queued in a TX ring.
    TxReady(CdcHandle),
    /// A previously full RX ring drained; resume the IN chain.
    RxResume(CdcHandle),
    /// Uninstall requested.
    Stop,
}

/// State shared between the public surface and the driver task.
struct DriverShared {
    backend: Arc<dyn HostBackend>,
    /// Guards all structural registry changes and the install/uninstall gate.
    registry: Mutex<Registry>,
    events: Sender<DriverEvent>,
    installed: AtomicBool,
}

/// Forwards hot-plug hooks from the host stack's context onto the event
/// queue. `try_send` so a wedged driver task can never stall the stack's
/// event pump.
struct HookBridge {
    events: Sender<DriverEvent>,
}

impl HostHooks for HookBridge {
    fn device_attached(&self, info: DeviceInfo) {
        if self.events.try_send(DriverEvent::Attached(info)).is_err() {
            warn!("driver event queue full; dropping attach notification");
        }
    }

    fn device_detached(&self, addr: DeviceAddr) {
        if self.events.try_send(DriverEvent::Detached(addr)).is_err() {
            warn!("driver event queue full; dropping detach notification");
        }
    }
}

/// USB host CDC driver.
///
/// Install once per host stack, create one device per CDC function, then
/// exchange bytes through the buffered, non-blocking `read`/`write` pair.
/// The driver is `Send + Sync`; share it across tasks behind an `Arc`.
pub struct CdcDriver {
    shared: Arc<DriverShared>,
    task: Mutex<Option<thread::JoinHandle<()>>>,
    stopped: Mutex<Option<mpsc::Receiver<()>>>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for CdcDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdcDriver")
            .field("stop_timeout", &self.stop_timeout)
            .finish_non_exhaustive()
    }
}

impl CdcDriver {
    /// Install the driver: register as the host stack's client and start the
    /// driver task.
    pub fn install(backend: Arc<dyn HostBackend>, config: DriverConfig) -> Result<Self> {
        let (event_tx, event_rx) = async_channel::bounded(EVENT_QUEUE_DEPTH);
        let shared = Arc::new(DriverShared {
            backend,
            registry: Mutex::new(Registry::new(config.max_devices)),
            events: event_tx.clone(),
            installed: AtomicBool::new(true),
        });

        shared
            .backend
            .register_client(Arc::new(HookBridge { events: event_tx }))?;

        let (stopped_tx, stopped_rx) = mpsc::sync_channel(1);
        let task = DriverTask {
            shared: shared.clone(),
            events: event_rx,
            new_device_cb: config.new_device_cb.clone(),
            stopped: stopped_tx,
        };
        let mut builder = thread::Builder::new().name("usbh-cdc".to_string());
        if let Some(size) = config.task_stack_size {
            builder = builder.stack_size(size);
        }
        let handle = match builder.spawn(move || task.run()) {
            Ok(handle) => handle,
            Err(e) => {
                shared.backend.deregister_client();
                return Err(CdcError::Host(HostError::Other(format!(
                    "failed to spawn driver task: {}",
                    e
                ))));
            }
        };

        info!("USB CDC driver installed");
        Ok(Self {
            shared,
            task: Mutex::new(Some(handle)),
            stopped: Mutex::new(Some(stopped_rx)),
            stop_timeout: config.stop_timeout,
        })
    }

    /// Tear the driver down. Every created device must have been deleted
    /// first. Blocks until the driver task acknowledges, bounded by the
    /// configured guard period; a timeout returns
    /// [`CdcError::NotFinished`] and the call may be retried.
    pub fn uninstall(&self) -> Result<()> {
        let send_stop = {
            let registry = self.shared.registry.lock().unwrap();
            if self.shared.installed.load(Ordering::Acquire) {
                if registry.live() != 0 {
                    return Err(CdcError::InvalidState(
                        "devices still installed; delete them first",
                    ));
                }
                self.shared.installed.store(false, Ordering::Release);
                true
            } else {
                if self.task.lock().unwrap().is_none() {
                    return Err(CdcError::InvalidState("driver is not installed"));
                }
                // An earlier uninstall timed out; just wait again
                false
            }
        };
        if send_stop {
            let _ = self.shared.events.send_blocking(DriverEvent::Stop);
        }

        {
            let stopped = self.stopped.lock().unwrap();
            if let Some(rx) = stopped.as_ref() {
                if rx.recv_timeout(self.stop_timeout).is_err() {
                    warn!("driver task did not stop within {:?}", self.stop_timeout);
                    return Err(CdcError::NotFinished);
                }
            }
        }
        self.stopped.lock().unwrap().take();

        if let Some(task) = self.task.lock().unwrap().take() {
            if task.join().is_err() {
                warn!("driver task panicked");
            }
        }
        info!("USB CDC driver uninstalled");
        Ok(())
    }

    /// Create a CDC device: find a device matching the config among those
    /// currently known to the host stack, open its interface and size the
    /// ring buffers. Fails terminally if nothing matches; retry after a
    /// new-device notification if desired.
    pub fn create(&self, config: DeviceConfig) -> Result<CdcHandle> {
        config.validate()?;

        let mut registry = self.shared.registry.lock().unwrap();
        if !self.shared.installed.load(Ordering::Acquire) {
            return Err(CdcError::InvalidState("driver is not installed"));
        }
        if registry.is_full() {
            return Err(CdcError::NoMem("device limit reached"));
        }

        let devices = self.shared.backend.devices()?;
        let target = match (config.vid, config.pid) {
            (Some(vid), Some(pid)) => devices
                .into_iter()
                .find(|d| d.vendor_id == vid && d.product_id == pid),
            // No identity filter: open whatever enumerated first
            _ => devices.into_iter().next(),
        }
        .ok_or(HostError::NotFound)?;

        let port = self.shared.backend.open(target.addr, config.interface)?;
        let record = registry.insert(|handle| {
            Arc::new(DeviceRecord::new(handle, &config, self.shared.events.clone()))
        })?;
        record.bind(port, target);
        let handle = record.handle;
        drop(registry);

        // Connect callback and RX arming happen on the driver task
        let _ = self.shared.events.send_blocking(DriverEvent::Opened(handle));
        info!("created CDC device {:?}", handle);
        Ok(handle)
    }

    /// Delete a device, freeing its buffers and closing the underlying
    /// interface. The handle goes stale.
    pub fn delete(&self, handle: CdcHandle) -> Result<()> {
        let record = {
            let mut registry = self.shared.registry.lock().unwrap();
            if !self.shared.installed.load(Ordering::Acquire) {
                return Err(CdcError::InvalidState("driver is not installed"));
            }
            registry.remove(handle)?
        };
        record.shutdown();
        info!("deleted CDC device {:?}", handle);
        Ok(())
    }

    /// Enqueue bytes for transmission. Non-blocking and best-effort: returns
    /// the number of bytes accepted, which may be less than `data.len()`
    /// when the TX ring lacks space.
    pub fn write(&self, handle: CdcHandle, data: &[u8]) -> Result<usize> {
        self.record(handle)?.write_into_tx(data)
    }

    /// Dequeue received bytes into `out`. Non-blocking: returns the number
    /// of bytes copied, 0 when nothing is buffered. Data buffered before a
    /// disconnect remains readable.
    pub fn read(&self, handle: CdcHandle, out: &mut [u8]) -> Result<usize> {
        Ok(self.record(handle)?.read_from_rx(out))
    }

    /// Discard buffered RX data.
    pub fn flush_rx(&self, handle: CdcHandle) -> Result<()> {
        self.record(handle)?.flush_rx();
        Ok(())
    }

    /// Discard queued TX data.
    pub fn flush_tx(&self, handle: CdcHandle) -> Result<()> {
        self.record(handle)?.flush_tx();
        Ok(())
    }

    /// Current unread RX byte count.
    pub fn rx_bytes_available(&self, handle: CdcHandle) -> Result<usize> {
        Ok(self.record(handle)?.rx_available())
    }

    /// Connection state of the device.
    pub fn state(&self, handle: CdcHandle) -> Result<DeviceState> {
        Ok(self.record(handle)?.state())
    }

    /// Log the device and active configuration descriptors.
    pub fn print_descriptors(&self, handle: CdcHandle) -> Result<()> {
        let record = self.record(handle)?;
        if !record.is_connected() {
            return Err(CdcError::InvalidState("device is not connected"));
        }
        let port = record
            .port()
            .ok_or(CdcError::InvalidState("device is not open"))?;
        let device = port.device_descriptor()?;
        let config = port.config_descriptor()?;
        descriptors::print(handle, &device, &config);
        Ok(())
    }

    fn record(&self, handle: CdcHandle) -> Result<Arc<DeviceRecord>> {
        if !self.shared.installed.load(Ordering::Acquire) {
            return Err(CdcError::InvalidState("driver is not installed"));
        }
        self.shared
            .registry
            .lock()
            .unwrap()
            .get(handle)
            .ok_or(CdcError::InvalidArg("stale device handle"))
    }
}

impl Drop for CdcDriver {
    fn drop(&mut self) {
        if self.shared.installed.swap(false, Ordering::AcqRel) {
            warn!("CDC driver dropped while installed; stopping driver task");
            let _ = self.shared.events.send_blocking(DriverEvent::Stop);
            if let Some(task) = self.task.lock().unwrap().take() {
                let _ = task.join();
            }
        }
    }
}

/// The background task: drains the event queue, serializes hot-plug
/// transitions and arms transfers. Parked in `recv_blocking` when idle;
/// `Stop` (or the queue closing) moves it to its terminal state, where it
/// releases the client registration and acknowledges shutdown.
struct DriverTask {
    shared: Arc<DriverShared>,
    events: Receiver<DriverEvent>,
    new_device_cb: Option<NewDeviceCallback>,
    stopped: mpsc::SyncSender<()>,
}

impl DriverTask {
    fn run(self) {
        debug!("driver task started");
        loop {
            let event = match self.events.recv_blocking() {
                Ok(event) => event,
                Err(_) => break,
            };
            match event {
                DriverEvent::Attached(info) => self.on_attached(info),
                DriverEvent::Detached(addr) => self.on_detached(addr),
                DriverEvent::Opened(handle) => self.on_opened(handle),
                DriverEvent::TxReady(handle) => {
                    if let Some(record) = self.record(handle) {
                        arm_tx(&record);
                    }
                }
                DriverEvent::RxResume(handle) => {
                    if let Some(record) = self.record(handle) {
                        arm_rx(&record);
                    }
                }
                DriverEvent::Stop => break,
            }
        }
        self.shared.backend.deregister_client();
        debug!("driver task stopped");
        let _ = self.stopped.send(());
    }

    fn record(&self, handle: CdcHandle) -> Option<Arc<DeviceRecord>> {
        self.shared.registry.lock().unwrap().get(handle)
    }

    fn on_attached(&self, info: DeviceInfo) {
        info!(
            "device attached: {} {:04x}:{:04x}",
            info.addr, info.vendor_id, info.product_id
        );
        // The application sees the identity only; devices cannot be created
        // from inside this callback (it runs on the task that create would
        // have to wait on).
        if let Some(cb) = &self.new_device_cb {
            cb(&info);
        }

        // Re-bind disconnected records waiting for a matching device
        let waiting: Vec<Arc<DeviceRecord>> = self
            .shared
            .registry
            .lock()
            .unwrap()
            .records()
            .filter(|r| !r.is_connected() && r.filter.matches(&info))
            .cloned()
            .collect();
        for record in waiting {
            let port = match self
                .shared
                .backend
                .open(info.addr, record.filter.interface)
            {
                Ok(port) => port,
                Err(e) => {
                    warn!("could not reopen {:?} on {}: {}", record.handle, info.addr, e);
                    continue;
                }
            };
            // Re-check under the registry lock so a concurrent delete cannot
            // race the re-bind
            let rebound = {
                let registry = self.shared.registry.lock().unwrap();
                if registry.get(record.handle).is_some() {
                    record.bind(port, info.clone());
                    true
                } else {
                    port.close();
                    false
                }
            };
            if rebound {
                info!("reconnected CDC device {:?} to {}", record.handle, info.addr);
                if let Some(cb) = &record.callbacks.connect {
                    cb(record.handle);
                }
                arm_rx(&record);
                arm_tx(&record);
            }
        }
    }

    fn on_detached(&self, addr: DeviceAddr) {
        info!("device detached: {}", addr);
        let affected: Vec<Arc<DeviceRecord>> = self
            .shared
            .registry
            .lock()
            .unwrap()
            .records()
            .filter(|r| r.is_connected() && r.info().map(|i| i.addr) == Some(addr))
            .cloned()
            .collect();
        for record in affected {
            if record.disconnect() {
                info!("CDC device {:?} disconnected", record.handle);
                if let Some(cb) = &record.callbacks.disconnect {
                    cb(record.handle);
                }
            }
        }
    }

    fn on_opened(&self, handle: CdcHandle) {
        let Some(record) = self.record(handle) else {
            return;
        };
        if let Some(cb) = &record.callbacks.connect {
            cb(record.handle);
        }
        arm_rx(&record);
        arm_tx(&record);
    }
}
