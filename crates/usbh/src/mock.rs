//! Scriptable host stack for tests
//!
//! [`MockHost`] implements the boundary traits with no hardware behind them:
//! tests script the device list (hot-plug hooks fire on add/remove), complete
//! queued IN submissions by hand, and inspect the bytes the driver wrote out.
//! Lives in the crate proper (not behind `cfg(test)`) so dependent crates can
//! drive their integration suites with it.

use crate::error::{HostError, HostResult};
use crate::traits::{DevicePort, HostBackend, HostHooks, InComplete, OutComplete};
use crate::types::{
    ConfigDescriptor, DeviceAddr, DeviceDescriptor, DeviceInfo, DeviceSpeed, EndpointDescriptor,
    InterfaceDescriptor, TransferKind,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default timeout for polling waits in tests.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Build a plausible CDC device summary for tests.
pub fn cdc_device_info(vid: u16, pid: u16, bus: u8, address: u8) -> DeviceInfo {
    DeviceInfo {
        addr: DeviceAddr { bus, address },
        vendor_id: vid,
        product_id: pid,
        class: 0x02, // Communications
        subclass: 0x02,
        protocol: 0x01,
        speed: DeviceSpeed::Full,
        manufacturer: Some("Mock Industries".to_string()),
        product: Some("Mock CDC Bridge".to_string()),
        serial_number: Some(format!("MOCK-{:04x}{:04x}", vid, pid)),
        num_configurations: 1,
    }
}

/// In-memory host stack.
#[derive(Clone)]
pub struct MockHost {
    inner: Arc<MockInner>,
}

struct MockInner {
    devices: Mutex<Vec<DeviceInfo>>,
    hooks: Mutex<Option<Arc<dyn HostHooks>>>,
    ports: Mutex<Vec<Arc<MockPort>>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MockInner {
                devices: Mutex::new(Vec::new()),
                hooks: Mutex::new(None),
                ports: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Attach a device: it becomes visible to `devices()` and the registered
    /// client's `device_attached` hook fires on the calling thread.
    pub fn add_device(&self, info: DeviceInfo) {
        self.inner.devices.lock().unwrap().push(info.clone());
        let hooks = self.inner.hooks.lock().unwrap().clone();
        if let Some(hooks) = hooks {
            hooks.device_attached(info);
        }
    }

    /// Detach the device at `addr`: open ports on it start failing with
    /// `NoDevice` and the `device_detached` hook fires.
    pub fn remove_device(&self, addr: DeviceAddr) {
        self.inner
            .devices
            .lock()
            .unwrap()
            .retain(|d| d.addr != addr);
        for port in self.inner.ports.lock().unwrap().iter() {
            if port.info.addr == addr {
                port.gone.store(true, Ordering::Release);
            }
        }
        let hooks = self.inner.hooks.lock().unwrap().clone();
        if let Some(hooks) = hooks {
            hooks.device_detached(addr);
        }
    }

    /// Most recently opened port for `addr`, if any.
    pub fn port(&self, addr: DeviceAddr) -> Option<Arc<MockPort>> {
        self.inner
            .ports
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.info.addr == addr)
            .cloned()
    }
}

impl Default for MockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostBackend for MockHost {
    fn register_client(&self, hooks: Arc<dyn HostHooks>) -> HostResult<()> {
        let mut slot = self.inner.hooks.lock().unwrap();
        if slot.is_some() {
            return Err(HostError::Busy);
        }
        *slot = Some(hooks);
        Ok(())
    }

    fn deregister_client(&self) {
        self.inner.hooks.lock().unwrap().take();
    }

    fn devices(&self) -> HostResult<Vec<DeviceInfo>> {
        Ok(self.inner.devices.lock().unwrap().clone())
    }

    fn open(&self, addr: DeviceAddr, interface: u8) -> HostResult<Arc<dyn DevicePort>> {
        let info = self
            .inner
            .devices
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.addr == addr)
            .cloned()
            .ok_or(HostError::NotFound)?;

        let mut ports = self.inner.ports.lock().unwrap();
        // An interface stays claimed until its port is closed
        if ports.iter().any(|p| {
            p.info.addr == addr
                && p.interface == interface
                && !p.closed.load(Ordering::Acquire)
                && !p.gone.load(Ordering::Acquire)
        }) {
            return Err(HostError::Busy);
        }

        let port = Arc::new(MockPort {
            info,
            interface,
            state: Mutex::new(PortState::default()),
            closed: AtomicBool::new(false),
            gone: AtomicBool::new(false),
            auto_complete_out: AtomicBool::new(true),
        });
        ports.push(port.clone());
        Ok(port)
    }
}

#[derive(Default)]
struct PortState {
    pending_in: VecDeque<(usize, InComplete)>,
    pending_out: VecDeque<(Vec<u8>, OutComplete)>,
    written: Vec<u8>,
}

/// One opened interface on the mock host.
pub struct MockPort {
    info: DeviceInfo,
    interface: u8,
    state: Mutex<PortState>,
    closed: AtomicBool,
    gone: AtomicBool,
    auto_complete_out: AtomicBool,
}

impl std::fmt::Debug for MockPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockPort")
            .field("info", &self.info)
            .field("interface", &self.interface)
            .finish_non_exhaustive()
    }
}

impl MockPort {
    fn unusable(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.gone.load(Ordering::Acquire)
    }

    /// Deliver `data` to the oldest pending IN submission, truncated to its
    /// requested length. Returns false if nothing is pending.
    pub fn complete_in(&self, data: &[u8]) -> bool {
        let popped = self.state.lock().unwrap().pending_in.pop_front();
        match popped {
            Some((max_len, complete)) => {
                let n = max_len.min(data.len());
                complete(Ok(data[..n].to_vec()));
                true
            }
            None => false,
        }
    }

    /// Fail the oldest pending IN submission with `err`.
    pub fn fail_in(&self, err: HostError) -> bool {
        let popped = self.state.lock().unwrap().pending_in.pop_front();
        match popped {
            Some((_, complete)) => {
                complete(Err(err));
                true
            }
            None => false,
        }
    }

    pub fn has_pending_in(&self) -> bool {
        !self.state.lock().unwrap().pending_in.is_empty()
    }

    /// Requested length of the oldest pending IN submission.
    pub fn pending_in_len(&self) -> Option<usize> {
        self.state.lock().unwrap().pending_in.front().map(|(n, _)| *n)
    }

    /// When disabled, OUT submissions queue up until [`MockPort::complete_out_one`].
    pub fn set_auto_complete_out(&self, auto: bool) {
        self.auto_complete_out.store(auto, Ordering::Release);
    }

    /// Complete the oldest queued OUT submission. Returns false if none.
    pub fn complete_out_one(&self) -> bool {
        let popped = {
            let mut state = self.state.lock().unwrap();
            match state.pending_out.pop_front() {
                Some((data, complete)) => {
                    state.written.extend_from_slice(&data);
                    Some((data.len(), complete))
                }
                None => None,
            }
        };
        match popped {
            Some((len, complete)) => {
                complete(Ok(len));
                true
            }
            None => false,
        }
    }

    /// All bytes written out so far, draining the capture buffer.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().unwrap().written)
    }

    pub fn written_len(&self) -> usize {
        self.state.lock().unwrap().written.len()
    }
}

impl DevicePort for MockPort {
    fn info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn submit_in(&self, max_len: usize, complete: InComplete) -> HostResult<()> {
        if self.unusable() {
            return Err(HostError::NoDevice);
        }
        self.state
            .lock()
            .unwrap()
            .pending_in
            .push_back((max_len, complete));
        Ok(())
    }

    fn submit_out(&self, data: Vec<u8>, complete: OutComplete) -> HostResult<()> {
        if self.unusable() {
            return Err(HostError::NoDevice);
        }
        if self.auto_complete_out.load(Ordering::Acquire) {
            let len = data.len();
            self.state.lock().unwrap().written.extend_from_slice(&data);
            // Completion runs with no mock lock held, like a real stack
            complete(Ok(len));
        } else {
            self.state
                .lock()
                .unwrap()
                .pending_out
                .push_back((data, complete));
        }
        Ok(())
    }

    fn device_descriptor(&self) -> HostResult<DeviceDescriptor> {
        if self.unusable() {
            return Err(HostError::NoDevice);
        }
        Ok(DeviceDescriptor {
            usb_version: (2, 0),
            device_version: (1, 0),
            vendor_id: self.info.vendor_id,
            product_id: self.info.product_id,
            class: self.info.class,
            subclass: self.info.subclass,
            protocol: self.info.protocol,
            max_packet_size_0: 64,
            num_configurations: 1,
        })
    }

    fn config_descriptor(&self) -> HostResult<ConfigDescriptor> {
        if self.unusable() {
            return Err(HostError::NoDevice);
        }
        Ok(ConfigDescriptor {
            number: 1,
            max_power_ma: 100,
            self_powered: false,
            remote_wakeup: false,
            interfaces: vec![InterfaceDescriptor {
                number: self.interface,
                class: 0x0a, // CDC-Data
                subclass: 0,
                protocol: 0,
                endpoints: vec![
                    EndpointDescriptor {
                        address: 0x81,
                        kind: TransferKind::Bulk,
                        max_packet_size: 64,
                        interval: 0,
                    },
                    EndpointDescriptor {
                        address: 0x01,
                        kind: TransferKind::Bulk,
                        max_packet_size: 64,
                        interval: 0,
                    },
                ],
            }],
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.pending_in.clear();
        state.pending_out.clear();
    }
}
