//! Per-device state
//!
//! A [`DeviceRecord`] is owned by the driver; applications only ever hold
//! the opaque handle. The record is mutated from three contexts: transfer
//! completions (ring fill/drain, on the host stack's context), the driver
//! task (connection-state transitions on hot-plug), and application calls
//! (byte-level operations). Ring buffers are only touched under their own
//! lock, and no lock is held across a transfer submission or a callback.

use crate::config::{DeviceConfig, EventCallbacks};
use crate::driver::DriverEvent;
use crate::error::{CdcError, Result};
use crate::registry::CdcHandle;
use crate::ring_buffer::RingBuffer;
use async_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;
use usbh::{DeviceInfo, DevicePort};

/// Connection state of a CDC device as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connected,
}

/// Identity filter a record was created with; drives matching at create
/// time and re-binding on hot-plug arrival.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatchFilter {
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    /// Interface to claim on the matched device.
    pub interface: u8,
}

impl MatchFilter {
    /// `None` vid/pid matches any device.
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => info.vendor_id == vid && info.product_id == pid,
            _ => true,
        }
    }
}

pub(crate) struct RxState {
    pub ring: RingBuffer,
    /// IN chain parked because the ring was full; a read or flush resumes it.
    pub stalled: bool,
}

pub(crate) struct DeviceRecord {
    pub handle: CdcHandle,
    pub filter: MatchFilter,
    pub callbacks: EventCallbacks,
    connected: AtomicBool,
    /// Identity of the currently (or last) bound device.
    info: Mutex<Option<DeviceInfo>>,
    port: Mutex<Option<Arc<dyn DevicePort>>>,
    pub rx: Mutex<RxState>,
    pub tx: Mutex<RingBuffer>,
    /// At most one OUT transfer in flight.
    pub tx_busy: AtomicBool,
    events: Sender<DriverEvent>,
}

impl DeviceRecord {
    pub fn new(handle: CdcHandle, config: &DeviceConfig, events: Sender<DriverEvent>) -> Self {
        Self {
            handle,
            filter: MatchFilter {
                vid: config.vid,
                pid: config.pid,
                interface: config.interface,
            },
            callbacks: config.callbacks.clone(),
            connected: AtomicBool::new(false),
            info: Mutex::new(None),
            port: Mutex::new(None),
            rx: Mutex::new(RxState {
                ring: RingBuffer::with_capacity(config.rx_capacity()),
                stalled: false,
            }),
            tx: Mutex::new(RingBuffer::with_capacity(config.tx_capacity())),
            tx_busy: AtomicBool::new(false),
            events,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> DeviceState {
        if self.is_connected() {
            DeviceState::Connected
        } else {
            DeviceState::Disconnected
        }
    }

    pub fn info(&self) -> Option<DeviceInfo> {
        self.info.lock().unwrap().clone()
    }

    pub fn port(&self) -> Option<Arc<dyn DevicePort>> {
        self.port.lock().unwrap().clone()
    }

    /// Attach an opened port; the record becomes connected.
    pub fn bind(&self, port: Arc<dyn DevicePort>, info: DeviceInfo) {
        *self.info.lock().unwrap() = Some(info);
        *self.port.lock().unwrap() = Some(port);
        self.rx.lock().unwrap().stalled = false;
        self.tx_busy.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
    }

    /// Drop the port and mark disconnected. Buffered RX data stays readable
    /// until the record is deleted. Returns whether a transition happened.
    pub fn disconnect(&self) -> bool {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(port) = self.port.lock().unwrap().take() {
            port.close();
        }
        true
    }

    /// Teardown on delete: close the port and discard buffered data.
    pub fn shutdown(&self) {
        self.disconnect();
        self.rx.lock().unwrap().ring.flush();
        self.tx.lock().unwrap().flush();
    }

    /// Enqueue bytes for transmission; best-effort and non-blocking.
    pub fn write_into_tx(&self, data: &[u8]) -> Result<usize> {
        if !self.is_connected() {
            return Err(CdcError::InvalidState("device is not connected"));
        }
        let pushed = self.tx.lock().unwrap().push(data);
        if pushed < data.len() {
            debug!(
                "TX ring full on {:?}: accepted {} of {} bytes",
                self.handle,
                pushed,
                data.len()
            );
        }
        if pushed > 0 && !self.tx_busy.load(Ordering::Acquire) {
            self.notify(DriverEvent::TxReady(self.handle));
        }
        Ok(pushed)
    }

    /// Dequeue received bytes. Works while disconnected so that data
    /// buffered before a detach is not lost.
    pub fn read_from_rx(&self, out: &mut [u8]) -> usize {
        let (n, resume) = {
            let mut rx = self.rx.lock().unwrap();
            let n = rx.ring.pop(out);
            let resume = rx.stalled && rx.ring.free() > 0;
            if resume {
                rx.stalled = false;
            }
            (n, resume)
        };
        if resume && self.is_connected() {
            self.notify(DriverEvent::RxResume(self.handle));
        }
        n
    }

    pub fn rx_available(&self) -> usize {
        self.rx.lock().unwrap().ring.len()
    }

    /// Discard buffered RX data, resuming a stalled IN chain.
    pub fn flush_rx(&self) {
        let resume = {
            let mut rx = self.rx.lock().unwrap();
            rx.ring.flush();
            let resume = rx.stalled;
            rx.stalled = false;
            resume
        };
        if resume && self.is_connected() {
            self.notify(DriverEvent::RxResume(self.handle));
        }
    }

    /// Discard queued TX data.
    pub fn flush_tx(&self) {
        self.tx.lock().unwrap().flush();
    }

    fn notify(&self, event: DriverEvent) {
        if self.events.send_blocking(event).is_err() {
            debug!("driver task gone; dropping wake event for {:?}", self.handle);
        }
    }
}
