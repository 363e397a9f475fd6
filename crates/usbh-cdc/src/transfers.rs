//! Transfer completion handling
//!
//! Per-device, per-direction state machines. RX: an IN submission sized to
//! the ring's free space is kept outstanding while the device is connected;
//! each completion appends to the ring, fires the receive callback and
//! resubmits. A full ring stalls the chain instead of dropping bytes, which
//! pushes backpressure down to the device; a later read or flush wakes the
//! driver task to re-arm. TX: one OUT transfer in flight at a time, draining
//! the ring chunk by chunk until it runs dry.
//!
//! Completions run on the host stack's context: short, lock-scoped, never
//! blocking.

use crate::device::DeviceRecord;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, trace, warn};
use usbh::{HostError, HostResult};

/// Upper bound on a single bulk transfer in either direction.
pub(crate) const TRANSFER_CHUNK: usize = 512;

/// Arm (or re-arm) the IN chain for `dev`.
///
/// Called from the driver task (initial arm, stall resume) and from the RX
/// completion itself. Caller must hold no device locks.
pub(crate) fn arm_rx(dev: &Arc<DeviceRecord>) {
    if !dev.is_connected() {
        return;
    }
    let Some(port) = dev.port() else { return };

    let want = {
        let mut rx = dev.rx.lock().unwrap();
        let free = rx.ring.free();
        if free == 0 {
            // Backpressure: leave the chain parked until a read frees space
            rx.stalled = true;
        }
        free.min(TRANSFER_CHUNK)
    };
    if want == 0 {
        debug!("RX ring full on {:?}; stalling IN chain", dev.handle);
        return;
    }

    let completer = dev.clone();
    if let Err(e) = port.submit_in(want, Box::new(move |res| on_rx_complete(completer, res))) {
        debug!("IN submission failed on {:?}: {}", dev.handle, e);
    }
}

fn on_rx_complete(dev: Arc<DeviceRecord>, result: HostResult<Vec<u8>>) {
    match result {
        Ok(data) => {
            if !data.is_empty() {
                let pushed = dev.rx.lock().unwrap().ring.push(&data);
                // The submission was sized to the ring's free space and this
                // handler is the only producer, so the payload always fits.
                debug_assert_eq!(pushed, data.len());
                trace!("RX {} bytes on {:?}", pushed, dev.handle);
                if let Some(cb) = &dev.callbacks.recv_data {
                    cb(dev.handle);
                }
            }
            arm_rx(&dev);
        }
        Err(HostError::NoDevice) => {
            // The detach notification owns the state transition
            debug!("IN chain ended on {:?}: device gone", dev.handle);
        }
        Err(e) => {
            warn!("IN transfer failed on {:?}: {}; halting RX", dev.handle, e);
        }
    }
}

/// Kick the OUT chain if bytes are queued and no transfer is in flight.
///
/// Called from the driver task (TX wake, rebind) and from the TX completion.
/// Caller must hold no device locks.
pub(crate) fn arm_tx(dev: &Arc<DeviceRecord>) {
    if !dev.is_connected() {
        return;
    }
    if dev.tx_busy.swap(true, Ordering::AcqRel) {
        return;
    }

    let chunk = {
        let mut tx = dev.tx.lock().unwrap();
        let mut buf = vec![0u8; tx.len().min(TRANSFER_CHUNK)];
        let n = tx.pop(&mut buf);
        buf.truncate(n);
        buf
    };
    if chunk.is_empty() {
        dev.tx_busy.store(false, Ordering::Release);
        return;
    }

    let Some(port) = dev.port() else {
        dev.tx_busy.store(false, Ordering::Release);
        return;
    };
    trace!("TX {} bytes submitted on {:?}", chunk.len(), dev.handle);
    let completer = dev.clone();
    if let Err(e) = port.submit_out(chunk, Box::new(move |res| on_tx_complete(completer, res))) {
        debug!("OUT submission failed on {:?}: {}", dev.handle, e);
        dev.tx_busy.store(false, Ordering::Release);
    }
}

fn on_tx_complete(dev: Arc<DeviceRecord>, result: HostResult<usize>) {
    // Clear the in-flight flag before checking for more work so a concurrent
    // write cannot slip between the check and the clear and lose its wake.
    dev.tx_busy.store(false, Ordering::Release);
    match result {
        Ok(written) => {
            trace!("TX {} bytes completed on {:?}", written, dev.handle);
            if !dev.tx.lock().unwrap().is_empty() {
                arm_tx(&dev);
            }
        }
        Err(HostError::NoDevice) => {
            debug!("OUT chain ended on {:?}: device gone", dev.handle);
        }
        Err(e) => {
            warn!("OUT transfer failed on {:?}: {}", dev.handle, e);
        }
    }
}
