//! CDC Driver Integration Tests
//!
//! Drives the full driver (event queue, driver task, transfer state
//! machines) against the scriptable mock host stack.
//!
//! # Test Scenarios
//! - Install/uninstall lifecycle and leak-freedom
//! - Device matching (default-first and explicit VID/PID)
//! - RX delivery, backpressure stall/resume
//! - TX draining and partial-write reporting
//! - Hot-plug disconnect/reconnect semantics
//! - Handle staleness and error taxonomy
//!
//! Run with: `cargo test -p usbh-cdc --test driver_tests`

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use usbh::mock::{DEFAULT_TEST_TIMEOUT, MockHost, cdc_device_info, wait_until};
use usbh::{DeviceAddr, HostError};
use usbh_cdc::{
    CdcDriver, CdcError, DeviceConfig, DeviceState, DriverConfig, EventCallbacks,
};

fn install(host: &MockHost) -> CdcDriver {
    CdcDriver::install(Arc::new(host.clone()), DriverConfig::default())
        .expect("failed to install driver")
}

fn addr(bus: u8, address: u8) -> DeviceAddr {
    DeviceAddr { bus, address }
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_install_then_immediate_uninstall() {
    let host = MockHost::new();
    let driver = install(&host);
    driver.uninstall().expect("uninstall with no devices must succeed");
}

#[test]
fn test_uninstall_rejects_live_devices() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);

    let dev = driver.create(DeviceConfig::default()).unwrap();
    assert!(matches!(
        driver.uninstall(),
        Err(CdcError::InvalidState(_))
    ));

    driver.delete(dev).unwrap();
    driver.uninstall().expect("uninstall after delete must succeed");
}

#[test]
fn test_operations_fail_after_uninstall() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver.create(DeviceConfig::default()).unwrap();
    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();

    assert!(matches!(
        driver.create(DeviceConfig::default()),
        Err(CdcError::InvalidState(_))
    ));
    assert!(matches!(
        driver.write(dev, b"x"),
        Err(CdcError::InvalidState(_))
    ));
}

// ============================================================================
// Device Matching Tests
// ============================================================================

#[test]
fn test_default_selection_opens_first_device() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1111, 0xaaaa, 1, 1));
    host.add_device(cdc_device_info(0x2222, 0xbbbb, 1, 2));
    let driver = install(&host);

    let dev = driver.create(DeviceConfig::default()).unwrap();
    assert!(host.port(addr(1, 1)).is_some());
    assert!(host.port(addr(1, 2)).is_none());

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_explicit_vid_pid_selects_matching_device() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1111, 0xaaaa, 1, 1));
    host.add_device(cdc_device_info(0x2222, 0xbbbb, 1, 2));
    let driver = install(&host);

    let dev = driver
        .create(DeviceConfig {
            vid: Some(0x2222),
            pid: Some(0xbbbb),
            ..Default::default()
        })
        .unwrap();
    assert!(host.port(addr(1, 2)).is_some());
    assert!(host.port(addr(1, 1)).is_none());

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_create_fails_without_match() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1111, 0xaaaa, 1, 1));
    let driver = install(&host);

    let err = driver
        .create(DeviceConfig {
            vid: Some(0x9999),
            pid: Some(0x9999),
            ..Default::default()
        })
        .unwrap_err();
    assert_eq!(err, CdcError::Host(HostError::NotFound));

    driver.uninstall().unwrap();
}

#[test]
fn test_create_fails_with_empty_bus() {
    let host = MockHost::new();
    let driver = install(&host);

    let err = driver.create(DeviceConfig::default()).unwrap_err();
    assert_eq!(err, CdcError::Host(HostError::NotFound));

    driver.uninstall().unwrap();
}

#[test]
fn test_asymmetric_vid_pid_is_invalid() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1111, 0xaaaa, 1, 1));
    let driver = install(&host);

    let err = driver
        .create(DeviceConfig {
            vid: Some(0x1111),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, CdcError::InvalidArg(_)));

    driver.uninstall().unwrap();
}

#[test]
fn test_device_limit() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1111, 0xaaaa, 1, 1));
    let driver = CdcDriver::install(
        Arc::new(host.clone()),
        DriverConfig {
            max_devices: 1,
            ..Default::default()
        },
    )
    .unwrap();

    let dev = driver.create(DeviceConfig::default()).unwrap();
    assert!(matches!(
        driver.create(DeviceConfig::default()),
        Err(CdcError::NoMem(_))
    ));

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

// ============================================================================
// RX Path Tests
// ============================================================================

#[test]
fn test_rx_delivery_and_callback() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);

    let received = Arc::new(AtomicUsize::new(0));
    let counter = received.clone();
    let dev = driver
        .create(DeviceConfig {
            callbacks: EventCallbacks {
                recv_data: Some(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));

    assert!(port.complete_in(b"hello"));
    assert_eq!(driver.rx_bytes_available(dev).unwrap(), 5);
    assert!(received.load(Ordering::SeqCst) >= 1);

    let mut buf = [0u8; 32];
    let n = driver.read(dev, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
    assert_eq!(driver.rx_bytes_available(dev).unwrap(), 0);

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_rx_order_preserved_across_partial_reads() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver.create(DeviceConfig::default()).unwrap();

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));
    assert!(port.complete_in(b"abc"));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));
    assert!(port.complete_in(b"def"));

    let mut collected = Vec::new();
    let mut buf = [0u8; 2];
    while collected.len() < 6 {
        let n = driver.read(dev, &mut buf).unwrap();
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, b"abcdef");

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_rx_backpressure_stalls_and_resumes() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver
        .create(DeviceConfig {
            rx_buffer_size: 8,
            ..Default::default()
        })
        .unwrap();

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));
    // The submission is bounded by ring free space
    assert_eq!(port.pending_in_len(), Some(8));

    // Fill the ring: the completion runs inline and must stall the chain
    // rather than resubmit
    assert!(port.complete_in(b"abcdefgh"));
    assert!(!port.has_pending_in());
    assert_eq!(driver.rx_bytes_available(dev).unwrap(), 8);

    // Draining part of the ring resumes the chain, sized to the new free
    // space
    let mut buf = [0u8; 4];
    assert_eq!(driver.read(dev, &mut buf).unwrap(), 4);
    assert_eq!(&buf, b"abcd");
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));
    assert_eq!(port.pending_in_len(), Some(4));

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_flush_rx_discards_and_resumes() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver
        .create(DeviceConfig {
            rx_buffer_size: 8,
            ..Default::default()
        })
        .unwrap();

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));
    assert!(port.complete_in(b"abcdefgh"));
    assert!(!port.has_pending_in());

    driver.flush_rx(dev).unwrap();
    assert_eq!(driver.rx_bytes_available(dev).unwrap(), 0);
    // Flushing a full ring also restarts the stalled IN chain
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

// ============================================================================
// TX Path Tests
// ============================================================================

#[test]
fn test_tx_end_to_end() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver.create(DeviceConfig::default()).unwrap();

    let sent = driver.write(dev, b"hello world").unwrap();
    assert_eq!(sent, 11);

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.written_len() == 11));
    assert_eq!(port.take_written(), b"hello world".to_vec());

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_partial_write_reports_accepted_count() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver
        .create(DeviceConfig {
            tx_buffer_size: 8,
            ..Default::default()
        })
        .unwrap();

    // More bytes than the TX ring holds: success, short count
    let sent = driver.write(dev, &[0x55u8; 32]).unwrap();
    assert_eq!(sent, 8);

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.written_len() == 8));

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_tx_drains_in_flight_chunks() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver.create(DeviceConfig::default()).unwrap();

    let port = host.port(addr(1, 1)).unwrap();
    port.set_auto_complete_out(false);

    driver.write(dev, b"first").unwrap();
    // One OUT in flight; a second write queues behind it
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.complete_out_one()));
    driver.write(dev, b"second").unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.complete_out_one()));

    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.written_len() == 11));
    assert_eq!(port.take_written(), b"firstsecond".to_vec());

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

// ============================================================================
// Hot-plug Tests
// ============================================================================

#[test]
fn test_disconnect_halts_rx_without_data_loss() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver.create(DeviceConfig::default()).unwrap();

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));
    assert!(port.complete_in(b"final"));
    assert_eq!(driver.rx_bytes_available(dev).unwrap(), 5);

    host.remove_device(addr(1, 1));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        driver.state(dev).unwrap() == DeviceState::Disconnected
    }));

    // Buffered bytes survive the disconnect
    let mut buf = [0u8; 32];
    let n = driver.read(dev, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"final");

    // Writing to a disconnected device does not
    assert!(matches!(
        driver.write(dev, b"x"),
        Err(CdcError::InvalidState(_))
    ));

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_disconnect_fires_callback() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    let dev = driver
        .create(DeviceConfig {
            callbacks: EventCallbacks {
                disconnect: Some(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

    host.remove_device(addr(1, 1));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        disconnects.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(driver.state(dev).unwrap(), DeviceState::Disconnected);

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_reconnect_rebinds_record() {
    let host = MockHost::new();
    let info = cdc_device_info(0x1234, 0x5678, 1, 1);
    host.add_device(info.clone());
    let driver = install(&host);

    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    let dev = driver
        .create(DeviceConfig {
            vid: Some(0x1234),
            pid: Some(0x5678),
            callbacks: EventCallbacks {
                connect: Some(Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })),
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        connects.load(Ordering::SeqCst) == 1
    }));

    host.remove_device(addr(1, 1));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        driver.state(dev).unwrap() == DeviceState::Disconnected
    }));

    // Same identity comes back: the record re-binds, the connect callback
    // fires again and the IN chain is re-armed
    host.add_device(info);
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        driver.state(dev).unwrap() == DeviceState::Connected
    }));
    assert_eq!(connects.load(Ordering::SeqCst), 2);

    let port = host.port(addr(1, 1)).unwrap();
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || port.has_pending_in()));
    assert!(port.complete_in(b"back"));
    let mut buf = [0u8; 8];
    let n = driver.read(dev, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"back");

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}

#[test]
fn test_new_device_callback_fires_on_hotplug() {
    let host = MockHost::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let driver = CdcDriver::install(
        Arc::new(host.clone()),
        DriverConfig {
            new_device_cb: Some(Arc::new(move |info| {
                assert_eq!(info.vendor_id, 0x1234);
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        },
    )
    .unwrap();

    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        seen.load(Ordering::SeqCst) == 1
    }));

    driver.uninstall().unwrap();
}

// ============================================================================
// Handle and Descriptor Tests
// ============================================================================

#[test]
fn test_stale_handle_rejected_after_delete() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver.create(DeviceConfig::default()).unwrap();
    driver.delete(dev).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(
        driver.read(dev, &mut buf),
        Err(CdcError::InvalidArg(_))
    ));
    assert!(matches!(driver.state(dev), Err(CdcError::InvalidArg(_))));
    assert!(matches!(driver.delete(dev), Err(CdcError::InvalidArg(_))));

    driver.uninstall().unwrap();
}

#[test]
fn test_descriptor_print_preconditions() {
    let host = MockHost::new();
    host.add_device(cdc_device_info(0x1234, 0x5678, 1, 1));
    let driver = install(&host);
    let dev = driver.create(DeviceConfig::default()).unwrap();

    driver.print_descriptors(dev).expect("connected device must print");

    host.remove_device(addr(1, 1));
    assert!(wait_until(DEFAULT_TEST_TIMEOUT, || {
        driver.state(dev).unwrap() == DeviceState::Disconnected
    }));
    assert!(matches!(
        driver.print_descriptors(dev),
        Err(CdcError::InvalidState(_))
    ));

    driver.delete(dev).unwrap();
    driver.uninstall().unwrap();
}
