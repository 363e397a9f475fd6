//! Descriptor dump

use crate::registry::CdcHandle;
use tracing::info;
use usbh::{ConfigDescriptor, DeviceDescriptor};

/// Log the standard device descriptor and the active configuration
/// descriptor of an open device.
pub(crate) fn print(handle: CdcHandle, device: &DeviceDescriptor, config: &ConfigDescriptor) {
    info!("*** device descriptor for {:?} ***", handle);
    info!("bcdUSB: {}.{}", device.usb_version.0, device.usb_version.1);
    info!("idVendor: {:#06x}", device.vendor_id);
    info!("idProduct: {:#06x}", device.product_id);
    info!("bcdDevice: {}.{}", device.device_version.0, device.device_version.1);
    info!("bDeviceClass: {:#04x}", device.class);
    info!("bDeviceSubClass: {:#04x}", device.subclass);
    info!("bDeviceProtocol: {:#04x}", device.protocol);
    info!("bMaxPacketSize0: {}", device.max_packet_size_0);
    info!("bNumConfigurations: {}", device.num_configurations);

    info!("*** configuration descriptor ***");
    info!("bConfigurationValue: {}", config.number);
    info!("bMaxPower: {}mA", config.max_power_ma);
    info!("self powered: {}", config.self_powered);
    info!("remote wakeup: {}", config.remote_wakeup);
    for interface in &config.interfaces {
        info!(
            "  interface {}: class {:#04x} subclass {:#04x} protocol {:#04x}",
            interface.number, interface.class, interface.subclass, interface.protocol
        );
        for ep in &interface.endpoints {
            info!(
                "    endpoint {:#04x} ({}, {:?}): wMaxPacketSize {} bInterval {}",
                ep.address,
                if ep.is_in() { "IN" } else { "OUT" },
                ep.kind,
                ep.max_packet_size,
                ep.interval
            );
        }
    }
}
