//! Shared USB types
//!
//! Identity, enumeration and descriptor types exchanged across the host
//! boundary. Descriptor structs carry only the fields class drivers and the
//! descriptor dump need, not the raw descriptor bytes.

/// Bus number / bus address pair identifying an attached device.
///
/// Stable for as long as the device stays attached; a re-plugged device may
/// come back under a different address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr {
    pub bus: u8,
    pub address: u8,
}

impl std::fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Negotiated device speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

/// Summary of an enumerated device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub addr: DeviceAddr,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub speed: DeviceSpeed,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub num_configurations: u8,
}

/// Standard device descriptor fields.
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    /// bcdUSB as (major, minor)
    pub usb_version: (u8, u8),
    /// bcdDevice as (major, minor)
    pub device_version: (u8, u8),
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// Max packet size of endpoint 0
    pub max_packet_size_0: u8,
    pub num_configurations: u8,
}

/// Active configuration descriptor with its interfaces.
#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    pub number: u8,
    pub max_power_ma: u16,
    pub self_powered: bool,
    pub remote_wakeup: bool,
    pub interfaces: Vec<InterfaceDescriptor>,
}

/// One interface (first alternate setting) within a configuration.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

/// Endpoint transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// One endpoint within an interface.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    /// bEndpointAddress; bit 7 set = IN
    pub address: u8,
    pub kind: TransferKind,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    /// Whether this is an IN (device to host) endpoint.
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}
