use crate::error::TransportError;
use crate::{PID_QUADVOLT, PID_QUADVOLT_MK1, VID_QUADVOLT};
use quadvolt_types::DeviceType;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

// This is a basic SuperTrait which combines attachment and the polling
// operation set into one boxable device transport.
pub trait FullTransport: PollingTransport + Send {}

pub trait AttachTransport {
    fn from_identity(
        identity: &DeviceIdentity,
        data_sender: Sender<Vec<u8>>,
        error_sender: Sender<TransportError>,
        timeout: Duration,
    ) -> Result<Box<dyn FullTransport>, TransportError>
    where
        Self: Sized;
}

pub trait PollingTransport {
    /// Claim the control and data interfaces, detaching a kernel driver
    /// first where the platform supports it.
    fn open(&mut self) -> Result<OpenInfo, TransportError>;

    /// Release both interfaces and restore any kernel driver binding.
    fn close(&mut self) -> Result<(), TransportError>;

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Begin delivering bulk-IN buffers on the data sender, in arrival order.
    fn start_poll(&mut self) -> Result<(), TransportError>;
    fn stop_poll(&mut self);

    fn supports_kernel_driver_detach(&self) -> bool;

    /// Manufacturer / product / serial strings. Informational only.
    fn read_strings(&mut self) -> Result<UsbStrings, TransportError>;
}

// We primarily need the bus number and address for comparison; vendor and
// product decide whether the device is supported at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) bus_number: u8,
    pub(crate) address: u8,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, bus_number: u8, address: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus_number,
            address,
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }
    pub fn product_id(&self) -> u16 {
        self.product_id
    }
    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Opaque identifier used by the registry, stable for as long as the
    /// device stays on the bus.
    pub fn identifier(&self) -> String {
        format!("{}-{}", self.bus_number, self.address)
    }

    /// Same physical device means same bus number and device address.
    pub fn is_same_device(&self, other: &DeviceIdentity) -> bool {
        self.bus_number == other.bus_number && self.address == other.address
    }

    pub fn device_type(&self) -> DeviceType {
        if self.vendor_id != VID_QUADVOLT {
            return DeviceType::Unknown;
        }
        match self.product_id {
            PID_QUADVOLT => DeviceType::QuadVolt,
            PID_QUADVOLT_MK1 => DeviceType::QuadVoltMk1,
            _ => DeviceType::Unknown,
        }
    }
}

/// Reported by a successful `open()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenInfo {
    pub kernel_driver_detached: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UsbStrings {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial: Option<String>,
}
