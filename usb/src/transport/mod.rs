use crate::error::TransportError;
use crate::transport::base::{AttachTransport, DeviceIdentity, FullTransport};
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

pub mod base;
mod libusb;

#[cfg(test)]
pub(crate) mod mock;

pub use libusb::{
    find_devices, UsbTransport, DEFAULT_TIMEOUT, ENDPOINT_DATA_IN, INTERFACE_CONTROL,
    INTERFACE_DATA,
};

/// Produces a transport bound to one physical device, wired to the given
/// data and error channels. Sessions acquire their transport through this
/// seam, which is also where tests substitute their own.
pub type TransportFactory = Arc<
    dyn Fn(
            &DeviceIdentity,
            Sender<Vec<u8>>,
            Sender<TransportError>,
        ) -> Result<Box<dyn FullTransport>, TransportError>
        + Send
        + Sync,
>;

/// Factory producing rusb-backed transports; the default for real hardware.
pub fn usb_factory() -> TransportFactory {
    Arc::new(|identity, data_sender, error_sender| {
        UsbTransport::from_identity(identity, data_sender, error_sender, DEFAULT_TIMEOUT)
    })
}
