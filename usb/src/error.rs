#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("No sampler found at bus {bus_number} address {address}")]
    DeviceNotFound { bus_number: u8, address: u8 },

    #[error("Unable to claim interface {0}")]
    InterfaceNotClaimed(u8),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record checksum mismatch, expected {expected:#04x}, received {received:#04x}")]
    ChecksumMismatch { expected: u8, received: u8 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Session is not open")]
    NotOpen,

    #[error("Device is no longer connected")]
    NotConnected,

    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}
