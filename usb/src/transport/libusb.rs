use crate::error::TransportError;
use crate::transport::base::{
    AttachTransport, DeviceIdentity, FullTransport, OpenInfo, PollingTransport, UsbStrings,
};
use crate::SUPPORTED_DEVICES;
use cfg_if::cfg_if;
use log::{debug, info, warn};
use rusb::{Device, DeviceDescriptor, DeviceHandle, GlobalContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;

pub const INTERFACE_CONTROL: u8 = 0;
pub const INTERFACE_DATA: u8 = 1;
pub const ENDPOINT_DATA_IN: u8 = 0x81;

/// Deadline applied to every USB call, so a wedged device can never hang an
/// operation indefinitely.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

// The poll loop uses a short read deadline; the handle lock is shared with
// control transfers and must not be held for long.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const POLL_BUFFER_SIZE: usize = 512;
const STRING_TIMEOUT: Duration = Duration::from_millis(100);

pub struct UsbTransport {
    device: Device<GlobalContext>,
    handle: Arc<Mutex<DeviceHandle<GlobalContext>>>,
    descriptor: DeviceDescriptor,

    data_sender: Sender<Vec<u8>>,
    error_sender: Sender<TransportError>,

    stopping: Arc<AtomicBool>,
    poll_handle: Option<thread::JoinHandle<()>>,

    claimed: bool,
    timeout: Duration,
}

impl UsbTransport {
    fn find_device(
        identity: &DeviceIdentity,
    ) -> Result<(Device<GlobalContext>, DeviceDescriptor), TransportError> {
        if let Ok(devices) = rusb::devices() {
            for usb_device in devices.iter() {
                if usb_device.bus_number() == identity.bus_number()
                    && usb_device.address() == identity.address()
                {
                    if let Ok(descriptor) = usb_device.device_descriptor() {
                        return Ok((usb_device, descriptor));
                    }
                }
            }
        }
        Err(TransportError::DeviceNotFound {
            bus_number: identity.bus_number(),
            address: identity.address(),
        })
    }

    fn handle(&self) -> MutexGuard<'_, DeviceHandle<GlobalContext>> {
        self.handle.lock().expect("usb handle lock")
    }
}

impl AttachTransport for UsbTransport {
    fn from_identity(
        identity: &DeviceIdentity,
        data_sender: Sender<Vec<u8>>,
        error_sender: Sender<TransportError>,
        timeout: Duration,
    ) -> Result<Box<dyn FullTransport>, TransportError> {
        // Firstly, we need to locate the USB device based on the location..
        let (device, descriptor) = UsbTransport::find_device(identity)?;
        let handle = device.open()?;

        info!("Connected to possible sampler at {:?}", device);

        Ok(Box::new(Self {
            device,
            handle: Arc::new(Mutex::new(handle)),
            descriptor,
            data_sender,
            error_sender,
            stopping: Arc::new(AtomicBool::new(false)),
            poll_handle: None,
            claimed: false,
            timeout,
        }))
    }
}

impl PollingTransport for UsbTransport {
    fn open(&mut self) -> Result<OpenInfo, TransportError> {
        let kernel_driver_detached;

        {
            let mut handle = self.handle();
            kernel_driver_detached = prepare_kernel_driver(&mut handle)?;

            for interface in [INTERFACE_CONTROL, INTERFACE_DATA] {
                if handle.claim_interface(interface).is_err() {
                    return Err(TransportError::InterfaceNotClaimed(interface));
                }
            }
        }
        self.claimed = true;

        if kernel_driver_detached {
            debug!("Kernel driver detached from {:?}", self.device);
        }

        Ok(OpenInfo {
            kernel_driver_detached,
        })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.stop_poll();

        if self.claimed {
            self.claimed = false;
            // Releasing with auto-detach active re-binds the kernel driver.
            let mut handle = self.handle();
            for interface in [INTERFACE_DATA, INTERFACE_CONTROL] {
                handle.release_interface(interface)?;
            }
        }

        Ok(())
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.handle()
            .write_control(request_type, request, value, index, data, self.timeout)?;

        Ok(())
    }

    fn start_poll(&mut self) -> Result<(), TransportError> {
        if self.poll_handle.is_some() {
            return Ok(());
        }
        self.stopping.store(false, Ordering::Relaxed);

        let handle = self.handle.clone();
        let stopping = self.stopping.clone();
        let data_sender = self.data_sender.clone();
        let error_sender = self.error_sender.clone();

        // read_bulk blocks, so polling gets a plain thread rather than a task.
        self.poll_handle = Some(thread::spawn(move || {
            let mut buffer = [0; POLL_BUFFER_SIZE];
            loop {
                if stopping.load(Ordering::Relaxed) {
                    break;
                }

                let result = {
                    let handle = handle.lock().expect("usb handle lock");
                    handle.read_bulk(ENDPOINT_DATA_IN, &mut buffer, POLL_TIMEOUT)
                };

                match result {
                    Ok(0) => continue,
                    Ok(length) => {
                        if data_sender.blocking_send(buffer[..length].to_vec()).is_err() {
                            // Receiver gone, the session has shut down.
                            break;
                        }
                    }
                    Err(rusb::Error::Timeout) => continue,
                    Err(error) => {
                        warn!("Bulk read failed: {}", error);
                        let fatal = error == rusb::Error::NoDevice;
                        if error_sender
                            .blocking_send(TransportError::Usb(error))
                            .is_err()
                            || fatal
                        {
                            break;
                        }
                        thread::sleep(POLL_TIMEOUT);
                    }
                }
            }
            debug!("Data poll loop stopped");
        }));

        Ok(())
    }

    fn stop_poll(&mut self) {
        self.stopping.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.join();
        }
    }

    fn supports_kernel_driver_detach(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn read_strings(&mut self) -> Result<UsbStrings, TransportError> {
        let handle = self.handle();
        let languages = handle.read_languages(STRING_TIMEOUT)?;
        let language = match languages.first() {
            Some(language) => language.to_owned(),
            None => return Ok(UsbStrings::default()),
        };

        Ok(UsbStrings {
            manufacturer: handle
                .read_manufacturer_string(language, &self.descriptor, STRING_TIMEOUT)
                .ok(),
            product: handle
                .read_product_string(language, &self.descriptor, STRING_TIMEOUT)
                .ok(),
            serial: handle
                .read_serial_number_string(language, &self.descriptor, STRING_TIMEOUT)
                .ok(),
        })
    }
}

impl FullTransport for UsbTransport {}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.stop_poll();
    }
}

cfg_if! {
    if #[cfg(target_os = "linux")] {
        // cdc_acm will usually have grabbed the device; let libusb hand the
        // interfaces over on claim and back on release. Reports whether a
        // driver was bound at the time.
        fn prepare_kernel_driver(
            handle: &mut DeviceHandle<GlobalContext>,
        ) -> Result<bool, TransportError> {
            let mut driver_bound = false;
            for interface in [INTERFACE_CONTROL, INTERFACE_DATA] {
                if handle.kernel_driver_active(interface).unwrap_or(false) {
                    driver_bound = true;
                }
            }
            handle.set_auto_detach_kernel_driver(true)?;
            Ok(driver_bound)
        }
    } else {
        fn prepare_kernel_driver(
            _handle: &mut DeviceHandle<GlobalContext>,
        ) -> Result<bool, TransportError> {
            Ok(false)
        }
    }
}

/// Scan the bus for attached devices matching the allow-list.
pub fn find_devices() -> Vec<DeviceIdentity> {
    let mut found_devices: Vec<DeviceIdentity> = Vec::new();

    if let Ok(devices) = rusb::devices() {
        for device in devices.iter() {
            if let Ok(descriptor) = device.device_descriptor() {
                let candidate = (descriptor.vendor_id(), descriptor.product_id());

                if SUPPORTED_DEVICES.contains(&candidate) {
                    found_devices.push(DeviceIdentity::new(
                        candidate.0,
                        candidate.1,
                        device.bus_number(),
                        device.address(),
                    ));
                }
            }
        }
    }

    found_devices
}
