use crate::session::DeviceSession;
use crate::transport::base::DeviceIdentity;
use crate::transport::{find_devices, usb_factory, TransportFactory};
use crate::SUPPORTED_DEVICES;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::sleep;

/// How often the bus is rescanned for attached and detached samplers.
pub const DETECTION_INTERVAL: Duration = Duration::from_millis(1000);

const COMMAND_QUEUE_DEPTH: usize = 32;
const EVENT_QUEUE_DEPTH: usize = 32;

/// Enumerates the identities currently present on the bus.
pub type DeviceScanner = Arc<dyn Fn() -> Vec<DeviceIdentity> + Send + Sync>;

#[derive(Clone)]
pub enum RegistryEvent {
    Connected(DeviceSession),
    Disconnected(String),
}

enum RegistryCommand {
    Devices(oneshot::Sender<Vec<String>>),
    Get(String, oneshot::Sender<Option<DeviceSession>>),
    Stop(oneshot::Sender<()>),
}

/// Tracks the set of currently-attached samplers, deduplicated by physical
/// (bus, address) identity, and hands out session handles for them.
pub struct DeviceRegistry {
    commands: mpsc::Sender<RegistryCommand>,
    events: broadcast::Sender<RegistryEvent>,
}

impl DeviceRegistry {
    /// Start a registry watching the USB bus for supported samplers.
    pub fn start() -> Self {
        Self::start_with(Arc::new(find_devices), usb_factory(), DETECTION_INTERVAL)
    }

    /// Start with an explicit scanner / transport factory pair. Used when
    /// embedding against other transports, and by the tests.
    pub fn start_with(
        scanner: DeviceScanner,
        factory: TransportFactory,
        detection_interval: Duration,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_sender, _) = broadcast::channel(EVENT_QUEUE_DEPTH);

        let worker = RegistryWorker {
            scanner,
            factory,
            events: event_sender.clone(),
            devices: HashMap::new(),
            detection_interval,
        };
        tokio::spawn(worker.run(command_receiver));

        Self {
            commands: command_sender,
            events: event_sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Identifiers of every currently-tracked device.
    pub async fn devices(&self) -> Vec<String> {
        let (responder, response) = oneshot::channel();
        if self
            .commands
            .send(RegistryCommand::Devices(responder))
            .await
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }

    /// Resolve an identifier back to its session handle.
    pub async fn get(&self, identifier: &str) -> Option<DeviceSession> {
        let (responder, response) = oneshot::channel();
        if self
            .commands
            .send(RegistryCommand::Get(identifier.to_owned(), responder))
            .await
            .is_err()
        {
            return None;
        }
        response.await.unwrap_or_default()
    }

    /// Stop watching the bus. Live sessions are left untouched; closing
    /// them remains the caller's job.
    pub async fn stop(&self) {
        let (responder, response) = oneshot::channel();
        if self
            .commands
            .send(RegistryCommand::Stop(responder))
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }
}

struct RegistryWorker {
    scanner: DeviceScanner,
    factory: TransportFactory,
    events: broadcast::Sender<RegistryEvent>,
    devices: HashMap<String, DeviceSession>,
    detection_interval: Duration,
}

impl RegistryWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<RegistryCommand>) {
        // Create the device detection Sleep Timer..
        let detection_sleep = sleep(Duration::from_millis(0));
        tokio::pin!(detection_sleep);

        loop {
            tokio::select! {
                () = &mut detection_sleep => {
                    self.scan().await;
                    detection_sleep.as_mut().reset(tokio::time::Instant::now() + self.detection_interval);
                }
                command = commands.recv() => {
                    match command {
                        Some(RegistryCommand::Devices(responder)) => {
                            let _ = responder.send(self.devices.keys().cloned().collect());
                        }
                        Some(RegistryCommand::Get(identifier, responder)) => {
                            let _ = responder.send(self.devices.get(&identifier).cloned());
                        }
                        Some(RegistryCommand::Stop(responder)) => {
                            let _ = responder.send(());
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        debug!("Registry worker stopped");
    }

    async fn scan(&mut self) {
        let present = (self.scanner)();

        // Attach anything new; a device already tracked under the same bus
        // and address is ignored.
        for identity in &present {
            let supported = (identity.vendor_id(), identity.product_id());
            if !SUPPORTED_DEVICES.contains(&supported) {
                continue;
            }

            let identifier = identity.identifier();
            if self.devices.contains_key(&identifier) {
                continue;
            }

            info!(
                "[{}] Sampler connected ({})",
                identifier,
                identity.device_type()
            );
            let session = DeviceSession::attach(identity.clone(), self.factory.clone());
            self.devices.insert(identifier, session.clone());
            let _ = self.events.send(RegistryEvent::Connected(session));
        }

        // Anything tracked but no longer on the bus has detached.
        let missing: Vec<String> = self
            .devices
            .iter()
            .filter(|(_, session)| {
                !present
                    .iter()
                    .any(|identity| identity.is_same_device(session.identity()))
            })
            .map(|(identifier, _)| identifier.clone())
            .collect();

        for identifier in missing {
            if let Some(session) = self.devices.remove(&identifier) {
                info!("[{}] Sampler disconnected", identifier);
                session.notify_disconnect().await;
                let _ = self.events.send(RegistryEvent::Disconnected(identifier));
            }
        }
    }
}
