use crate::decoder::decode;
use crate::error::{DeviceError, TransportError};
use crate::transport::base::{DeviceIdentity, FullTransport};
use crate::transport::TransportFactory;
use log::{debug, warn};
use quadvolt_types::Sample;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{broadcast, mpsc, oneshot};

// Acquisition is gated through the CDC SET_CONTROL_LINE_STATE request on
// the control interface: DTR+RTS asserted to stream, dropped to idle.
const REQUEST_TYPE_CLASS_INTERFACE: u8 = 0x21;
const REQUEST_SET_CONTROL_LINE_STATE: u8 = 0x22;
const CONTROL_LINES_ACTIVE: u16 = 0x0003;
const CONTROL_LINES_IDLE: u16 = 0x0000;
const CONTROL_INTERFACE_INDEX: u16 = 0;

const COMMAND_QUEUE_DEPTH: usize = 32;
const DATA_QUEUE_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 64;

/// Broadcast to every subscriber of a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Opened,
    Started,
    Stopped,
    Closed,
    Disconnected,
    Sample(Sample),
    RawData(Vec<u8>),
    Error(DeviceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Closed,
    Open,
    Running,
}

enum SessionCommand {
    Open(oneshot::Sender<Result<(), DeviceError>>),
    Start(oneshot::Sender<Result<(), DeviceError>>),
    Stop(oneshot::Sender<Result<(), DeviceError>>),
    Close(oneshot::Sender<Result<(), DeviceError>>),
    Disconnect,
}

/// Handle onto one device's session worker. Cheap to clone; all clones
/// address the same underlying state machine.
#[derive(Clone)]
pub struct DeviceSession {
    identity: DeviceIdentity,
    commands: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl DeviceSession {
    /// Spawn a session worker for the given device. The transport is not
    /// touched until `open()`.
    pub fn attach(identity: DeviceIdentity, factory: TransportFactory) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (event_sender, _) = broadcast::channel(EVENT_QUEUE_DEPTH);

        let worker = SessionWorker::new(identity.clone(), factory, event_sender.clone());
        tokio::spawn(worker.run(command_receiver));

        Self {
            identity,
            commands: command_sender,
            events: event_sender,
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn id(&self) -> String {
        self.identity.identifier()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn open(&self) -> Result<(), DeviceError> {
        self.request(SessionCommand::Open).await
    }

    pub async fn start(&self) -> Result<(), DeviceError> {
        self.request(SessionCommand::Start).await
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.request(SessionCommand::Stop).await
    }

    pub async fn close(&self) -> Result<(), DeviceError> {
        self.request(SessionCommand::Close).await
    }

    /// Invoked by the registry when the physical device drops off the bus.
    pub(crate) async fn notify_disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect).await;
    }

    async fn request(
        &self,
        command: fn(oneshot::Sender<Result<(), DeviceError>>) -> SessionCommand,
    ) -> Result<(), DeviceError> {
        let (responder, response) = oneshot::channel();
        if self.commands.send(command(responder)).await.is_err() {
            return Err(DeviceError::NotConnected);
        }
        response.await.unwrap_or(Err(DeviceError::NotConnected))
    }
}

struct SessionWorker {
    identity: DeviceIdentity,
    factory: TransportFactory,
    events: broadcast::Sender<SessionEvent>,

    state: SessionState,
    disconnected: bool,
    transport: Option<Box<dyn FullTransport>>,
    data_receiver: Option<Receiver<Vec<u8>>>,
    error_receiver: Option<Receiver<TransportError>>,
}

impl SessionWorker {
    fn new(
        identity: DeviceIdentity,
        factory: TransportFactory,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            identity,
            factory,
            events,
            state: SessionState::Closed,
            disconnected: false,
            transport: None,
            data_receiver: None,
            error_receiver: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        Some(command) => self.handle_command(command),
                        // Every handle dropped, we're done here.
                        None => break,
                    }
                }
                Some(buffer) = pending_recv(&mut self.data_receiver) => {
                    self.handle_buffer(buffer);
                }
                Some(error) = pending_recv(&mut self.error_receiver) => {
                    self.emit(SessionEvent::Error(DeviceError::Transport(error)));
                }
            }
        }

        if let Some(mut transport) = self.transport.take() {
            transport.stop_poll();
        }
        debug!("[{}] Session worker stopped", self.identity.identifier());
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Open(responder) => {
                let result = self.open();
                let _ = responder.send(result);
            }
            SessionCommand::Start(responder) => {
                let result = self.start();
                let _ = responder.send(result);
            }
            SessionCommand::Stop(responder) => {
                let result = self.stop();
                let _ = responder.send(result);
            }
            SessionCommand::Close(responder) => {
                let result = self.close();
                let _ = responder.send(result);
            }
            SessionCommand::Disconnect => self.disconnect(),
        }
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        if self.disconnected {
            return self.fail(DeviceError::NotConnected);
        }
        if self.state != SessionState::Closed {
            // Re-opening an open session is accepted silently.
            return Ok(());
        }

        let (data_sender, data_receiver) = mpsc::channel(DATA_QUEUE_DEPTH);
        let (error_sender, error_receiver) = mpsc::channel(COMMAND_QUEUE_DEPTH);

        let result =
            (self.factory)(&self.identity, data_sender, error_sender).and_then(|mut transport| {
                if !transport.supports_kernel_driver_detach() {
                    debug!(
                        "[{}] No kernel driver handoff on this platform",
                        self.identity.identifier()
                    );
                }
                let info = transport.open()?;
                if info.kernel_driver_detached {
                    debug!(
                        "[{}] Kernel driver handed over for the session",
                        self.identity.identifier()
                    );
                }
                if let Ok(strings) = transport.read_strings() {
                    debug!(
                        "[{}] Device strings: manufacturer={:?} product={:?} serial={:?}",
                        self.identity.identifier(),
                        strings.manufacturer,
                        strings.product,
                        strings.serial
                    );
                }
                transport.start_poll()?;
                Ok(transport)
            });

        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.data_receiver = Some(data_receiver);
                self.error_receiver = Some(error_receiver);
                self.state = SessionState::Open;
                self.emit(SessionEvent::Opened);
                Ok(())
            }
            Err(error) => self.fail(DeviceError::Transport(error)),
        }
    }

    fn start(&mut self) -> Result<(), DeviceError> {
        if self.disconnected {
            return self.fail(DeviceError::NotConnected);
        }
        if self.state != SessionState::Open {
            return self.fail(DeviceError::NotOpen);
        }

        match self.set_control_lines(CONTROL_LINES_ACTIVE) {
            Ok(()) => {
                self.state = SessionState::Running;
                self.emit(SessionEvent::Started);
                Ok(())
            }
            Err(error) => self.fail(error),
        }
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        if self.disconnected {
            return self.fail(DeviceError::NotConnected);
        }
        if self.state == SessionState::Closed {
            return self.fail(DeviceError::NotOpen);
        }

        match self.set_control_lines(CONTROL_LINES_IDLE) {
            Ok(()) => {
                self.state = SessionState::Open;
                self.emit(SessionEvent::Stopped);
                Ok(())
            }
            Err(error) => self.fail(error),
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.state == SessionState::Closed || self.disconnected {
            // Idempotent: resolve the caller, leave no events behind. After a
            // disconnect there is nothing left to release either way.
            self.teardown();
            return Ok(());
        }

        if self.state == SessionState::Running {
            match self.set_control_lines(CONTROL_LINES_IDLE) {
                Ok(()) => {
                    self.state = SessionState::Open;
                    self.emit(SessionEvent::Stopped);
                }
                Err(error) => {
                    warn!(
                        "[{}] Carrier deassert failed during close: {}",
                        self.identity.identifier(),
                        error
                    );
                }
            }
        }

        let result = match self.transport.as_mut() {
            Some(transport) => {
                transport.stop_poll();
                transport.close()
            }
            None => Ok(()),
        };
        self.teardown();

        match result {
            Ok(()) => {
                self.emit(SessionEvent::Closed);
                Ok(())
            }
            Err(error) => {
                let error = DeviceError::Transport(error);
                self.emit(SessionEvent::Error(error.clone()));
                Err(error)
            }
        }
    }

    fn disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;

        // The physical device is gone; no release traffic, just drop our side.
        if let Some(mut transport) = self.transport.take() {
            transport.stop_poll();
        }
        self.data_receiver = None;
        self.error_receiver = None;
        self.emit(SessionEvent::Disconnected);
    }

    fn handle_buffer(&mut self, buffer: Vec<u8>) {
        let records: Vec<_> = decode(&buffer).collect();
        self.emit(SessionEvent::RawData(buffer));

        for record in records {
            match record {
                Ok(sample) => self.emit(SessionEvent::Sample(sample)),
                Err(error) => self.emit(SessionEvent::Error(DeviceError::Decode(error))),
            }
        }
    }

    fn set_control_lines(&mut self, value: u16) -> Result<(), DeviceError> {
        let transport = self.transport.as_mut().ok_or(DeviceError::NotOpen)?;
        transport.control_transfer(
            REQUEST_TYPE_CLASS_INTERFACE,
            REQUEST_SET_CONTROL_LINE_STATE,
            value,
            CONTROL_INTERFACE_INDEX,
            &[],
        )?;
        Ok(())
    }

    fn teardown(&mut self) {
        self.transport = None;
        self.data_receiver = None;
        self.error_receiver = None;
        self.state = SessionState::Closed;
    }

    fn fail(&mut self, error: DeviceError) -> Result<(), DeviceError> {
        self.emit(SessionEvent::Error(error.clone()));
        Err(error)
    }

    fn emit(&self, event: SessionEvent) {
        // Send only fails with no live subscribers.
        let _ = self.events.send(event);
    }
}

async fn pending_recv<T>(channel: &mut Option<Receiver<T>>) -> Option<T> {
    match channel {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeError;
    use crate::transport::mock::{mock_factory, MockCall, MockState};
    use crate::{PID_QUADVOLT, VID_QUADVOLT};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(VID_QUADVOLT, PID_QUADVOLT, 3, 7)
    }

    fn session() -> (DeviceSession, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let session = DeviceSession::attach(identity(), mock_factory(state.clone()));
        (session, state)
    }

    async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    fn recorded_calls(state: &Arc<Mutex<MockState>>) -> Vec<MockCall> {
        state.lock().unwrap().calls.clone()
    }

    async fn push_data(state: &Arc<Mutex<MockState>>, buffer: &[u8]) {
        let sender = state.lock().unwrap().data_sender.clone().unwrap();
        sender.send(buffer.to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn open_transitions_and_emits_once() {
        let (session, state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));

        // Second open is a silent no-op.
        session.open().await.unwrap();
        session.close().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Closed));

        let opens = recorded_calls(&state)
            .iter()
            .filter(|call| **call == MockCall::Open)
            .count();
        assert_eq!(opens, 1);
    }

    #[tokio::test]
    async fn open_failure_stays_closed_and_reports() {
        let (session, state) = session();
        state.lock().unwrap().fail_attach =
            Some(TransportError::DeviceNotFound {
                bus_number: 3,
                address: 7,
            });
        let mut events = session.subscribe();

        let result = session.open().await;
        assert!(matches!(result, Err(DeviceError::Transport(_))));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(DeviceError::Transport(_))
        ));

        // The failure is not sticky; a later open succeeds.
        state.lock().unwrap().fail_attach = None;
        session.open().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));
    }

    #[tokio::test]
    async fn claim_failure_is_reported_and_recoverable() {
        let (session, state) = session();
        state.lock().unwrap().fail_open = Some(TransportError::InterfaceNotClaimed(0));
        let mut events = session.subscribe();

        assert_eq!(
            session.open().await,
            Err(DeviceError::Transport(TransportError::InterfaceNotClaimed(
                0
            )))
        );
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(_)
        ));

        state.lock().unwrap().fail_open = None;
        session.open().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));
    }

    #[tokio::test]
    async fn start_asserts_the_control_lines() {
        let (session, state) = session();
        session.open().await.unwrap();
        session.start().await.unwrap();

        assert!(recorded_calls(&state).contains(&MockCall::Control {
            request_type: 0x21,
            request: 0x22,
            value: 0x0003,
            index: 0,
        }));
    }

    #[tokio::test]
    async fn start_requires_an_open_session() {
        let (session, state) = session();
        let mut events = session.subscribe();

        assert_eq!(session.start().await, Err(DeviceError::NotOpen));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(DeviceError::NotOpen)
        ));
        assert!(recorded_calls(&state).is_empty());
    }

    #[tokio::test]
    async fn stop_returns_to_open_and_can_restart() {
        let (session, _state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        session.start().await.unwrap();
        session.stop().await.unwrap();
        session.start().await.unwrap();

        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Started));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Stopped));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Started));
    }

    #[tokio::test]
    async fn close_while_running_stops_first() {
        let (session, state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        session.start().await.unwrap();
        session.close().await.unwrap();

        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Started));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Stopped));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Closed));

        let calls = recorded_calls(&state);
        let deassert = calls
            .iter()
            .position(|call| matches!(call, MockCall::Control { value: 0, .. }))
            .expect("no carrier deassert recorded");
        let close = calls
            .iter()
            .position(|call| *call == MockCall::Close)
            .expect("no close recorded");
        assert!(deassert < close);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (session, _state) = session();
        let mut events = session.subscribe();

        session.close().await.unwrap();
        session.open().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Closed));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_guards_further_operations() {
        let (session, state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));

        session.notify_disconnect().await;
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Disconnected
        ));

        let calls_before = recorded_calls(&state);
        assert_eq!(session.start().await, Err(DeviceError::NotConnected));
        assert_eq!(session.stop().await, Err(DeviceError::NotConnected));
        assert_eq!(session.open().await, Err(DeviceError::NotConnected));

        // No control traffic reached the dead device.
        let control_calls = |calls: &[MockCall]| {
            calls
                .iter()
                .filter(|call| matches!(call, MockCall::Control { .. }))
                .count()
        };
        assert_eq!(
            control_calls(&recorded_calls(&state)),
            control_calls(&calls_before)
        );

        // close() still succeeds.
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn inbound_buffers_become_samples() {
        let (session, state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        session.start().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Started));

        let buffer = [0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0x0A];
        push_data(&state, &buffer).await;

        match next_event(&mut events).await {
            SessionEvent::RawData(raw) => assert_eq!(raw, buffer.to_vec()),
            other => panic!("expected raw data, got {:?}", other),
        }
        match next_event(&mut events).await {
            SessionEvent::Sample(sample) => assert_eq!(sample, Sample::new(1, 2, 3, 4)),
            other => panic!("expected a sample, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_reports_and_keeps_going() {
        let (session, state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        session.start().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));
        assert!(matches!(next_event(&mut events).await, SessionEvent::Started));

        // Bad record first, valid record after it in the same buffer.
        let mut buffer = vec![0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0xFF];
        buffer.extend([0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00, 0x0A]);
        push_data(&state, &buffer).await;

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::RawData(_)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(DeviceError::Decode(DecodeError::ChecksumMismatch { .. }))
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Sample(_)
        ));

        // The session is still running and still usable.
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn transport_errors_surface_without_closing() {
        let (session, state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));

        let sender = state.lock().unwrap().error_sender.clone().unwrap();
        sender
            .send(TransportError::Usb(rusb::Error::Pipe))
            .await
            .unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(DeviceError::Transport(TransportError::Usb(
                rusb::Error::Pipe
            )))
        ));

        // A stall does not end the session.
        session.start().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Started));
    }

    #[tokio::test]
    async fn control_failure_leaves_state_unchanged() {
        let (session, state) = session();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Opened));

        state.lock().unwrap().fail_control = Some(TransportError::Usb(rusb::Error::Pipe));
        let result = session.start().await;
        assert!(matches!(result, Err(DeviceError::Transport(_))));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error(DeviceError::Transport(_))
        ));

        // Still Open: a stop is accepted once the device behaves again.
        state.lock().unwrap().fail_control = None;
        session.stop().await.unwrap();
        assert!(matches!(next_event(&mut events).await, SessionEvent::Stopped));
    }
}
