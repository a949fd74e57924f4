use crate::error::TransportError;
use crate::transport::base::{FullTransport, OpenInfo, PollingTransport, UsbStrings};
use crate::transport::TransportFactory;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::Sender;

/// Scripted stand-in for a USB transport. Tests share the state handle to
/// inspect recorded calls, inject failures, and push inbound buffers.
#[derive(Default)]
pub(crate) struct MockState {
    pub calls: Vec<MockCall>,
    pub fail_attach: Option<TransportError>,
    pub fail_open: Option<TransportError>,
    pub fail_control: Option<TransportError>,
    pub data_sender: Option<Sender<Vec<u8>>>,
    pub error_sender: Option<Sender<TransportError>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MockCall {
    Open,
    Close,
    Control {
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
    },
    StartPoll,
    StopPoll,
}

pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl PollingTransport for MockTransport {
    fn open(&mut self) -> Result<OpenInfo, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::Open);
        match state.fail_open.clone() {
            Some(error) => Err(error),
            None => Ok(OpenInfo::default()),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().calls.push(MockCall::Close);
        Ok(())
    }

    fn control_transfer(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        _data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(MockCall::Control {
            request_type,
            request,
            value,
            index,
        });
        match state.fail_control.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn start_poll(&mut self) -> Result<(), TransportError> {
        self.state.lock().unwrap().calls.push(MockCall::StartPoll);
        Ok(())
    }

    fn stop_poll(&mut self) {
        self.state.lock().unwrap().calls.push(MockCall::StopPoll);
    }

    fn supports_kernel_driver_detach(&self) -> bool {
        false
    }

    fn read_strings(&mut self) -> Result<UsbStrings, TransportError> {
        Ok(UsbStrings::default())
    }
}

impl FullTransport for MockTransport {}

pub(crate) fn mock_factory(state: Arc<Mutex<MockState>>) -> TransportFactory {
    Arc::new(move |_identity, data_sender, error_sender| {
        let mut locked = state.lock().unwrap();
        if let Some(error) = locked.fail_attach.clone() {
            return Err(error);
        }
        locked.data_sender = Some(data_sender);
        locked.error_sender = Some(error_sender);
        Ok(Box::new(MockTransport {
            state: state.clone(),
        }) as Box<dyn FullTransport>)
    })
}
