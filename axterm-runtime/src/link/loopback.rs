//! Loopback `KissLink` for tests: grounded on `m17app::test_util::NullTnc`,
//! generalized to actually echo `send` into `did_receive` instead of
//! discarding it, since link-layer tests need the round trip.

use std::sync::{Arc, Mutex};

use super::{KissLink, LinkDelegate, LinkState, SendCompletion};
use crate::error::RuntimeError;

pub struct LoopbackLink {
    state: LinkState,
    delegate: Arc<Mutex<Option<Arc<dyn LinkDelegate>>>>,
}

impl LoopbackLink {
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            delegate: Arc::new(Mutex::new(None)),
        }
    }
}

impl Default for LoopbackLink {
    fn default() -> Self {
        Self::new()
    }
}

impl KissLink for LoopbackLink {
    fn open(&mut self, delegate: Arc<dyn LinkDelegate>) -> Result<(), RuntimeError> {
        delegate.state_changed(LinkState::Connected);
        *self.delegate.lock().unwrap() = Some(delegate);
        self.state = LinkState::Connected;
        Ok(())
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        if let Some(delegate) = self.delegate.lock().unwrap().take() {
            delegate.state_changed(LinkState::Disconnected);
        }
        self.state = LinkState::Disconnected;
        Ok(())
    }

    fn send(&mut self, bytes: Vec<u8>, completion: SendCompletion) {
        match self.delegate.lock().unwrap().as_ref() {
            Some(delegate) => {
                delegate.did_receive(&bytes);
                completion(Ok(()));
            }
            None => completion(Err(RuntimeError::NotConnected)),
        }
    }

    fn state(&self) -> LinkState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingDelegate {
        received: StdMutex<Vec<Vec<u8>>>,
    }

    impl LinkDelegate for RecordingDelegate {
        fn did_receive(&self, bytes: &[u8]) {
            self.received.lock().unwrap().push(bytes.to_vec());
        }
        fn state_changed(&self, _state: LinkState) {}
        fn error(&self, _message: String) {}
    }

    #[test]
    fn send_echoes_into_did_receive() {
        let mut link = LoopbackLink::new();
        let delegate = Arc::new(RecordingDelegate {
            received: StdMutex::new(Vec::new()),
        });
        link.open(delegate.clone()).unwrap();
        link.send(vec![1, 2, 3], Box::new(|result| assert!(result.is_ok())));
        assert_eq!(delegate.received.lock().unwrap()[0], vec![1, 2, 3]);
    }

    #[test]
    fn send_before_open_fails_not_connected() {
        let mut link = LoopbackLink::new();
        link.send(
            vec![1],
            Box::new(|result| assert!(matches!(result, Err(RuntimeError::NotConnected)))),
        );
    }
}
