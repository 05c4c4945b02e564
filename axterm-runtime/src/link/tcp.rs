//! TCP `KissLink`, grounded on `m17app::reflector::ReflectorClientTnc`'s
//! thread-per-connection reconnect loop and status-callback plumbing.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};

use super::{KissLink, LinkDelegate, LinkState, SendCompletion};
use crate::error::RuntimeError;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const READ_BUF_SIZE: usize = 4096;

pub struct TcpLink {
    host: String,
    port: u16,
    state: Arc<Mutex<LinkState>>,
    writer: Arc<Mutex<Option<TcpStream>>>,
    closed: Arc<AtomicBool>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl TcpLink {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            writer: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            reader_thread: None,
        }
    }

    fn set_state(state: &Mutex<LinkState>, delegate: &Arc<dyn LinkDelegate>, new: LinkState) {
        *state.lock().unwrap() = new;
        delegate.state_changed(new);
    }
}

impl KissLink for TcpLink {
    fn open(&mut self, delegate: Arc<dyn LinkDelegate>) -> Result<(), RuntimeError> {
        self.closed.store(false, Ordering::SeqCst);
        let host = self.host.clone();
        let port = self.port;
        let state = self.state.clone();
        let writer = self.writer.clone();
        let closed = self.closed.clone();

        self.reader_thread = Some(thread::spawn(move || {
            while !closed.load(Ordering::SeqCst) {
                Self::set_state(&state, &delegate, LinkState::Connecting);
                match TcpStream::connect((host.as_str(), port)) {
                    Ok(stream) => {
                        debug!("tcp link connected to {host}:{port}");
                        let read_half = match stream.try_clone() {
                            Ok(s) => s,
                            Err(e) => {
                                delegate.error(format!("failed to clone tcp stream: {e}"));
                                thread::sleep(RECONNECT_DELAY);
                                continue;
                            }
                        };
                        *writer.lock().unwrap() = Some(stream);
                        Self::set_state(&state, &delegate, LinkState::Connected);
                        run_reader(read_half, &delegate, &closed);
                        *writer.lock().unwrap() = None;
                        if closed.load(Ordering::SeqCst) {
                            break;
                        }
                        Self::set_state(&state, &delegate, LinkState::Failed);
                    }
                    Err(e) => {
                        warn!("tcp link connect to {host}:{port} failed: {e}");
                        delegate.error(format!("connect failed: {e}"));
                        Self::set_state(&state, &delegate, LinkState::Failed);
                    }
                }
                if !closed.load(Ordering::SeqCst) {
                    thread::sleep(RECONNECT_DELAY);
                }
            }
            Self::set_state(&state, &delegate, LinkState::Disconnected);
        }));
        Ok(())
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(stream) = self.writer.lock().unwrap().as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn send(&mut self, bytes: Vec<u8>, completion: SendCompletion) {
        let mut guard = self.writer.lock().unwrap();
        match guard.as_mut() {
            Some(stream) => {
                let result = stream
                    .write_all(&bytes)
                    .map_err(|e| RuntimeError::SendFailed(e.to_string()));
                completion(result);
            }
            None => completion(Err(RuntimeError::NotConnected)),
        }
    }

    fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }
}

fn run_reader(mut stream: TcpStream, delegate: &Arc<dyn LinkDelegate>, closed: &AtomicBool) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => delegate.did_receive(&buf[..n]),
            Err(e) => {
                delegate.error(format!("read error: {e}"));
                return;
            }
        }
    }
}
