//! Serial `KissLink`, built on the `serialport` crate the teacher already
//! depends on for PTT control - here used for the actual KISS byte stream
//! rather than toggling RTS/DTR.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use serialport::SerialPort;

use super::{KissLink, LinkDelegate, LinkState, SendCompletion};
use crate::error::RuntimeError;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const READ_BUF_SIZE: usize = 4096;

pub fn available_ports() -> Result<Vec<String>, RuntimeError> {
    Ok(serialport::available_ports()?
        .into_iter()
        .map(|p| p.port_name)
        .collect())
}

pub struct SerialLink {
    port_name: String,
    baud_rate: u32,
    state: Arc<Mutex<LinkState>>,
    port: Arc<Mutex<Option<Box<dyn SerialPort>>>>,
    closed: Arc<AtomicBool>,
    reader_thread: Option<thread::JoinHandle<()>>,
}

impl SerialLink {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            port: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            reader_thread: None,
        }
    }

    fn set_state(state: &Mutex<LinkState>, delegate: &Arc<dyn LinkDelegate>, new: LinkState) {
        *state.lock().unwrap() = new;
        delegate.state_changed(new);
    }
}

impl KissLink for SerialLink {
    fn open(&mut self, delegate: Arc<dyn LinkDelegate>) -> Result<(), RuntimeError> {
        self.closed.store(false, Ordering::SeqCst);
        let port_name = self.port_name.clone();
        let baud_rate = self.baud_rate;
        let state = self.state.clone();
        let port = self.port.clone();
        let closed = self.closed.clone();

        self.reader_thread = Some(thread::spawn(move || {
            while !closed.load(Ordering::SeqCst) {
                Self::set_state(&state, &delegate, LinkState::Connecting);
                match serialport::new(&port_name, baud_rate)
                    .timeout(READ_TIMEOUT)
                    .open()
                {
                    Ok(opened) => {
                        debug!("serial link opened {port_name} at {baud_rate} baud");
                        let read_half = match opened.try_clone() {
                            Ok(clone) => clone,
                            Err(e) => {
                                delegate.error(format!("failed to clone serial port: {e}"));
                                thread::sleep(RECONNECT_DELAY);
                                continue;
                            }
                        };
                        *port.lock().unwrap() = Some(opened);
                        Self::set_state(&state, &delegate, LinkState::Connected);
                        run_reader(read_half, &delegate, &closed);
                        *port.lock().unwrap() = None;
                        if closed.load(Ordering::SeqCst) {
                            break;
                        }
                        Self::set_state(&state, &delegate, LinkState::Failed);
                    }
                    Err(e) => {
                        warn!("failed to open serial port {port_name}: {e}");
                        delegate.error(format!("open failed: {e}"));
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
        *self.port.lock().unwrap() = None;
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn send(&mut self, bytes: Vec<u8>, completion: SendCompletion) {
        let mut guard = self.port.lock().unwrap();
        match guard.as_mut() {
            Some(port) => {
                let result = port
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

fn run_reader(mut port: Box<dyn SerialPort>, delegate: &Arc<dyn LinkDelegate>, closed: &AtomicBool) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        if closed.load(Ordering::SeqCst) {
            return;
        }
        match port.read(&mut buf) {
            Ok(0) => continue,
            Ok(n) => delegate.did_receive(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
            Err(e) => {
                delegate.error(format!("read error: {e}"));
                return;
            }
        }
    }
}
