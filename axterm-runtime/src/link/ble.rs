//! BLE `KissLink` (Mobilinkd / Nordic UART service layouts), feature-gated
//! behind `ble`. No direct teacher precedent exists for a BLE transport -
//! `m17app` only ever speaks to soundcards, serial ports and TCP sockets -
//! so this is "enrich from the rest of the pack": the reconnect/backoff shape
//! still follows `m17app::reflector::ReflectorClientTnc`, driven here from a
//! background thread that owns a single-threaded `tokio` runtime for the
//! inherently async `btleplug` API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Manager, Peripheral};
use futures::StreamExt;
use log::{debug, warn};
use uuid::Uuid;

use super::{KissLink, LinkDelegate, LinkState, SendCompletion};
use crate::error::RuntimeError;

/// Nordic UART Service and its RX (write)/TX (notify) characteristics - the
/// layout Mobilinkd TNCs and most BLE KISS bridges expose.
pub const NUS_SERVICE: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
pub const NUS_RX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
pub const NUS_TX_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Conservative default MTU payload - most BLE stacks negotiate at least this
/// much once connected, and writes are chunked to it regardless.
const DEFAULT_MTU: usize = 20;

pub struct BleLink {
    peripheral_name: String,
    state: Arc<Mutex<LinkState>>,
    write_characteristic: Arc<Mutex<Option<(Peripheral, Characteristic)>>>,
    closed: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BleLink {
    pub fn new(peripheral_name: impl Into<String>) -> Self {
        Self {
            peripheral_name: peripheral_name.into(),
            state: Arc::new(Mutex::new(LinkState::Disconnected)),
            write_characteristic: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn set_state(state: &Mutex<LinkState>, delegate: &Arc<dyn LinkDelegate>, new: LinkState) {
        *state.lock().unwrap() = new;
        delegate.state_changed(new);
    }
}

impl KissLink for BleLink {
    fn open(&mut self, delegate: Arc<dyn LinkDelegate>) -> Result<(), RuntimeError> {
        self.closed.store(false, Ordering::SeqCst);
        let name = self.peripheral_name.clone();
        let state = self.state.clone();
        let write_characteristic = self.write_characteristic.clone();
        let closed = self.closed.clone();

        self.worker = Some(thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    delegate.error(format!("failed to start BLE runtime: {e}"));
                    return;
                }
            };
            runtime.block_on(run_connection_loop(
                name,
                state,
                write_characteristic,
                closed,
                delegate,
            ));
        }));
        Ok(())
    }

    fn close(&mut self) -> Result<(), RuntimeError> {
        self.closed.store(true, Ordering::SeqCst);
        *self.write_characteristic.lock().unwrap() = None;
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn send(&mut self, bytes: Vec<u8>, completion: SendCompletion) {
        let guard = self.write_characteristic.lock().unwrap();
        let Some((peripheral, characteristic)) = guard.as_ref().cloned() else {
            completion(Err(RuntimeError::NotConnected));
            return;
        };
        drop(guard);
        thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    completion(Err(RuntimeError::SendFailed(e.to_string())));
                    return;
                }
            };
            let result = runtime.block_on(write_chunked(&peripheral, &characteristic, &bytes));
            completion(result);
        });
    }

    fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }
}

async fn write_chunked(
    peripheral: &Peripheral,
    characteristic: &Characteristic,
    bytes: &[u8],
) -> Result<(), RuntimeError> {
    for chunk in bytes.chunks(DEFAULT_MTU) {
        peripheral
            .write(characteristic, chunk, WriteType::WithoutResponse)
            .await
            .map_err(|e| RuntimeError::SendFailed(e.to_string()))?;
    }
    Ok(())
}

async fn run_connection_loop(
    name: String,
    state: Arc<Mutex<LinkState>>,
    write_characteristic: Arc<Mutex<Option<(Peripheral, Characteristic)>>>,
    closed: Arc<AtomicBool>,
    delegate: Arc<dyn LinkDelegate>,
) {
    let mut backoff = INITIAL_BACKOFF;
    while !closed.load(Ordering::SeqCst) {
        BleLink::set_state(&state, &delegate, LinkState::Connecting);
        match connect_and_run(&name, &state, &write_characteristic, &closed, &delegate).await {
            Ok(()) => {
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                warn!("BLE link to {name} failed: {e}");
                delegate.error(e);
            }
        }
        *write_characteristic.lock().unwrap() = None;
        if closed.load(Ordering::SeqCst) {
            break;
        }
        BleLink::set_state(&state, &delegate, LinkState::Failed);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    BleLink::set_state(&state, &delegate, LinkState::Disconnected);
}

async fn connect_and_run(
    name: &str,
    state: &Arc<Mutex<LinkState>>,
    write_characteristic: &Arc<Mutex<Option<(Peripheral, Characteristic)>>>,
    closed: &AtomicBool,
    delegate: &Arc<dyn LinkDelegate>,
) -> Result<(), String> {
    let manager = Manager::new().await.map_err(|e| e.to_string())?;
    let adapters = manager.adapters().await.map_err(|e| e.to_string())?;
    let adapter = adapters.into_iter().next().ok_or("no BLE adapter found")?;
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| e.to_string())?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let peripherals = adapter.peripherals().await.map_err(|e| e.to_string())?;
    let mut matched = None;
    for peripheral in peripherals {
        if let Ok(Some(props)) = peripheral.properties().await {
            if props.local_name.as_deref() == Some(name) {
                matched = Some(peripheral);
                break;
            }
        }
    }
    let peripheral = matched.ok_or_else(|| format!("peripheral '{name}' not found"))?;

    peripheral.connect().await.map_err(|e| e.to_string())?;
    peripheral
        .discover_services()
        .await
        .map_err(|e| e.to_string())?;

    let characteristics = peripheral.characteristics();
    let rx = characteristics
        .iter()
        .find(|c| c.uuid == NUS_RX_CHARACTERISTIC)
        .cloned()
        .ok_or("peer missing NUS RX characteristic")?;
    let tx = characteristics
        .iter()
        .find(|c| c.uuid == NUS_TX_CHARACTERISTIC)
        .cloned()
        .ok_or("peer missing NUS TX characteristic")?;

    peripheral
        .subscribe(&tx)
        .await
        .map_err(|e| e.to_string())?;

    debug!("BLE link connected to {name}");
    *write_characteristic.lock().unwrap() = Some((peripheral.clone(), rx));
    BleLink::set_state(state, delegate, LinkState::Connected);

    let mut notifications = peripheral.notifications().await.map_err(|e| e.to_string())?;
    while !closed.load(Ordering::SeqCst) {
        match notifications.next().await {
            Some(event) if event.uuid == NUS_TX_CHARACTERISTIC => {
                delegate.did_receive(&event.value);
            }
            Some(_) => {}
            None => break,
        }
    }
    Ok(())
}
