//! `KissLink`: the transport abstraction the transmission actor drives.
//!
//! Grounded on `Tnc` (`Read + Write + try_clone`) from the teacher crate, but
//! exposed as async-style callbacks instead of blocking I/O, since a BLE link's
//! writes are inherently chunked by MTU and cannot be modelled as a plain
//! `Write` impl the way a `TcpStream` can.

use std::sync::Arc;

use crate::error::RuntimeError;

pub mod loopback;
pub mod serial;
pub mod tcp;

#[cfg(feature = "ble")]
pub mod ble;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Callbacks delivered on a single serialized context (the link's own reader
/// thread) - never called concurrently with itself.
pub trait LinkDelegate: Send + Sync {
    fn did_receive(&self, bytes: &[u8]);
    fn state_changed(&self, state: LinkState);
    fn error(&self, message: String);
}

pub type SendCompletion = Box<dyn FnOnce(Result<(), RuntimeError>) + Send>;

/// A transport carrying KISS-framed bytes between the transmission actor and
/// a TNC. Implementations required by the runtime: TCP, serial, BLE (feature
/// `ble`) and a loopback link used by tests.
pub trait KissLink: Send {
    fn open(&mut self, delegate: Arc<dyn LinkDelegate>) -> Result<(), RuntimeError>;
    fn close(&mut self) -> Result<(), RuntimeError>;
    fn send(&mut self, bytes: Vec<u8>, completion: SendCompletion);
    fn state(&self) -> LinkState;
}

/// Parameters for the short KISS parameter sequence sent at link-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TncInitConfig {
    pub full_duplex: u8,
    pub persistence: u8,
    pub slot_time: u8,
    pub tx_delay: u8,
}

impl Default for TncInitConfig {
    fn default() -> Self {
        Self {
            full_duplex: 1,
            persistence: 255,
            slot_time: 0,
            tx_delay: 30,
        }
    }
}

/// Build the fire-and-forget TNC init sequence: a handful of KISS parameter
/// frames setting duplex/persistence/slot/TXDelay on the configured channel.
/// Failures to send these are logged by the caller, never surfaced as an open
/// failure.
pub fn tnc_init_frames(channel: u8, config: TncInitConfig) -> Vec<Vec<u8>> {
    use axterm_core::kiss::{encode_param, KissCommand};
    vec![
        encode_param(channel, KissCommand::TxDelay, config.tx_delay),
        encode_param(channel, KissCommand::P, config.persistence),
        encode_param(channel, KissCommand::SlotTime, config.slot_time),
        encode_param(channel, KissCommand::FullDuplex, config.full_duplex),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_sequence_has_one_frame_per_parameter() {
        let frames = tnc_init_frames(0, TncInitConfig::default());
        assert_eq!(frames.len(), 4);
        for frame in &frames {
            assert_eq!(frame[0], 0xC0);
            assert_eq!(*frame.last().unwrap(), 0xC0);
        }
    }
}
