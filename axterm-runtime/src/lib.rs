//! The runtime half of AXTerm: everything in [`axterm_core`] is pure protocol
//! logic with no I/O, no threads and no clock. This crate supplies the rest -
//! transports, file I/O, persistence, and the transmission actor that wires
//! them all together - the way `m17app` supplies the runtime half of `m17core`.

pub mod actor;
pub mod bulk_manager;
pub mod error;
pub mod link;
pub mod observers;
pub mod persistence;
pub mod wire_debug;
