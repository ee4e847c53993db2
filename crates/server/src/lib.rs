//! usbip-share server library
//!
//! Shares locally attached USB devices over TCP using the USB/IP protocol.
//! The binary in `main.rs` wires the pieces together; the modules here carry
//! the actual machinery:
//!
//! - [`registry`]: the persistent binding registry and attachment arbiter
//! - [`enumerator`]: snapshots of currently connected devices
//! - [`capture`]: the capture-driver adapter that executes URBs
//! - [`net`]: listener, setup-phase protocol handler, and the attached
//!   session's URB pipeline
//! - [`pcap`]: the optional pcapng capture sink
//! - [`config`] and [`service`]: configuration and process lifecycle

pub mod capture;
pub mod config;
pub mod enumerator;
pub mod net;
pub mod pcap;
pub mod registry;
pub mod service;
