//! Common utilities for usbip-share
//!
//! This crate provides the pieces shared between the server's async side and
//! its blocking USB workers: error handling, logging setup, the URB dispatch
//! types, and the async/blocking channel bridge that carries URBs to
//! per-endpoint worker threads.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    EndpointSender, EndpointWorker, TransferKind, UrbCompletion, UrbDispatch, endpoint_queue,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
