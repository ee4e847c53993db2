//! USB/IP wire protocol for usbip-share
//!
//! This crate defines the on-the-wire representation of the USB/IP protocol
//! (version 0x0111) spoken between the server and a remote `vhci-hcd` peer:
//! the setup-phase operation frames (device list, import), the fixed-size
//! device record, and the 48-byte URB command/reply headers with their
//! isochronous descriptor vectors.
//!
//! All integers are network byte order. Encoding and decoding run over
//! `std::io::{Read, Write}` so the same codec serves sockets, cursors, and
//! test buffers.
//!
//! # Example
//!
//! ```
//! use protocol::{BusId, OpHeader, op};
//!
//! let bus_id: BusId = "3-4".parse().unwrap();
//! assert_eq!(bus_id.to_string(), "3-4");
//!
//! let mut frame = Vec::new();
//! OpHeader::request(op::OP_IMPORT).write_to(&mut frame).unwrap();
//! frame.extend_from_slice(&bus_id.to_field());
//! assert_eq!(frame.len(), OpHeader::SIZE + BusId::FIELD_LEN);
//! ```

pub mod busid;
pub mod error;
pub mod op;
pub mod status;
pub mod types;
pub mod urb;

pub use busid::{BusId, DeviceId};
pub use error::{ProtocolError, Result};
pub use op::{OpHeader, USBIP_VERSION};
pub use status::{UsbStatus, errno};
pub use types::{ExportedDevice, InterfaceDesc, Speed};
pub use urb::{
    Direction, IsoPacket, SubmitCmd, SubmitReply, UnlinkCmd, UnlinkReply, UrbCommand, UrbReply,
};
