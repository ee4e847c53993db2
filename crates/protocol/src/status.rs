//! USB transfer status and errno mapping
//!
//! The peer expects Linux errno values in the `status` fields of RET_SUBMIT
//! and RET_UNLINK frames and in isochronous packet descriptors. This module
//! carries the errno constants and the mapping from USB-layer outcomes.

/// Linux errno values used on the wire (positive; negate before sending)
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOENT: i32 = 2;
    pub const ENODEV: i32 = 19;
    pub const EPIPE: i32 = 32;
    pub const ETIME: i32 = 62;
    pub const EPROTO: i32 = 71;
    pub const EOVERFLOW: i32 = 75;
    pub const EILSEQ: i32 = 84;
    pub const ECONNRESET: i32 = 104;
    pub const ETIMEDOUT: i32 = 110;
    pub const EREMOTEIO: i32 = 121;
}

/// Outcome of a URB at the USB layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStatus {
    /// Transfer completed
    Ok,
    /// Endpoint stalled
    Stall,
    /// Device did not respond
    DeviceNotResponding,
    /// CRC failure on the bus
    CrcError,
    /// Endpoint kept NAKing
    Nak,
    /// Short transfer where a full one was required
    Underrun,
    /// Device returned more data than the buffer holds
    Overrun,
    /// Device was disconnected mid-transfer
    Disconnected,
    /// Transfer was cancelled by an unlink or session teardown
    Cancelled,
    /// Transfer timed out at the host
    TimedOut,
    /// Anything the lower layer could not classify
    Unknown,
}

impl UsbStatus {
    /// The negative errno carried in reply status fields
    ///
    /// Unknown failures map to `-EPROTO`.
    pub fn to_errno(self) -> i32 {
        match self {
            UsbStatus::Ok => 0,
            UsbStatus::Stall => -errno::EPIPE,
            UsbStatus::DeviceNotResponding => -errno::ETIME,
            UsbStatus::CrcError => -errno::EILSEQ,
            UsbStatus::Nak => -errno::EPROTO,
            UsbStatus::Underrun => -errno::EREMOTEIO,
            UsbStatus::Overrun => -errno::EOVERFLOW,
            UsbStatus::Disconnected => -errno::ENODEV,
            UsbStatus::Cancelled => -errno::ECONNRESET,
            UsbStatus::TimedOut => -errno::ETIMEDOUT,
            UsbStatus::Unknown => -errno::EPROTO,
        }
    }

    /// Whether the transfer carried data back
    pub fn is_ok(self) -> bool {
        matches!(self, UsbStatus::Ok)
    }
}
