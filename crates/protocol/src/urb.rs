//! URB command and reply headers
//!
//! Once a device is imported, every frame on the connection starts with a
//! 48-byte header: a 20-byte common prefix (`command`, `seqnum`, `devid`,
//! `direction`, `ep`) followed by a 28-byte command-specific tail. OUT
//! submissions append `transfer_buffer_length` payload bytes, and
//! isochronous URBs append one 16-byte packet descriptor per packet.
//!
//! Replies correlate with commands through `seqnum`; the protocol does not
//! require completions to preserve submission order.

use crate::error::{ProtocolError, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

/// Submit a URB
pub const CMD_SUBMIT: u32 = 0x0001;
/// URB completion
pub const RET_SUBMIT: u32 = 0x0002;
/// Cancel an in-flight URB
pub const CMD_UNLINK: u32 = 0x0003;
/// Unlink acknowledgement
pub const RET_UNLINK: u32 = 0x0004;

/// Size of every URB command/reply header
pub const URB_HEADER_SIZE: usize = 48;

/// Transfer direction relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to device
    Out,
    /// Device to host
    In,
}

impl Direction {
    /// Wire representation (0 = OUT, 1 = IN)
    pub fn to_wire(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }

    /// Decode the wire representation
    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Direction::Out),
            1 => Ok(Direction::In),
            other => Err(ProtocolError::InvalidDirection(other)),
        }
    }
}

/// CMD_SUBMIT header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitCmd {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    pub transfer_flags: u32,
    pub transfer_buffer_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub interval: i32,
    /// Setup packet, forwarded verbatim for endpoint 0; all zeros otherwise
    pub setup: [u8; 8],
}

/// CMD_UNLINK header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkCmd {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    /// Seqnum of the URB to cancel
    pub unlink_seqnum: u32,
}

/// A command frame header read from the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbCommand {
    Submit(SubmitCmd),
    Unlink(UnlinkCmd),
}

impl UrbCommand {
    /// Decode a 48-byte command header
    pub fn decode(buf: &[u8; URB_HEADER_SIZE]) -> Result<Self> {
        let mut r = Cursor::new(&buf[..]);
        let command = r.read_u32::<BigEndian>()?;
        let seqnum = r.read_u32::<BigEndian>()?;
        let devid = r.read_u32::<BigEndian>()?;
        let direction = Direction::from_wire(r.read_u32::<BigEndian>()?)?;
        let ep = r.read_u32::<BigEndian>()?;

        match command {
            CMD_SUBMIT => {
                let transfer_flags = r.read_u32::<BigEndian>()?;
                let transfer_buffer_length = r.read_i32::<BigEndian>()?;
                let start_frame = r.read_i32::<BigEndian>()?;
                let number_of_packets = r.read_i32::<BigEndian>()?;
                let interval = r.read_i32::<BigEndian>()?;
                let mut setup = [0u8; 8];
                r.read_exact(&mut setup)?;
                Ok(UrbCommand::Submit(SubmitCmd {
                    seqnum,
                    devid,
                    direction,
                    ep,
                    transfer_flags,
                    transfer_buffer_length,
                    start_frame,
                    number_of_packets,
                    interval,
                    setup,
                }))
            }
            CMD_UNLINK => {
                let unlink_seqnum = r.read_u32::<BigEndian>()?;
                Ok(UrbCommand::Unlink(UnlinkCmd {
                    seqnum,
                    devid,
                    direction,
                    ep,
                    unlink_seqnum,
                }))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }

    /// Encode to a 48-byte command header
    pub fn encode(&self) -> [u8; URB_HEADER_SIZE] {
        let mut buf = [0u8; URB_HEADER_SIZE];
        let mut w = Cursor::new(&mut buf[..]);
        match self {
            UrbCommand::Submit(cmd) => {
                w.write_u32::<BigEndian>(CMD_SUBMIT).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.seqnum).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.devid).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.direction.to_wire())
                    .expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.ep).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.transfer_flags)
                    .expect("fixed buffer");
                w.write_i32::<BigEndian>(cmd.transfer_buffer_length)
                    .expect("fixed buffer");
                w.write_i32::<BigEndian>(cmd.start_frame)
                    .expect("fixed buffer");
                w.write_i32::<BigEndian>(cmd.number_of_packets)
                    .expect("fixed buffer");
                w.write_i32::<BigEndian>(cmd.interval).expect("fixed buffer");
                w.write_all(&cmd.setup).expect("fixed buffer");
            }
            UrbCommand::Unlink(cmd) => {
                w.write_u32::<BigEndian>(CMD_UNLINK).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.seqnum).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.devid).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.direction.to_wire())
                    .expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.ep).expect("fixed buffer");
                w.write_u32::<BigEndian>(cmd.unlink_seqnum)
                    .expect("fixed buffer");
            }
        }
        buf
    }
}

/// RET_SUBMIT header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    /// 0 on success, negative errno on failure
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl SubmitReply {
    /// Encode to a 48-byte reply header (the setup field is unused on return)
    pub fn encode(&self) -> [u8; URB_HEADER_SIZE] {
        let mut buf = [0u8; URB_HEADER_SIZE];
        let mut w = Cursor::new(&mut buf[..]);
        w.write_u32::<BigEndian>(RET_SUBMIT).expect("fixed buffer");
        w.write_u32::<BigEndian>(self.seqnum).expect("fixed buffer");
        w.write_u32::<BigEndian>(self.devid).expect("fixed buffer");
        w.write_u32::<BigEndian>(self.direction.to_wire())
            .expect("fixed buffer");
        w.write_u32::<BigEndian>(self.ep).expect("fixed buffer");
        w.write_i32::<BigEndian>(self.status).expect("fixed buffer");
        w.write_i32::<BigEndian>(self.actual_length)
            .expect("fixed buffer");
        w.write_i32::<BigEndian>(self.start_frame)
            .expect("fixed buffer");
        w.write_i32::<BigEndian>(self.number_of_packets)
            .expect("fixed buffer");
        w.write_i32::<BigEndian>(self.error_count)
            .expect("fixed buffer");
        buf
    }
}

/// RET_UNLINK header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlinkReply {
    pub seqnum: u32,
    pub devid: u32,
    pub direction: Direction,
    pub ep: u32,
    /// `-ECONNRESET` if the target URB was cancelled, 0 otherwise
    pub status: i32,
}

impl UnlinkReply {
    /// Encode to a 48-byte reply header
    pub fn encode(&self) -> [u8; URB_HEADER_SIZE] {
        let mut buf = [0u8; URB_HEADER_SIZE];
        let mut w = Cursor::new(&mut buf[..]);
        w.write_u32::<BigEndian>(RET_UNLINK).expect("fixed buffer");
        w.write_u32::<BigEndian>(self.seqnum).expect("fixed buffer");
        w.write_u32::<BigEndian>(self.devid).expect("fixed buffer");
        w.write_u32::<BigEndian>(self.direction.to_wire())
            .expect("fixed buffer");
        w.write_u32::<BigEndian>(self.ep).expect("fixed buffer");
        w.write_i32::<BigEndian>(self.status).expect("fixed buffer");
        buf
    }
}

/// A reply frame header, as a peer would decode it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrbReply {
    Submit(SubmitReply),
    Unlink(UnlinkReply),
}

impl UrbReply {
    /// Decode a 48-byte reply header
    pub fn decode(buf: &[u8; URB_HEADER_SIZE]) -> Result<Self> {
        let mut r = Cursor::new(&buf[..]);
        let command = r.read_u32::<BigEndian>()?;
        let seqnum = r.read_u32::<BigEndian>()?;
        let devid = r.read_u32::<BigEndian>()?;
        let direction = Direction::from_wire(r.read_u32::<BigEndian>()?)?;
        let ep = r.read_u32::<BigEndian>()?;

        match command {
            RET_SUBMIT => {
                let status = r.read_i32::<BigEndian>()?;
                let actual_length = r.read_i32::<BigEndian>()?;
                let start_frame = r.read_i32::<BigEndian>()?;
                let number_of_packets = r.read_i32::<BigEndian>()?;
                let error_count = r.read_i32::<BigEndian>()?;
                Ok(UrbReply::Submit(SubmitReply {
                    seqnum,
                    devid,
                    direction,
                    ep,
                    status,
                    actual_length,
                    start_frame,
                    number_of_packets,
                    error_count,
                }))
            }
            RET_UNLINK => {
                let status = r.read_i32::<BigEndian>()?;
                Ok(UrbReply::Unlink(UnlinkReply {
                    seqnum,
                    devid,
                    direction,
                    ep,
                    status,
                }))
            }
            other => Err(ProtocolError::UnknownCommand(other)),
        }
    }
}

/// Isochronous packet descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacket {
    /// Size of one descriptor on the wire
    pub const SIZE: usize = 16;

    /// Read one descriptor
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            offset: reader.read_u32::<BigEndian>()?,
            length: reader.read_u32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            status: reader.read_i32::<BigEndian>()?,
        })
    }

    /// Write one descriptor
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)?;
        Ok(())
    }
}

/// Read a descriptor vector of known length
pub fn read_iso_packets<R: Read>(reader: &mut R, count: usize) -> Result<Vec<IsoPacket>> {
    let mut packets = Vec::with_capacity(count);
    for _ in 0..count {
        packets.push(IsoPacket::read_from(reader)?);
    }
    Ok(packets)
}

/// Write a descriptor vector
pub fn write_iso_packets<W: Write>(writer: &mut W, packets: &[IsoPacket]) -> Result<()> {
    for packet in packets {
        packet.write_to(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_submit() -> SubmitCmd {
        SubmitCmd {
            seqnum: 1,
            devid: 0x0003_0004,
            direction: Direction::In,
            ep: 0,
            transfer_flags: 0,
            transfer_buffer_length: 18,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00],
        }
    }

    #[test]
    fn test_submit_roundtrip() {
        let cmd = UrbCommand::Submit(sample_submit());
        let buf = cmd.encode();
        assert_eq!(buf.len(), URB_HEADER_SIZE);
        assert_eq!(UrbCommand::decode(&buf).unwrap(), cmd);
    }

    #[test]
    fn test_submit_layout() {
        let buf = UrbCommand::Submit(sample_submit()).encode();
        assert_eq!(&buf[0..4], &[0, 0, 0, 1]); // CMD_SUBMIT
        assert_eq!(&buf[4..8], &[0, 0, 0, 1]); // seqnum
        assert_eq!(&buf[8..12], &[0, 3, 0, 4]); // devid
        assert_eq!(&buf[12..16], &[0, 0, 0, 1]); // direction IN
        assert_eq!(&buf[16..20], &[0, 0, 0, 0]); // ep
        assert_eq!(&buf[24..28], &[0, 0, 0, 18]); // transfer_buffer_length
        assert_eq!(&buf[40..48], &sample_submit().setup);
    }

    #[test]
    fn test_unlink_roundtrip() {
        let cmd = UrbCommand::Unlink(UnlinkCmd {
            seqnum: 9,
            devid: 0x0003_0004,
            direction: Direction::In,
            ep: 1,
            unlink_seqnum: 7,
        });
        let buf = cmd.encode();
        assert_eq!(UrbCommand::decode(&buf).unwrap(), cmd);
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut buf = [0u8; URB_HEADER_SIZE];
        buf[3] = 0x99;
        assert!(matches!(
            UrbCommand::decode(&buf),
            Err(ProtocolError::UnknownCommand(0x99))
        ));
    }

    #[test]
    fn test_decode_rejects_bad_direction() {
        let mut cmd = sample_submit();
        cmd.direction = Direction::Out;
        let mut buf = UrbCommand::Submit(cmd).encode();
        buf[15] = 2; // direction field low byte
        assert!(matches!(
            UrbCommand::decode(&buf),
            Err(ProtocolError::InvalidDirection(2))
        ));
    }

    #[test]
    fn test_submit_reply_roundtrip() {
        let reply = SubmitReply {
            seqnum: 7,
            devid: 0x0003_0004,
            direction: Direction::In,
            ep: 1,
            status: -32,
            actual_length: 0,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
        };
        let buf = reply.encode();
        assert_eq!(UrbReply::decode(&buf).unwrap(), UrbReply::Submit(reply));
    }

    #[test]
    fn test_unlink_reply_roundtrip() {
        let reply = UnlinkReply {
            seqnum: 10,
            devid: 0x0003_0004,
            direction: Direction::Out,
            ep: 0,
            status: -104,
        };
        let buf = reply.encode();
        assert_eq!(UrbReply::decode(&buf).unwrap(), UrbReply::Unlink(reply));
    }

    #[test]
    fn test_iso_packet_roundtrip() {
        let packets = vec![
            IsoPacket {
                offset: 0,
                length: 1024,
                actual_length: 0,
                status: 0,
            },
            IsoPacket {
                offset: 1024,
                length: 1024,
                actual_length: 512,
                status: -71,
            },
        ];

        let mut buf = Vec::new();
        write_iso_packets(&mut buf, &packets).unwrap();
        assert_eq!(buf.len(), IsoPacket::SIZE * packets.len());

        let decoded = read_iso_packets(&mut std::io::Cursor::new(buf), 2).unwrap();
        assert_eq!(decoded, packets);
    }
}
