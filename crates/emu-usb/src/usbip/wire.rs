//! USB/IP wire structures.
//!
//! Every multi-byte integer on the wire is big-endian; structures encode to
//! and decode from fixed-size byte arrays so the parser can peek and pop
//! whole records off the connection byte queue.

use crate::controller::SetupBytes;

/// `OP_REQ_IMPORT` operation code.
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// `OP_REP_IMPORT` operation code.
pub const OP_REP_IMPORT: u16 = 0x0003;
/// URB submit command.
pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
/// URB unlink command (accepted and ignored).
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
/// URB submit reply.
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;

/// Direction field of a URB: host to device.
pub const DIR_OUT: u32 = 0;
/// Direction field of a URB: device to host.
pub const DIR_IN: u32 = 1;

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Operation request header.
///
/// Layout (8 bytes): `[0..2]` version, `[2..4]` command, `[4..8]` status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpReqHeader {
    pub version: u16,
    pub command: u16,
    pub status: u32,
}

impl OpReqHeader {
    pub const SIZE: usize = 8;

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            version: get_u16(buf, 0),
            command: get_u16(buf, 2),
            status: get_u32(buf, 4),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.command.to_be_bytes());
        buf[4..8].copy_from_slice(&self.status.to_be_bytes());
        buf
    }
}

/// Import request: header plus the 32-byte bus id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReqImport {
    pub header: OpReqHeader,
    pub busid: [u8; 32],
}

impl OpReqImport {
    pub const SIZE: usize = OpReqHeader::SIZE + 32;

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut header = [0u8; OpReqHeader::SIZE];
        header.copy_from_slice(&buf[..OpReqHeader::SIZE]);
        let mut busid = [0u8; 32];
        busid.copy_from_slice(&buf[OpReqHeader::SIZE..]);
        Self {
            header: OpReqHeader::decode(&header),
            busid,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..OpReqHeader::SIZE].copy_from_slice(&self.header.encode());
        buf[OpReqHeader::SIZE..].copy_from_slice(&self.busid);
        buf
    }
}

/// Import reply: status header plus the exported device description.
///
/// Layout (320 bytes): 8-byte header, 256-byte path, 32-byte busid, then
/// busnum/devnum/speed (u32 each), idVendor/idProduct/bcdDevice (u16 each)
/// and six u8 descriptor fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRepImport {
    pub version: u16,
    pub status: u32,
    pub path: [u8; 256],
    pub busid: [u8; 32],
    pub busnum: u32,
    pub devnum: u32,
    pub speed: u32,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    pub num_interfaces: u8,
}

impl OpRepImport {
    pub const SIZE: usize = 320;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&OP_REP_IMPORT.to_be_bytes());
        buf[4..8].copy_from_slice(&self.status.to_be_bytes());
        buf[8..264].copy_from_slice(&self.path);
        buf[264..296].copy_from_slice(&self.busid);
        buf[296..300].copy_from_slice(&self.busnum.to_be_bytes());
        buf[300..304].copy_from_slice(&self.devnum.to_be_bytes());
        buf[304..308].copy_from_slice(&self.speed.to_be_bytes());
        buf[308..310].copy_from_slice(&self.id_vendor.to_be_bytes());
        buf[310..312].copy_from_slice(&self.id_product.to_be_bytes());
        buf[312..314].copy_from_slice(&self.bcd_device.to_be_bytes());
        buf[314] = self.device_class;
        buf[315] = self.device_subclass;
        buf[316] = self.device_protocol;
        buf[317] = self.configuration_value;
        buf[318] = self.num_configurations;
        buf[319] = self.num_interfaces;
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut path = [0u8; 256];
        path.copy_from_slice(&buf[8..264]);
        let mut busid = [0u8; 32];
        busid.copy_from_slice(&buf[264..296]);
        Self {
            version: get_u16(buf, 0),
            status: get_u32(buf, 4),
            path,
            busid,
            busnum: get_u32(buf, 296),
            devnum: get_u32(buf, 300),
            speed: get_u32(buf, 304),
            id_vendor: get_u16(buf, 308),
            id_product: get_u16(buf, 310),
            bcd_device: get_u16(buf, 312),
            device_class: buf[314],
            device_subclass: buf[315],
            device_protocol: buf[316],
            configuration_value: buf[317],
            num_configurations: buf[318],
            num_interfaces: buf[319],
        }
    }
}

impl Default for OpRepImport {
    fn default() -> Self {
        Self {
            version: 0,
            status: 0,
            path: [0; 256],
            busid: [0; 32],
            busnum: 0,
            devnum: 0,
            speed: 0,
            id_vendor: 0,
            id_product: 0,
            bcd_device: 0,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 0,
            num_configurations: 0,
            num_interfaces: 0,
        }
    }
}

/// Common prefix of every URB command and reply.
///
/// Layout (20 bytes): command, seqnum, devid, direction, ep (u32 each).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderBasic {
    pub command: u32,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl HeaderBasic {
    pub const SIZE: usize = 20;

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            command: get_u32(buf, 0),
            seqnum: get_u32(buf, 4),
            devid: get_u32(buf, 8),
            direction: get_u32(buf, 12),
            ep: get_u32(buf, 16),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.command.to_be_bytes());
        buf[4..8].copy_from_slice(&self.seqnum.to_be_bytes());
        buf[8..12].copy_from_slice(&self.devid.to_be_bytes());
        buf[12..16].copy_from_slice(&self.direction.to_be_bytes());
        buf[16..20].copy_from_slice(&self.ep.to_be_bytes());
        buf
    }
}

/// A submitted URB.
///
/// Layout (48 bytes): [`HeaderBasic`], then transfer_flags,
/// transfer_buffer_length, start_frame, number_of_packets, interval
/// (u32 each), then the 8 raw setup bytes (not byte-swapped).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: HeaderBasic,
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub interval: u32,
    pub setup: SetupBytes,
}

impl CmdSubmit {
    pub const SIZE: usize = 48;

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut header = [0u8; HeaderBasic::SIZE];
        header.copy_from_slice(&buf[..HeaderBasic::SIZE]);
        let mut setup = [0u8; 8];
        setup.copy_from_slice(&buf[40..48]);
        Self {
            header: HeaderBasic::decode(&header),
            transfer_flags: get_u32(buf, 20),
            transfer_buffer_length: get_u32(buf, 24),
            start_frame: get_u32(buf, 28),
            number_of_packets: get_u32(buf, 32),
            interval: get_u32(buf, 36),
            setup: SetupBytes::from_bytes(&setup),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..HeaderBasic::SIZE].copy_from_slice(&self.header.encode());
        buf[20..24].copy_from_slice(&self.transfer_flags.to_be_bytes());
        buf[24..28].copy_from_slice(&self.transfer_buffer_length.to_be_bytes());
        buf[28..32].copy_from_slice(&self.start_frame.to_be_bytes());
        buf[32..36].copy_from_slice(&self.number_of_packets.to_be_bytes());
        buf[36..40].copy_from_slice(&self.interval.to_be_bytes());
        buf[40..48].copy_from_slice(&self.setup.to_bytes());
        buf
    }

    /// Bytes following the 48-byte record on the wire: OUT payload plus the
    /// isochronous descriptor array.
    pub fn trailing_len(&self) -> usize {
        let data = if self.header.direction == DIR_OUT {
            self.transfer_buffer_length as usize
        } else {
            0
        };
        data + self.number_of_packets as usize * IsocDesc::SIZE
    }
}

/// Reply to a submitted URB.
///
/// Layout (48 bytes): [`HeaderBasic`], then status, actual_length,
/// start_frame, number_of_packets, error_count (u32 each), 8 setup bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: HeaderBasic,
    pub status: u32,
    pub actual_length: u32,
    pub start_frame: u32,
    pub number_of_packets: u32,
    pub error_count: u32,
    pub setup: SetupBytes,
}

impl RetSubmit {
    pub const SIZE: usize = 48;

    /// Reply skeleton for `request`, per the protocol: echo the sequence
    /// number, zero the routing fields, mirror the packet count.
    pub fn for_request(request: &CmdSubmit) -> Self {
        Self {
            header: HeaderBasic {
                command: USBIP_RET_SUBMIT,
                seqnum: request.header.seqnum,
                devid: 0,
                direction: 0,
                ep: 0,
            },
            status: 0,
            actual_length: 0,
            start_frame: request.header.seqnum,
            number_of_packets: request.number_of_packets,
            error_count: 0,
            setup: SetupBytes::default(),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..HeaderBasic::SIZE].copy_from_slice(&self.header.encode());
        buf[20..24].copy_from_slice(&self.status.to_be_bytes());
        buf[24..28].copy_from_slice(&self.actual_length.to_be_bytes());
        buf[28..32].copy_from_slice(&self.start_frame.to_be_bytes());
        buf[32..36].copy_from_slice(&self.number_of_packets.to_be_bytes());
        buf[36..40].copy_from_slice(&self.error_count.to_be_bytes());
        buf[40..48].copy_from_slice(&self.setup.to_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut header = [0u8; HeaderBasic::SIZE];
        header.copy_from_slice(&buf[..HeaderBasic::SIZE]);
        let mut setup = [0u8; 8];
        setup.copy_from_slice(&buf[40..48]);
        Self {
            header: HeaderBasic::decode(&header),
            status: get_u32(buf, 20),
            actual_length: get_u32(buf, 24),
            start_frame: get_u32(buf, 28),
            number_of_packets: get_u32(buf, 32),
            error_count: get_u32(buf, 36),
            setup: SetupBytes::from_bytes(&setup),
        }
    }
}

/// One isochronous packet descriptor.
///
/// Layout (16 bytes): offset, length, actual_length, status (u32 each).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsocDesc {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: u32,
}

impl IsocDesc {
    pub const SIZE: usize = 16;

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            offset: get_u32(buf, 0),
            length: get_u32(buf, 4),
            actual_length: get_u32(buf, 8),
            status: get_u32(buf, 12),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&self.offset.to_be_bytes());
        buf[4..8].copy_from_slice(&self.length.to_be_bytes());
        buf[8..12].copy_from_slice(&self.actual_length.to_be_bytes());
        buf[12..16].copy_from_slice(&self.status.to_be_bytes());
        buf
    }
}

/// Decode a packed isochronous descriptor array.
pub fn decode_isoc_array(buf: &[u8], count: usize) -> Vec<IsocDesc> {
    let mut descs = Vec::with_capacity(count);
    for i in 0..count {
        let at = i * IsocDesc::SIZE;
        let Some(chunk) = buf.get(at..at + IsocDesc::SIZE) else {
            break;
        };
        let mut raw = [0u8; IsocDesc::SIZE];
        raw.copy_from_slice(chunk);
        descs.push(IsocDesc::decode(&raw));
    }
    descs
}

/// Distribute `transferred` bytes over the descriptor array in order:
/// `actual_length = min(remaining, length)` per entry.
pub fn fill_isoc_actual(descs: &mut [IsocDesc], transferred: usize) {
    let mut remaining = transferred as u32;
    for desc in descs.iter_mut() {
        desc.status = 0;
        desc.actual_length = remaining.min(desc.length);
        remaining -= desc.actual_length;
    }
}
