use std::fmt::Debug;
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use crate::checksum;
use crate::error::DccpError;
use crate::seq::{SeqNum, SequenceField};

bitflags! {
    #[derive(PartialEq, Eq, Copy, Clone, Debug)]
    struct TypeByte: u8 {
        const MASK_TYPE    = 0b0001_1110;
        const EXTENDED_SEQ = 0b0000_0001;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    Data = 2,
    Ack = 3,
    DataAck = 4,
    CloseReq = 5,
    Close = 6,
    Reset = 7,
    Move = 8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ResetReason {
    Unspecified = 0,
    Closed = 1,
    Aborted = 2,
    NoConnection = 3,
    PacketError = 4,
    OptionError = 5,
    MandatoryError = 6,
    ConnectionRefused = 7,
    BadServiceCode = 8,
    TooBusy = 9,
    BadInitCookie = 10,
    AggressionPenalty = 11,
    #[num_enum(catch_all)]
    Other(u8),
}

/// The packet type together with its type-specific extension header
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SegmentKind {
    Request { service_code: u32 },
    Response { ack: SeqNum, service_code: u32 },
    Data,
    Ack { ack: SequenceField },
    DataAck { ack: SequenceField },
    CloseReq,
    Close,
    Reset { ack: SeqNum, reason: ResetReason, data: [u8; 3] },
    Move,
}

impl SegmentKind {
    pub fn packet_type(&self) -> PacketType {
        match self {
            SegmentKind::Request { .. } => PacketType::Request,
            SegmentKind::Response { .. } => PacketType::Response,
            SegmentKind::Data => PacketType::Data,
            SegmentKind::Ack { .. } => PacketType::Ack,
            SegmentKind::DataAck { .. } => PacketType::DataAck,
            SegmentKind::CloseReq => PacketType::CloseReq,
            SegmentKind::Close => PacketType::Close,
            SegmentKind::Reset { .. } => PacketType::Reset,
            SegmentKind::Move => PacketType::Move,
        }
    }

    /// the acknowledgement number carried in the extension header, if any
    pub fn ack(&self) -> Option<SequenceField> {
        match *self {
            SegmentKind::Response { ack, .. } => Some(SequenceField::Long(ack)),
            SegmentKind::Ack { ack } | SegmentKind::DataAck { ack } => Some(ack),
            SegmentKind::Reset { ack, .. } => Some(SequenceField::Long(ack)),
            _ => None,
        }
    }

    fn extension_len(&self, short: bool) -> usize {
        let ack_len = if short { 4 } else { 8 };
        match self {
            SegmentKind::Request { .. } => 4,
            SegmentKind::Response { .. } => 8 + 4,
            SegmentKind::Ack { .. } | SegmentKind::DataAck { .. } => ack_len,
            SegmentKind::Reset { .. } => 8 + 4,
            SegmentKind::Data | SegmentKind::CloseReq | SegmentKind::Close | SegmentKind::Move => 0,
        }
    }

    fn requires_long_sequence(&self) -> bool {
        matches!(self, SegmentKind::Request { .. } | SegmentKind::Response { .. } | SegmentKind::Reset { .. })
    }
}

/// A decoded DCCP segment. The checksum and data offset are not stored: they are derived when
///  encoding and verified when decoding.
///
/// ```ascii
///  0: source port (u16)
///  2: destination port (u16)
///  4: data offset in 32-bit words (u8)
///  5: CCVal (high nibble) | checksum coverage (low nibble)
///  6: checksum (u16)
///  8: reserved (3 bits) | type (4 bits) | X (1 bit)
///  X=1:  9: reserved (u8), 10: sequence number (u48)  -> 16 bytes
///  X=0:  9: sequence number (u24)                     -> 12 bytes
///  *: type-specific extension header
///  *: options, padded to a word boundary
///  *: payload
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub source_port: u16,
    pub dest_port: u16,
    pub ccval: u8,
    pub checksum_coverage: u8,
    pub sequence: SequenceField,
    pub kind: SegmentKind,
    pub options: Bytes,
    pub payload: Bytes,
}

impl Segment {
    pub const MIN_HEADER_LEN: usize = 12;
    const GENERIC_LEN_LONG: usize = 16;
    const GENERIC_LEN_SHORT: usize = 12;

    pub fn packet_type(&self) -> PacketType {
        self.kind.packet_type()
    }

    /// generic header plus extension header, without options
    pub fn fixed_header_len(kind: &SegmentKind, short: bool) -> usize {
        let generic = if short { Self::GENERIC_LEN_SHORT } else { Self::GENERIC_LEN_LONG };
        generic + kind.extension_len(short)
    }

    pub fn encode(&self) -> Result<Bytes, DccpError> {
        let short = self.sequence.is_short();
        if short && self.kind.requires_long_sequence() {
            return Err(DccpError::Malformed("packet type requires a long sequence number"));
        }
        if self.checksum_coverage > 0x0f || self.ccval > 0x0f {
            return Err(DccpError::InvalidArgument("CCVal and checksum coverage are 4 bit values"));
        }

        let padded_options_len = self.options.len().next_multiple_of(4);
        let header_len = Self::fixed_header_len(&self.kind, short) + padded_options_len;
        let data_offset = header_len / 4;
        if data_offset > u8::MAX as usize {
            return Err(DccpError::InvalidArgument("header exceeds the maximum data offset"));
        }

        let mut buf = BytesMut::with_capacity(header_len + self.payload.len());
        buf.put_u16(self.source_port);
        buf.put_u16(self.dest_port);
        buf.put_u8(data_offset as u8);
        buf.put_u8((self.ccval << 4) | self.checksum_coverage);
        buf.put_u16(0); // checksum placeholder

        let packet_type: u8 = self.packet_type().into();
        let mut type_byte = TypeByte::from_bits_retain(packet_type << 1) & TypeByte::MASK_TYPE;
        if !short {
            type_byte |= TypeByte::EXTENDED_SEQ;
        }
        buf.put_u8(type_byte.bits());
        match self.sequence {
            SequenceField::Long(seq) => {
                buf.put_u8(0);
                put_u48(&mut buf, seq);
            }
            SequenceField::Short(raw) => put_u24(&mut buf, raw),
        }

        match self.kind {
            SegmentKind::Request { service_code } => buf.put_u32(service_code),
            SegmentKind::Response { ack, service_code } => {
                put_long_ack(&mut buf, ack);
                buf.put_u32(service_code);
            }
            SegmentKind::Ack { ack } | SegmentKind::DataAck { ack } => {
                match ack {
                    SequenceField::Long(ack) if !short => put_long_ack(&mut buf, ack),
                    SequenceField::Short(raw) if short => {
                        buf.put_u8(0);
                        put_u24(&mut buf, raw);
                    }
                    _ => return Err(DccpError::Malformed("ack number mode differs from sequence number mode")),
                }
            }
            SegmentKind::Reset { ack, reason, data } => {
                put_long_ack(&mut buf, ack);
                buf.put_u8(reason.into());
                buf.put_slice(&data);
            }
            SegmentKind::Data | SegmentKind::CloseReq | SegmentKind::Close | SegmentKind::Move => {}
        }

        buf.put_slice(&self.options);
        buf.put_bytes(0, padded_options_len - self.options.len());
        debug_assert_eq!(buf.len(), header_len);

        buf.put_slice(&self.payload);

        let covered = checksum::coverage_len(self.checksum_coverage, header_len, buf.len());
        let checksum = checksum::internet_checksum(&buf[..covered]);
        buf[6..8].copy_from_slice(&checksum.to_be_bytes());

        Ok(buf.freeze())
    }

    pub fn decode(raw: &[u8]) -> Result<Segment, DccpError> {
        if raw.len() < Self::MIN_HEADER_LEN {
            return Err(DccpError::Malformed("shorter than the minimal header"));
        }

        let header_len = raw[4] as usize * 4;
        if header_len < Self::MIN_HEADER_LEN || header_len > raw.len() {
            return Err(DccpError::Malformed("inconsistent data offset"));
        }

        let checksum_coverage = raw[5] & 0x0f;
        let covered = checksum::coverage_len(checksum_coverage, header_len, raw.len());
        if !checksum::verify(&raw[..covered]) {
            return Err(DccpError::ChecksumMismatch);
        }

        let mut buf = &raw[..header_len];
        let source_port = buf.try_get_u16()?;
        let dest_port = buf.try_get_u16()?;
        let _data_offset = buf.try_get_u8()?;
        let ccval = buf.try_get_u8()? >> 4;
        let _checksum = buf.try_get_u16()?;

        let type_byte = TypeByte::from_bits_retain(buf.try_get_u8()?);
        let packet_type = PacketType::try_from((type_byte & TypeByte::MASK_TYPE).bits() >> 1)
            .map_err(|_| DccpError::Malformed("unknown packet type"))?;

        let short = !type_byte.contains(TypeByte::EXTENDED_SEQ);
        let sequence = if short {
            SequenceField::Short(try_get_u24(&mut buf)?)
        }
        else {
            let _reserved = buf.try_get_u8()?;
            SequenceField::Long(try_get_u48(&mut buf)?)
        };

        let kind = match packet_type {
            PacketType::Request => SegmentKind::Request { service_code: buf.try_get_u32()? },
            PacketType::Response => SegmentKind::Response {
                ack: try_get_long_ack(&mut buf)?,
                service_code: buf.try_get_u32()?,
            },
            PacketType::Data => SegmentKind::Data,
            PacketType::Ack => SegmentKind::Ack { ack: try_get_ack(&mut buf, short)? },
            PacketType::DataAck => SegmentKind::DataAck { ack: try_get_ack(&mut buf, short)? },
            PacketType::CloseReq => SegmentKind::CloseReq,
            PacketType::Close => SegmentKind::Close,
            PacketType::Reset => {
                let ack = try_get_long_ack(&mut buf)?;
                let reason = ResetReason::from(buf.try_get_u8()?);
                let mut data = [0u8; 3];
                buf.try_copy_to_slice(&mut data)?;
                SegmentKind::Reset { ack, reason, data }
            }
            PacketType::Move => SegmentKind::Move,
        };

        if short && kind.requires_long_sequence() {
            return Err(DccpError::Malformed("packet type requires a long sequence number"));
        }

        Ok(Segment {
            source_port,
            dest_port,
            ccval,
            checksum_coverage,
            sequence,
            kind,
            options: Bytes::copy_from_slice(buf),
            payload: Bytes::copy_from_slice(&raw[header_len..]),
        })
    }
}

fn put_u48(buf: &mut impl BufMut, value: SeqNum) {
    buf.put_u16((value.to_raw() >> 32) as u16);
    buf.put_u32(value.to_raw() as u32);
}

fn put_u24(buf: &mut impl BufMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u16(value as u16);
}

fn put_long_ack(buf: &mut impl BufMut, ack: SeqNum) {
    buf.put_u16(0);
    put_u48(buf, ack);
}

fn try_get_u48(buf: &mut impl Buf) -> Result<SeqNum, DccpError> {
    let high = buf.try_get_u16()? as u64;
    let low = buf.try_get_u32()? as u64;
    Ok(SeqNum::from_raw((high << 32) | low))
}

fn try_get_u24(buf: &mut impl Buf) -> Result<u32, DccpError> {
    let high = buf.try_get_u8()? as u32;
    let low = buf.try_get_u16()? as u32;
    Ok((high << 16) | low)
}

fn try_get_long_ack(buf: &mut impl Buf) -> Result<SeqNum, DccpError> {
    let _reserved = buf.try_get_u16()?;
    try_get_u48(buf)
}

fn try_get_ack(buf: &mut impl Buf, short: bool) -> Result<SequenceField, DccpError> {
    if short {
        let _reserved = buf.try_get_u8()?;
        Ok(SequenceField::Short(try_get_u24(buf)?))
    }
    else {
        Ok(SequenceField::Long(try_get_long_ack(buf)?))
    }
}
