//! DCCP options: a TLV list following the extension header.
//!
//! Option numbers below 32 are single bytes without length. Numbers from 32 on are followed by
//!  a length byte that counts the type and length bytes themselves. Numbers from 128 on belong
//!  to the congestion control algorithm and are not interpreted here.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::error::DccpError;

pub const PADDING: u8 = 0;
pub const DATA_DISCARD: u8 = 1;
pub const SLOW_RECEIVER: u8 = 2;
pub const BUFFER_CLOSED: u8 = 3;
pub const CHANGE_L: u8 = 32;
pub const CONFIRM_L: u8 = 33;
pub const CHANGE_R: u8 = 34;
pub const CONFIRM_R: u8 = 35;
pub const ACK_VECTOR_0: u8 = 38;
pub const ACK_VECTOR_1: u8 = 39;
pub const RECEIVE_BUFFER_DROPS: u8 = 40;
pub const TIMESTAMP: u8 = 41;
pub const TIMESTAMP_ECHO: u8 = 42;
pub const ELAPSED_TIME: u8 = 43;
pub const FIRST_CCID_SPECIFIC: u8 = 128;

const FIRST_WITH_LENGTH: u8 = 32;

/// An upper bound for the option block of a single segment, leaving room for the largest
///  extension header within the 8-bit data offset
pub const MAX_OPTIONS_LEN: usize = 255 * 4 - 28;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NegotiationKind {
    ChangeL,
    ConfirmL,
    ChangeR,
    ConfirmR,
}

impl NegotiationKind {
    fn from_option_type(option_type: u8) -> Option<NegotiationKind> {
        match option_type {
            CHANGE_L => Some(NegotiationKind::ChangeL),
            CONFIRM_L => Some(NegotiationKind::ConfirmL),
            CHANGE_R => Some(NegotiationKind::ChangeR),
            CONFIRM_R => Some(NegotiationKind::ConfirmR),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FeatureOption {
    pub kind: NegotiationKind,
    pub feature: u8,
    pub values: Bytes,
}

/// The result of a single pass over an option block
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParsedOptions {
    pub data_discard: bool,
    pub slow_receiver: bool,
    pub buffer_closed: bool,
    pub features: Vec<FeatureOption>,
    pub timestamp: Option<[u8; 4]>,
    pub ack_vector: Option<Bytes>,
    pub receive_buffer_drops: Option<Bytes>,
}

pub fn parse(block: &Bytes) -> Result<ParsedOptions, DccpError> {
    let mut result = ParsedOptions::default();

    let mut offset = 0;
    while offset < block.len() {
        let option_type = block[offset];
        if option_type < FIRST_WITH_LENGTH {
            match option_type {
                DATA_DISCARD => result.data_discard = true,
                SLOW_RECEIVER => result.slow_receiver = true,
                BUFFER_CLOSED => result.buffer_closed = true,
                _ => {}
            }
            offset += 1;
            continue;
        }

        let len = *block.get(offset + 1)
            .ok_or(DccpError::Malformed("option length missing"))? as usize;
        let min_len = if option_type < FIRST_CCID_SPECIFIC { 3 } else { 2 };
        if len < min_len || offset + len > block.len() {
            return Err(DccpError::Malformed("inconsistent option length"));
        }
        let value = block.slice(offset + 2 .. offset + len);

        if let Some(kind) = NegotiationKind::from_option_type(option_type) {
            result.features.push(FeatureOption {
                kind,
                feature: value[0],
                values: value.slice(1..),
            });
        }
        else {
            match option_type {
                TIMESTAMP => {
                    let timestamp: [u8; 4] = value.as_ref().try_into()
                        .map_err(|_| DccpError::Malformed("timestamp length"))?;
                    result.timestamp = Some(timestamp);
                }
                ACK_VECTOR_0 | ACK_VECTOR_1 => result.ack_vector = Some(value),
                RECEIVE_BUFFER_DROPS => result.receive_buffer_drops = Some(value),
                // read by the congestion control from the raw block
                TIMESTAMP_ECHO | ELAPSED_TIME => {}
                t if t >= FIRST_CCID_SPECIFIC => {}
                t => trace!("skipping unknown option {}", t),
            }
        }
        offset += len;
    }

    Ok(result)
}

/// Options waiting to go out with the next segment.
///
/// One-shot options (confirms, echoes, ...) are sent once. Feature changes initiated by this
///  endpoint are repeated on every segment until the peer confirms them.
#[derive(Debug, Default)]
pub struct PendingOptions {
    options: BytesMut,
    features: Vec<PendingChange>,
}

#[derive(Debug)]
struct PendingChange {
    change_type: u8,
    feature: u8,
    values: Vec<u8>,
}

impl PendingOptions {
    pub fn add_option(&mut self, option_type: u8, value: &[u8]) -> Result<(), DccpError> {
        if option_type < FIRST_WITH_LENGTH {
            self.check_space(1)?;
            self.options.put_u8(option_type);
            return Ok(());
        }
        if value.len() > u8::MAX as usize - 2 {
            return Err(DccpError::InvalidArgument("option value too long"));
        }
        self.check_space(value.len() + 2)?;
        self.options.put_u8(option_type);
        self.options.put_u8(value.len() as u8 + 2);
        self.options.put_slice(value);
        Ok(())
    }

    /// An empty `value` is the 'empty Confirm' that rejects a feature
    pub fn add_confirm(&mut self, confirm_type: u8, feature: u8, value: &[u8]) -> Result<(), DccpError> {
        let mut buf = Vec::with_capacity(value.len() + 1);
        buf.push(feature);
        buf.extend_from_slice(value);
        self.add_option(confirm_type, &buf)
    }

    /// Replaces a pending change for the same option type and feature
    pub fn add_feature(&mut self, change_type: u8, feature: u8, values: &[u8]) -> Result<(), DccpError> {
        if values.len() > u8::MAX as usize - 3 {
            return Err(DccpError::InvalidArgument("feature value too long"));
        }
        self.remove_feature(change_type, feature);
        self.check_space(values.len() + 3)?;
        self.features.push(PendingChange { change_type, feature, values: values.to_vec() });
        Ok(())
    }

    pub fn remove_feature(&mut self, change_type: u8, feature: u8) -> bool {
        let len_before = self.features.len();
        self.features.retain(|f| f.change_type != change_type || f.feature != feature);
        self.features.len() != len_before
    }

    pub fn has_feature(&self, change_type: u8, feature: u8) -> bool {
        self.features.iter().any(|f| f.change_type == change_type && f.feature == feature)
    }

    pub fn len(&self) -> usize {
        self.options.len() + self.features.iter().map(|f| f.values.len() + 3).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Assembles the option block for one segment: one-shot options followed by all pending
    ///  feature changes, padded with zeros to a word boundary. Nothing is consumed; call
    ///  [`PendingOptions::clear_one_shot`] once the segment is out.
    pub fn block(&self) -> Bytes {
        let mut block = BytesMut::with_capacity(self.len() + 3);
        block.put_slice(&self.options);
        for f in &self.features {
            block.put_u8(f.change_type);
            block.put_u8(f.values.len() as u8 + 3);
            block.put_u8(f.feature);
            block.put_slice(&f.values);
        }
        let padding = block.len().next_multiple_of(4) - block.len();
        block.put_bytes(PADDING, padding);
        block.freeze()
    }

    /// Like [`PendingOptions::block`], but consumes the one-shot options
    pub fn take_block(&mut self) -> Bytes {
        let block = self.block();
        self.clear_one_shot();
        block
    }

    pub fn one_shot_len(&self) -> usize {
        self.options.len()
    }

    /// Drops one-shot options added after `len` bytes of them were present
    pub fn truncate_one_shot(&mut self, len: usize) {
        self.options.truncate(len);
    }

    pub fn clear_one_shot(&mut self) {
        self.options.clear();
    }

    fn check_space(&self, additional: usize) -> Result<(), DccpError> {
        if self.len() + additional > MAX_OPTIONS_LEN {
            return Err(DccpError::ResourceExhausted("option space"));
        }
        Ok(())
    }
}
