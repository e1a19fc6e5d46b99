use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, Sub};
use tracing::trace;
use crate::error::DccpError;

/// A DCCP sequence (or acknowledgement) number. All arithmetic is modulo 2^48, and ordering
///  is only defined within a half window of 2^47 - see [`seq_gt`].
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct SeqNum(u64);

impl Debug for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SeqNum {
    pub const MASK: u64 = (1 << 48) - 1;
    const HALF_WINDOW: u64 = 1 << 47;

    pub const SHORT_MASK: u64 = (1 << 24) - 1;

    pub fn from_raw(raw: u64) -> SeqNum {
        SeqNum(raw & Self::MASK)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// number of steps from `self` forward to `other`, in `[0, 2^48)`
    pub fn distance_to(&self, other: SeqNum) -> u64 {
        other.0.wrapping_sub(self.0) & Self::MASK
    }

    /// the low 24 bits, i.e. the short wire form
    pub fn short_encode(&self) -> u32 {
        (self.0 & Self::SHORT_MASK) as u32
    }
}

impl Add<u64> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u64) -> SeqNum {
        SeqNum::from_raw(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: u64) -> SeqNum {
        SeqNum::from_raw(self.0.wrapping_sub(rhs))
    }
}

/// `a` is 'after' `b` iff it is ahead of it by less than half the sequence space. Values
///  exactly 2^47 apart are unordered: neither is greater than the other.
pub fn seq_gt(a: SeqNum, b: SeqNum) -> bool {
    let diff = b.distance_to(a);
    diff != 0 && diff < SeqNum::HALF_WINDOW
}

pub fn seq_lt(a: SeqNum, b: SeqNum) -> bool {
    seq_gt(b, a)
}

pub fn seq_max(a: SeqNum, b: SeqNum) -> SeqNum {
    if seq_gt(b, a) { b } else { a }
}

/// A sequence number as it appears on the wire: long (48 bit) or short (24 bit), selected by the
///  header's X bit. Short numbers need a reference point to become a [`SeqNum`] again.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SequenceField {
    Long(SeqNum),
    Short(u32),
}

impl SequenceField {
    pub fn for_mode(seq: SeqNum, short: bool) -> SequenceField {
        if short {
            SequenceField::Short(seq.short_encode())
        }
        else {
            SequenceField::Long(seq)
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(self, SequenceField::Short(_))
    }

    pub fn canonicalize(&self, reference: SeqNum) -> SeqNum {
        match *self {
            SequenceField::Long(seq) => seq,
            SequenceField::Short(raw) => canonicalize(raw, reference),
        }
    }
}

/// Expands a 24-bit short sequence number to the 48-bit value in `[reference, reference + 2^24)`
///  that has the same low bits.
///
/// The reference point is fixed when the connection is set up and never advanced, so a value
///  that has moved 2^24 or more past it decodes to the wrong 48-bit number.
pub fn canonicalize(raw: u32, reference: SeqNum) -> SeqNum {
    let raw = raw as u64 & SeqNum::SHORT_MASK;
    let high = reference.to_raw() >> 24;
    let low = reference.to_raw() & SeqNum::SHORT_MASK;

    let high = if raw >= low { high } else { high + 1 };
    SeqNum::from_raw((high << 24) | raw)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Validation {
    Accept,
    Reject,
}

/// A candidate is accepted iff it lies strictly between `gsr - loss_window/4` and
///  `gsr + 3*loss_window/4`, modulo 2^48.
pub fn validate(candidate: SeqNum, gsr: SeqNum, loss_window: u64) -> Validation {
    let low = gsr - loss_window / 4;
    let high = gsr + loss_window.saturating_mul(3) / 4;

    if seq_gt(candidate, low) && seq_lt(candidate, high) {
        Validation::Accept
    }
    else {
        Validation::Reject
    }
}

/// Per-connection receive-side sequence state: greatest sequence received and the reference
///  points for short sequence numbers.
#[derive(Debug)]
pub struct SequenceTracker {
    /// unset until the first segment is accepted
    gsr: Option<SeqNum>,
    pub loss_window: u64,

    /// captured from the peer's Request or Response, used for the peer's short sequence numbers
    peer_reference: Option<SeqNum>,
    /// captured from our own initial sequence number, used for short ack numbers
    local_reference: Option<SeqNum>,
}

impl SequenceTracker {
    pub fn new(loss_window: u64) -> SequenceTracker {
        SequenceTracker {
            gsr: None,
            loss_window,
            peer_reference: None,
            local_reference: None,
        }
    }

    pub fn gsr(&self) -> Option<SeqNum> {
        self.gsr
    }

    pub fn capture_peer_reference(&mut self, seq: SeqNum) {
        if self.peer_reference.is_none() {
            self.peer_reference = Some(seq);
        }
    }

    pub fn capture_local_reference(&mut self, seq: SeqNum) {
        if self.local_reference.is_none() {
            self.local_reference = Some(seq);
        }
    }

    pub fn canonicalize_peer(&self, field: SequenceField) -> Result<SeqNum, DccpError> {
        match (field, self.peer_reference) {
            (SequenceField::Long(seq), _) => Ok(seq),
            (SequenceField::Short(raw), Some(reference)) => Ok(canonicalize(raw, reference)),
            (SequenceField::Short(_), None) => Err(DccpError::Malformed("short sequence number before handshake")),
        }
    }

    pub fn canonicalize_local(&self, field: SequenceField) -> Result<SeqNum, DccpError> {
        match (field, self.local_reference) {
            (SequenceField::Long(seq), _) => Ok(seq),
            (SequenceField::Short(raw), Some(reference)) => Ok(canonicalize(raw, reference)),
            (SequenceField::Short(_), None) => Err(DccpError::Malformed("short ack number before handshake")),
        }
    }

    /// Validates an inbound sequence number against the loss window and advances `gsr` on
    ///  acceptance. The first segment ever seen initialises `gsr`.
    pub fn accept(&mut self, seq: SeqNum) -> Result<(), DccpError> {
        let gsr = match self.gsr {
            None => {
                trace!("initializing gsr to {}", seq);
                self.gsr = Some(seq);
                return Ok(());
            }
            Some(gsr) => gsr,
        };

        match validate(seq, gsr, self.loss_window) {
            Validation::Accept => {
                self.gsr = Some(seq_max(gsr, seq));
                Ok(())
            }
            Validation::Reject => Err(DccpError::SequenceOutOfWindow { seq: seq.to_raw(), gsr: gsr.to_raw() }),
        }
    }
}
