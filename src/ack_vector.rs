use num_enum::{FromPrimitive, IntoPrimitive};
use tracing::{debug, trace};
use crate::error::DccpError;
use crate::seq::{seq_gt, seq_lt, SeqNum};

#[derive(Clone, Copy, Debug, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum AckState {
    Received = 0,
    ReceivedEcnMarked = 1,
    Reserved = 2,
    #[num_enum(default)]
    NotReceived = 3,
}

/// The receive history that is sent to the peer as Ack Vector option.
///
/// The history is a ring of 2-bit cells, four to a byte. The cell at `head_index` holds the state
///  of `head_seq`, the oldest sequence number still tracked; `tail_seq` is one past the newest
///  sequence number marked as received. Cells that were never marked are `NotReceived`.
pub struct AckVector {
    cells: Vec<u8>,
    /// in cells, always a power of two
    capacity: usize,
    max_capacity: usize,
    head_index: usize,
    head_seq: SeqNum,
    tail_seq: SeqNum,
}

impl std::fmt::Debug for AckVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AckVector{{[{}..{}) cap {}}}", self.head_seq, self.tail_seq, self.capacity)
    }
}

impl AckVector {
    /// The buffer doubles before a cell offset comes closer than this to the capacity
    pub const RESIZE_THRESHOLD: usize = 128;

    /// length limit for the value of a single option
    const MAX_ENCODED_LEN: usize = u8::MAX as usize - 2;
    const MAX_RUN: usize = 64;

    pub fn new(initial_capacity: usize, max_capacity: usize) -> Result<AckVector, DccpError> {
        if !initial_capacity.is_power_of_two() || initial_capacity <= Self::RESIZE_THRESHOLD || initial_capacity < 4 {
            return Err(DccpError::InvalidArgument("ack vector capacity must be a power of two above the resize threshold"));
        }
        if initial_capacity > max_capacity {
            return Err(DccpError::ResourceExhausted("ack vector capacity"));
        }

        Ok(AckVector {
            cells: vec![0xff; initial_capacity / 4],
            capacity: initial_capacity,
            max_capacity,
            head_index: 0,
            head_seq: SeqNum::default(),
            tail_seq: SeqNum::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn head(&self) -> SeqNum {
        self.head_seq
    }

    pub fn tail(&self) -> SeqNum {
        self.tail_seq
    }

    pub fn is_empty(&self) -> bool {
        self.head_seq == self.tail_seq
    }

    fn index_of(&self, offset: usize) -> usize {
        (self.head_index + offset) & (self.capacity - 1)
    }

    fn cell(&self, index: usize) -> AckState {
        AckState::from((self.cells[index / 4] >> ((index % 4) * 2)) & 0b11)
    }

    fn set_cell(&mut self, index: usize, state: AckState) {
        let shift = (index % 4) * 2;
        let byte = &mut self.cells[index / 4];
        *byte = (*byte & !(0b11 << shift)) | (u8::from(state) << shift);
    }

    pub fn mark_received(&mut self, seq: SeqNum) -> Result<(), DccpError> {
        if self.is_empty() {
            self.head_seq = seq;
            self.tail_seq = seq;
        }

        if seq_lt(seq, self.head_seq) {
            trace!("{} is before the ack vector's head {} - ignoring", seq, self.head_seq);
            return Ok(());
        }

        let gap = self.head_seq.distance_to(seq);
        while gap > (self.capacity - Self::RESIZE_THRESHOLD) as u64 {
            self.grow()?;
        }

        let index = self.index_of(gap as usize);
        self.set_cell(index, AckState::Received);
        if !seq_lt(seq, self.tail_seq) {
            self.tail_seq = seq + 1;
        }
        Ok(())
    }

    /// Doubles the capacity, copying the cells so that the head ends up at index 0
    fn grow(&mut self) -> Result<(), DccpError> {
        let new_capacity = self.capacity * 2;
        if new_capacity > self.max_capacity {
            return Err(DccpError::ResourceExhausted("ack vector capacity"));
        }
        debug!("growing ack vector from {} to {} cells", self.capacity, new_capacity);

        let mut grown = AckVector {
            cells: vec![0xff; new_capacity / 4],
            capacity: new_capacity,
            max_capacity: self.max_capacity,
            head_index: 0,
            head_seq: self.head_seq,
            tail_seq: self.tail_seq,
        };
        for offset in 0..self.capacity {
            grown.set_cell(offset, self.cell(self.index_of(offset)));
        }
        *self = grown;
        Ok(())
    }

    /// Moves the head forward to `seq`, forgetting the state of everything before it
    pub fn advance_head(&mut self, seq: SeqNum) {
        if self.is_empty() || !seq_gt(seq, self.head_seq) {
            return;
        }

        let advance = self.head_seq.distance_to(seq);
        let cleared = advance.min(self.capacity as u64) as usize;
        for offset in 0..cleared {
            let index = self.index_of(offset);
            self.set_cell(index, AckState::NotReceived);
        }

        self.head_index = self.index_of((advance % self.capacity as u64) as usize);
        self.head_seq = seq;
        if !seq_lt(seq, self.tail_seq) {
            self.tail_seq = seq;
        }
    }

    pub fn decode_state(&self, seq: SeqNum) -> AckState {
        if self.is_empty() || seq_lt(seq, self.head_seq) || !seq_lt(seq, self.tail_seq) {
            return AckState::NotReceived;
        }
        let offset = self.head_seq.distance_to(seq);
        if offset >= self.capacity as u64 {
            return AckState::NotReceived;
        }
        self.cell(self.index_of(offset as usize))
    }

    /// Run-length encodes the states from `ack` back to the head: each byte is
    ///  `state << 6 | (run length - 1)`. Sequence numbers past the tail are reported as not
    ///  received. The output is cut at the length limit of a single option, dropping the oldest
    ///  states.
    pub fn encode(&self, ack: SeqNum) -> Vec<u8> {
        let mut result = Vec::new();
        if self.is_empty() || seq_lt(ack, self.head_seq) {
            return result;
        }

        let count = self.head_seq.distance_to(ack) + 1;
        let mut run: Option<(AckState, usize)> = None;
        for i in 0..count {
            let state = self.decode_state(ack - i);
            run = match run {
                Some((run_state, len)) if run_state == state && len < Self::MAX_RUN => Some((state, len + 1)),
                Some((run_state, len)) => {
                    result.push(Self::run_byte(run_state, len));
                    if result.len() == Self::MAX_ENCODED_LEN {
                        return result;
                    }
                    Some((state, 1))
                }
                None => Some((state, 1)),
            };
        }
        if let Some((state, len)) = run {
            result.push(Self::run_byte(state, len));
        }
        result
    }

    fn run_byte(state: AckState, len: usize) -> u8 {
        (u8::from(state) << 6) | (len - 1) as u8
    }
}
