//! The interface between the connection state machine and pluggable congestion control
//!  algorithms.
//!
//! An algorithm is a stateless [`CongestionControl`] object shared by all connections; its
//!  per-connection, per-direction state lives in an opaque [`CcHandle`] that the connection owns
//!  and passes back into every call. The connection never looks inside a handle.

use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::error::DccpError;

pub struct CcHandle(Box<dyn Any + Send>);

impl CcHandle {
    pub fn new<T: Any + Send>(state: T) -> CcHandle {
        CcHandle(Box::new(state))
    }

    pub fn downcast_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.downcast_mut()
    }
}

impl Debug for CcHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CcHandle")
    }
}

#[cfg_attr(test, automock)]
pub trait CongestionControl: Send + Sync + 'static {
    fn send_init(&self) -> Result<CcHandle, DccpError>;
    fn send_free(&self, handle: CcHandle);

    /// Asked before every outgoing data-bearing segment
    fn may_send(&self, handle: &mut CcHandle, pending_bytes: usize) -> bool;
    fn on_send_complete(&self, handle: &mut CcHandle, more_queued: bool, bytes_sent: usize);

    fn recv_init(&self) -> Result<CcHandle, DccpError>;
    fn recv_free(&self, handle: CcHandle);

    /// Called with the raw option block of every Data, Ack and DataAck segment, so the algorithm
    ///  can pick up Ack Vectors, Elapsed Time and its own private options
    fn on_packet_received(&self, handle: &mut CcHandle, options: &[u8]);
}

/// Always permits sending and ignores all feedback
pub struct NoCongestionControl;

impl CongestionControl for NoCongestionControl {
    fn send_init(&self) -> Result<CcHandle, DccpError> {
        Ok(CcHandle::new(()))
    }

    fn send_free(&self, _handle: CcHandle) {}

    fn may_send(&self, _handle: &mut CcHandle, _pending_bytes: usize) -> bool {
        true
    }

    fn on_send_complete(&self, _handle: &mut CcHandle, _more_queued: bool, _bytes_sent: usize) {}

    fn recv_init(&self) -> Result<CcHandle, DccpError> {
        Ok(CcHandle::new(()))
    }

    fn recv_free(&self, _handle: CcHandle) {}

    fn on_packet_received(&self, _handle: &mut CcHandle, _options: &[u8]) {}
}

/// The algorithms available for negotiation, keyed by CCID. It is built once at startup and
///  shared read-only between all connections.
pub struct CongestionControlRegistry {
    algorithms: FxHashMap<u8, Arc<dyn CongestionControl>>,
}

impl Default for CongestionControlRegistry {
    fn default() -> Self {
        CongestionControlRegistry::builder()
            .with(Self::NO_CONGESTION_CONTROL, Arc::new(NoCongestionControl))
            .build()
    }
}

impl CongestionControlRegistry {
    /// the identifier under which the default registry offers [`NoCongestionControl`]
    pub const NO_CONGESTION_CONTROL: u8 = 0;

    pub fn builder() -> CongestionControlRegistryBuilder {
        CongestionControlRegistryBuilder { algorithms: FxHashMap::default() }
    }

    pub fn get(&self, ccid: u8) -> Option<&Arc<dyn CongestionControl>> {
        self.algorithms.get(&ccid)
    }

    pub fn contains(&self, ccid: u8) -> bool {
        self.algorithms.contains_key(&ccid)
    }

    /// All registered identifiers in ascending order, with `preferred` moved to the front if it
    ///  is registered
    pub fn offered(&self, preferred: u8) -> Vec<u8> {
        let mut result: Vec<u8> = self.algorithms.keys().copied().collect();
        result.sort_unstable_by_key(|&ccid| (ccid != preferred, ccid));
        result
    }

    /// Picks from the peer's offer: `preferred` if the peer offers it and it is registered,
    ///  otherwise the first registered identifier in the peer's order
    pub fn choose(&self, offered: &[u8], preferred: u8) -> Option<u8> {
        if offered.contains(&preferred) && self.contains(preferred) {
            return Some(preferred);
        }
        offered.iter().copied().find(|&ccid| self.contains(ccid))
    }
}

pub struct CongestionControlRegistryBuilder {
    algorithms: FxHashMap<u8, Arc<dyn CongestionControl>>,
}

impl CongestionControlRegistryBuilder {
    pub fn with(mut self, ccid: u8, algorithm: Arc<dyn CongestionControl>) -> Self {
        self.algorithms.insert(ccid, algorithm);
        self
    }

    pub fn build(self) -> CongestionControlRegistry {
        CongestionControlRegistry { algorithms: self.algorithms }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Direction {
    Send,
    Receive,
}

/// The algorithm negotiated for one direction of a connection, together with its handle. The
///  handle is released through the algorithm when this is dropped.
pub struct ActiveCongestionControl {
    ccid: u8,
    direction: Direction,
    algorithm: Arc<dyn CongestionControl>,
    handle: Option<CcHandle>,
}

impl Debug for ActiveCongestionControl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CCID {} ({:?})", self.ccid, self.direction)
    }
}

impl ActiveCongestionControl {
    pub fn init(ccid: u8, direction: Direction, algorithm: Arc<dyn CongestionControl>) -> Result<ActiveCongestionControl, DccpError> {
        let handle = match direction {
            Direction::Send => algorithm.send_init()?,
            Direction::Receive => algorithm.recv_init()?,
        };
        debug!("initialized CCID {} for {:?} direction", ccid, direction);

        Ok(ActiveCongestionControl {
            ccid,
            direction,
            algorithm,
            handle: Some(handle),
        })
    }

    pub fn ccid(&self) -> u8 {
        self.ccid
    }

    pub fn may_send(&mut self, pending_bytes: usize) -> bool {
        match &mut self.handle {
            Some(handle) => self.algorithm.may_send(handle, pending_bytes),
            None => true,
        }
    }

    pub fn on_send_complete(&mut self, more_queued: bool, bytes_sent: usize) {
        if let Some(handle) = &mut self.handle {
            self.algorithm.on_send_complete(handle, more_queued, bytes_sent);
        }
    }

    pub fn on_packet_received(&mut self, options: &[u8]) {
        if let Some(handle) = &mut self.handle {
            self.algorithm.on_packet_received(handle, options);
        }
    }
}

impl Drop for ActiveCongestionControl {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            trace!("releasing CCID {} for {:?} direction", self.ccid, self.direction);
            match self.direction {
                Direction::Send => self.algorithm.send_free(handle),
                Direction::Receive => self.algorithm.recv_free(handle),
            }
        }
    }
}
