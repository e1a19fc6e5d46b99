use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use crate::error::TransmitError;

/// Hands a finished segment to the layer below. Implementations must not block: a segment that
///  cannot be taken right away is rejected with an error.
#[cfg_attr(test, automock)]
pub trait SegmentTransmit: Send + Sync + 'static {
    fn transmit(&self, segment: &[u8]) -> Result<(), TransmitError>;
}

/// Feeds segments into a bounded channel, typically drained by a task that writes to the
///  network
pub struct ChannelTransmit {
    sender: mpsc::Sender<Bytes>,
}

impl ChannelTransmit {
    pub fn new(capacity: usize) -> (ChannelTransmit, mpsc::Receiver<Bytes>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (ChannelTransmit { sender }, receiver)
    }
}

impl SegmentTransmit for ChannelTransmit {
    fn transmit(&self, segment: &[u8]) -> Result<(), TransmitError> {
        self.sender.try_send(Bytes::copy_from_slice(segment))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransmitError::Full,
                TrySendError::Closed(_) => TransmitError::Closed,
            })
    }
}
