use std::time::Duration;
use anyhow::bail;

/// The smallest maximum segment size that leaves room for payload behind the largest data
///  carrying header
pub const MIN_SEGMENT_SIZE: usize = 64;

#[derive(Clone, Debug)]
pub struct DccpConfig {
    /// The congestion control identifier (CCID) this endpoint prefers. During negotiation it is
    ///  chosen whenever the peer offers it; otherwise the first identifier supported by both
    ///  sides wins. It does not need to be registered: if it is not, it is simply never offered.
    pub preferred_ccid: u8,

    /// Checksum coverage code for outgoing segments: 0 covers the entire segment, `k` covers the
    ///  header plus `k - 1` words of payload
    pub checksum_coverage: u8,

    /// Maximum size of an outgoing segment, including DCCP headers and options. Queued datagrams
    ///  that do not fit are split across several segments.
    pub max_segment_size: usize,

    /// Service code sent in Requests by clients, and expected in Requests by listeners
    pub service_code: u32,

    /// Width of the window around the greatest sequence number received in which incoming
    ///  sequence numbers are accepted. A quarter of it lies below GSR, the rest above.
    pub loss_window: u64,

    /// With negotiation disabled, the no-op congestion control is installed for both directions
    ///  when the connection is created, and no CCID Change options are sent. Both peers need the
    ///  same setting.
    pub feature_negotiation: bool,

    /// ask the peer to send Ack Vectors
    pub request_ack_vector: bool,
    /// accept a peer's request that we send short sequence numbers
    pub allow_short_seqnos: bool,
    /// ask the peer to send short sequence numbers
    pub request_short_seqnos: bool,

    /// Number of data-bearing segments received before an Ack is sent immediately rather than
    ///  piggybacked on the next outgoing data. 0 disables immediate acks.
    pub ack_ratio: u16,

    pub ack_vector_initial_cells: usize,
    /// Ack Vector growth beyond this is treated as allocation failure, and the connection stops
    ///  sending Ack Vectors
    pub ack_vector_max_cells: usize,

    /// This is the number of *datagrams* (not bytes) that can be queued for sending
    pub max_queued_packets: usize,
    pub receive_queue_limit: usize,

    /// maximum number of live connections derived from a listener
    pub backlog: usize,

    pub retransmit: RetransmitPolicy,
    pub connect_timeout: Duration,
    pub close_timeout: Duration,
    pub time_wait: Duration,
}

/// Retransmission of handshake and teardown segments. Data is never retransmitted.
///
/// The interval starts at `initial_interval` (or `close_interval` once a graceful close was
///  initiated), is multiplied by `factor_eighths / 8` after each retransmission and never exceeds
///  `max_interval`.
#[derive(Clone, Debug)]
pub struct RetransmitPolicy {
    pub initial_interval: Duration,
    pub close_interval: Duration,
    pub max_interval: Duration,
    pub factor_eighths: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        RetransmitPolicy {
            initial_interval: Duration::from_secs(2),
            close_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(64),
            factor_eighths: 2*8,
        }
    }
}

impl Default for DccpConfig {
    fn default() -> Self {
        DccpConfig {
            preferred_ccid: 2,
            checksum_coverage: 0,
            max_segment_size: 1400,
            service_code: 0,
            loss_window: 1000,
            feature_negotiation: true,
            request_ack_vector: false,
            allow_short_seqnos: false,
            request_short_seqnos: false,
            ack_ratio: 2,
            ack_vector_initial_cells: 512,
            ack_vector_max_cells: 65536,
            max_queued_packets: 100,
            receive_queue_limit: 1024,
            backlog: 128,
            retransmit: RetransmitPolicy::default(),
            connect_timeout: Duration::from_secs(75),
            close_timeout: Duration::from_secs(75),
            time_wait: Duration::from_secs(60),
        }
    }
}

impl DccpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.checksum_coverage > 15 {
            bail!("checksum coverage must be in 0..=15");
        }
        if self.max_segment_size < MIN_SEGMENT_SIZE {
            bail!("maximum segment size is too small");
        }
        if self.loss_window < 32 {
            bail!("loss window must be at least 32");
        }
        if !self.ack_vector_initial_cells.is_power_of_two() || self.ack_vector_initial_cells < 256 {
            bail!("initial ack vector capacity must be a power of two and at least 256");
        }
        if self.ack_vector_max_cells < self.ack_vector_initial_cells {
            bail!("maximum ack vector capacity is smaller than the initial capacity");
        }
        if self.retransmit.factor_eighths < 8 {
            bail!("retransmit backoff factor must be at least 1");
        }
        if self.retransmit.max_interval < self.retransmit.initial_interval || self.retransmit.max_interval < self.retransmit.close_interval {
            bail!("maximum retransmit interval is smaller than an initial interval");
        }
        if self.max_queued_packets == 0 || self.backlog == 0 {
            bail!("queue limits must be positive");
        }

        Ok(())
    }
}

/// The settings an application can change on a connection
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketOption {
    Ccid(u8),
    ChecksumCoverage(u8),
    MaxSegmentSize(usize),
    ServiceCode(u32),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SocketOptionKind {
    Ccid,
    ChecksumCoverage,
    MaxSegmentSize,
    ServiceCode,
}
