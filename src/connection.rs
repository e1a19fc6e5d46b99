use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, instrument, trace, warn};
use crate::ack_vector::AckVector;
use crate::config::{DccpConfig, SocketOption, SocketOptionKind, MIN_SEGMENT_SIZE};
use crate::congestion_control::{ActiveCongestionControl, CongestionControlRegistry, Direction, NoCongestionControl};
use crate::error::DccpError;
use crate::options;
use crate::options::PendingOptions;
use crate::packet_header::{PacketType, ResetReason, Segment, SegmentKind};
use crate::seq::{seq_gt, seq_lt, SeqNum, SequenceField, SequenceTracker};
use crate::stats::ConnectionStats;
use crate::timers::{RetransmitBackoff, TimerKind, Timers};
use crate::transmit::SegmentTransmit;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
    Listener,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Closed,
    Listen,
    /// a client waiting for a Response; transiently also a server that just got a Request
    Request,
    Respond,
    Established,
    ClientClose,
    ServerClose,
    TimeWait,
}

/// One DCCP connection (or listener): the state machine, the sequence number bookkeeping and
///  everything that was negotiated with the peer.
///
/// A connection does no I/O of its own. Every event - an inbound segment, an application call or
///  an expired timer - is a synchronous method call that gets the transmit collaborator for any
///  segments it emits; timers are requested through [`Timers`] and scheduled by the caller.
///  Callers serialize events per connection.
pub struct Connection {
    pub(crate) config: DccpConfig,
    pub(crate) registry: Arc<CongestionControlRegistry>,
    pub(crate) role: Role,
    pub(crate) state: ConnectionState,
    pub(crate) destroyed: bool,
    pub(crate) local_port: u16,
    pub(crate) remote_port: u16,

    /// the last sequence number sent
    pub(crate) seq_send: SeqNum,
    pub(crate) initial_sequence: Option<SeqNum>,
    /// the sequence number of the last accepted segment
    pub(crate) seq_recv: Option<SeqNum>,
    pub(crate) tracker: SequenceTracker,

    /// sequence number to acknowledge with the next Ack or DataAck
    pub(crate) ack_pending: Option<SeqNum>,
    /// data-bearing segments received since the last ack was sent
    pub(crate) data_since_ack: u16,
    pub(crate) ack_ratio: u16,

    pub(crate) send_cc: Option<ActiveCongestionControl>,
    pub(crate) recv_cc: Option<ActiveCongestionControl>,
    pub(crate) pending: PendingOptions,

    /// we send short sequence numbers
    pub(crate) short_sequence: bool,
    /// the peer agreed to send short sequence numbers
    pub(crate) peer_short_sequence: bool,

    /// present once the peer asked us to send Ack Vectors
    pub(crate) ack_vector: Option<AckVector>,
    /// the peer agreed to send Ack Vectors
    pub(crate) remote_ack_vector: bool,
    /// (sequence number of the segment carrying the vector, ack number it covered)
    pub(crate) ack_vector_in_flight: Option<(SeqNum, SeqNum)>,

    pub(crate) timers: Timers,
    pub(crate) backoff: RetransmitBackoff,

    /// an explicit Reset takes precedence over everything else the next output would send
    pub(crate) reset_request: Option<ResetReason>,
    pub(crate) retransmit_response: bool,

    /// datagrams queued by the application, front first; partially sent datagrams are trimmed
    pub(crate) send_queue: VecDeque<Bytes>,
    pub(crate) receive_queue: VecDeque<Bytes>,
    pub(crate) receive_closed: bool,

    pub(crate) stats: ConnectionStats,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DCCP{{{:?}:{:?}@{}->{}}}", self.role, self.state, self.local_port, self.remote_port)
    }
}

impl Connection {
    fn new(role: Role, config: DccpConfig, registry: Arc<CongestionControlRegistry>, local_port: u16, remote_port: u16) -> Connection {
        let mut result = Connection {
            role,
            state: ConnectionState::Closed,
            destroyed: false,
            local_port,
            remote_port,
            seq_send: SeqNum::default(),
            initial_sequence: None,
            seq_recv: None,
            tracker: SequenceTracker::new(config.loss_window),
            ack_pending: None,
            data_since_ack: 0,
            ack_ratio: config.ack_ratio,
            send_cc: None,
            recv_cc: None,
            pending: PendingOptions::default(),
            short_sequence: false,
            peer_short_sequence: false,
            ack_vector: None,
            remote_ack_vector: false,
            ack_vector_in_flight: None,
            timers: Timers::default(),
            backoff: RetransmitBackoff::new(&config.retransmit),
            reset_request: None,
            retransmit_response: false,
            send_queue: VecDeque::new(),
            receive_queue: VecDeque::new(),
            receive_closed: false,
            stats: ConnectionStats::default(),
            config,
            registry,
        };

        if !result.config.feature_negotiation && role != Role::Listener {
            result.install_no_congestion_control();
        }
        result
    }

    pub fn new_client(config: DccpConfig, registry: Arc<CongestionControlRegistry>, local_port: u16, remote_port: u16) -> Connection {
        Connection::new(Role::Client, config, registry, local_port, remote_port)
    }

    pub fn new_listener(config: DccpConfig, registry: Arc<CongestionControlRegistry>, local_port: u16) -> Connection {
        Connection::new(Role::Listener, config, registry, local_port, 0)
    }

    /// Fixes the sequence number of the first segment this connection sends instead of picking
    ///  a random one
    pub fn with_initial_sequence(mut self, initial_sequence: u64) -> Connection {
        self.initial_sequence = Some(SeqNum::from_raw(initial_sequence));
        self
    }

    fn install_no_congestion_control(&mut self) {
        let ccid = CongestionControlRegistry::NO_CONGESTION_CONTROL;
        for direction in [Direction::Send, Direction::Receive] {
            match ActiveCongestionControl::init(ccid, direction, Arc::new(NoCongestionControl)) {
                Ok(active) => match direction {
                    Direction::Send => self.send_cc = Some(active),
                    Direction::Receive => self.recv_cc = Some(active),
                },
                Err(e) => warn!("no-op congestion control failed to initialize: {}", e),
            }
        }
    }

    fn start_sequence(&mut self) {
        let iss = self.initial_sequence
            .unwrap_or_else(|| SeqNum::from_raw(rand::random::<u64>()));
        self.seq_send = iss - 1;
        self.tracker.capture_local_reference(iss);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn gsr(&self) -> Option<SeqNum> {
        self.tracker.gsr()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn timers(&mut self) -> &mut Timers {
        &mut self.timers
    }

    /// the CCIDs negotiated for the send and receive directions
    pub fn negotiated_ccids(&self) -> (Option<u8>, Option<u8>) {
        (self.send_cc.as_ref().map(|cc| cc.ccid()), self.recv_cc.as_ref().map(|cc| cc.ccid()))
    }

    fn congestion_control_resolved(&self) -> bool {
        self.send_cc.is_some() && self.recv_cc.is_some()
    }

    pub fn set_option(&mut self, option: SocketOption) -> Result<(), DccpError> {
        match option {
            SocketOption::Ccid(ccid) => {
                if !self.registry.contains(ccid) {
                    return Err(DccpError::InvalidArgument("unknown CCID"));
                }
                self.config.preferred_ccid = ccid;
            }
            SocketOption::ChecksumCoverage(coverage) => {
                if coverage > 15 {
                    return Err(DccpError::InvalidArgument("checksum coverage must be in 0..=15"));
                }
                self.config.checksum_coverage = coverage;
            }
            SocketOption::MaxSegmentSize(mss) => {
                if mss > self.config.max_segment_size {
                    return Err(DccpError::InvalidArgument("maximum segment size can only be reduced"));
                }
                if mss < MIN_SEGMENT_SIZE {
                    return Err(DccpError::InvalidArgument("maximum segment size leaves no room for payload"));
                }
                self.config.max_segment_size = mss;
            }
            SocketOption::ServiceCode(service_code) => self.config.service_code = service_code,
        }
        Ok(())
    }

    pub fn get_option(&self, kind: SocketOptionKind) -> SocketOption {
        match kind {
            SocketOptionKind::Ccid => SocketOption::Ccid(self.config.preferred_ccid),
            SocketOptionKind::ChecksumCoverage => SocketOption::ChecksumCoverage(self.config.checksum_coverage),
            SocketOptionKind::MaxSegmentSize => SocketOption::MaxSegmentSize(self.config.max_segment_size),
            SocketOptionKind::ServiceCode => SocketOption::ServiceCode(self.config.service_code),
        }
    }

    pub fn connect(&mut self, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if self.role != Role::Client || self.state != ConnectionState::Closed || self.destroyed {
            return Err(DccpError::InvalidArgument("connect requires a new client connection"));
        }
        self.check_config()?;

        self.start_sequence();
        self.initiate_feature_changes()?;
        self.stats.connection_attempts += 1;

        self.timers.arm(TimerKind::Connect, self.config.connect_timeout);
        self.backoff.reset(self.config.retransmit.initial_interval);
        self.timers.arm(TimerKind::Retransmit, self.backoff.current());

        self.output(tx)
    }

    pub fn listen(&mut self) -> Result<(), DccpError> {
        if self.role != Role::Listener || self.state != ConnectionState::Closed || self.destroyed {
            return Err(DccpError::InvalidArgument("listen requires a new listener"));
        }
        self.check_config()?;
        self.state = ConnectionState::Listen;
        Ok(())
    }

    fn check_config(&self) -> Result<(), DccpError> {
        self.config.validate().map_err(|e| {
            warn!("rejecting configuration: {}", e);
            DccpError::InvalidArgument("invalid configuration")
        })
    }

    /// Creates the server side connection for a Request that arrived at this listener from
    ///  `remote_port`. The caller then feeds the Request into the new connection.
    pub fn derive_for_request(&self, remote_port: u16) -> Result<Connection, DccpError> {
        if self.role != Role::Listener || self.state != ConnectionState::Listen {
            return Err(DccpError::InvalidArgument("not a listening connection"));
        }

        let mut derived = Connection::new(Role::Server, self.config.clone(), self.registry.clone(), self.local_port, remote_port);
        derived.initial_sequence = self.initial_sequence;
        derived.state = ConnectionState::Listen;
        Ok(derived)
    }

    /// Answers a Request that cannot be served with a Reset, leaving this connection destroyed
    pub fn refuse(&mut self, raw: &[u8], reason: ResetReason, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        let segment = Segment::decode(raw)?;
        self.stats.resource_exhausted += 1;
        if let SequenceField::Long(seq) = segment.sequence {
            self.seq_recv = Some(seq);
        }
        if segment.packet_type() == PacketType::Reset {
            self.destroy();
            return Ok(());
        }
        self.abort_with_reset(reason, tx)
    }

    /// Queues a datagram. It is sent right away if the connection is established, otherwise
    ///  once it is.
    pub fn send(&mut self, data: Bytes, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if self.destroyed || !matches!(self.state, ConnectionState::Request | ConnectionState::Respond | ConnectionState::Established) {
            return Err(DccpError::NotConnected);
        }
        if self.send_queue.len() >= self.config.max_queued_packets {
            self.stats.resource_exhausted += 1;
            return Err(DccpError::ResourceExhausted("send queue full"));
        }

        self.send_queue.push_back(data);
        if self.state == ConnectionState::Established {
            self.output(tx)?;
        }
        Ok(())
    }

    pub fn recv(&mut self) -> Option<Bytes> {
        self.receive_queue.pop_front()
    }

    /// A hook for congestion control algorithms that were holding back data and now allow
    ///  sending
    pub fn on_send_ready(&mut self, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if self.state == ConnectionState::Established && !self.destroyed {
            self.output(tx)?;
        }
        Ok(())
    }

    /// Graceful close. Before the handshake completed there is nothing to tear down, and the
    ///  connection is destroyed right away.
    pub fn close(&mut self, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if self.destroyed {
            return Ok(());
        }

        use ConnectionState::*;
        match self.state {
            Closed | Listen | Request | Respond => {
                self.destroy();
                Ok(())
            }
            Established => self.start_close(tx),
            ClientClose | ServerClose | TimeWait => Ok(()),
        }
    }

    pub fn abort(&mut self, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if self.destroyed {
            return Ok(());
        }
        match self.state {
            ConnectionState::Closed | ConnectionState::Listen => {
                self.destroy();
                Ok(())
            }
            _ => self.abort_with_reset(ResetReason::Aborted, tx),
        }
    }

    fn start_close(&mut self, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        self.receive_closed = true;
        self.receive_queue.clear();

        self.backoff.reset(self.config.retransmit.close_interval);
        self.timers.arm(TimerKind::Retransmit, self.backoff.current());
        self.timers.arm(TimerKind::Close, self.config.close_timeout);

        self.state = match self.role {
            Role::Client => ConnectionState::ClientClose,
            _ => ConnectionState::ServerClose,
        };
        debug!("closing connection: {:?}", self.state);
        self.output(tx)
    }

    pub fn on_timer(&mut self, kind: TimerKind, epoch: u64, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if self.destroyed {
            return Ok(());
        }
        if !self.timers.fire(kind, epoch) {
            trace!("{:?} timer with epoch {} is stale - ignoring", kind, epoch);
            return Ok(());
        }
        if !kind.applies_in(self.state) {
            trace!("{:?} timer fired in state {:?} - ignoring", kind, self.state);
            return Ok(());
        }

        match kind {
            TimerKind::Connect => {
                debug!("connect timer expired in state {:?}", self.state);
                self.destroy();
                Ok(())
            }
            TimerKind::Retransmit => {
                let interval = self.backoff.next();
                self.timers.arm(TimerKind::Retransmit, interval);
                trace!("retransmitting in state {:?}, next in {:?}", self.state, interval);
                self.output(tx)
            }
            TimerKind::Close => {
                debug!("graceful close timed out");
                self.timers.stop(TimerKind::Retransmit);
                self.state = ConnectionState::TimeWait;
                let result = self.reply_reset(ResetReason::Closed, tx);
                if self.role == Role::Client {
                    self.timers.arm(TimerKind::TimeWait, self.config.time_wait);
                }
                else {
                    self.destroy();
                }
                result
            }
            TimerKind::TimeWait => {
                debug!("time-wait expired");
                self.destroy();
                Ok(())
            }
        }
    }

    /// Releases everything the connection holds. The receive queue stays readable.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        debug!("destroying connection in state {:?}", self.state);

        self.timers.stop_all();
        self.send_cc = None;
        self.recv_cc = None;
        self.ack_vector = None;
        self.send_queue.clear();
        self.receive_closed = true;
        self.state = ConnectionState::Closed;
        self.destroyed = true;
    }

    /// Processes an inbound segment. Errors are for diagnostics only: the segment was dropped
    ///  (and counted), or it caused the connection to be aborted.
    #[instrument(skip_all, fields(conn = ?self))]
    pub fn on_segment(&mut self, raw: &[u8], tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if self.destroyed {
            return Err(DccpError::NotConnected);
        }
        if self.role == Role::Listener {
            return Err(DccpError::InvalidArgument("listeners hand segments to derived connections"));
        }

        self.stats.packets_in += 1;
        self.stats.bytes_in += raw.len() as u64;

        let segment = match Segment::decode(raw) {
            Ok(segment) => segment,
            Err(e) => {
                match e {
                    DccpError::ChecksumMismatch => self.stats.checksum_mismatch += 1,
                    _ => self.stats.malformed += 1,
                }
                debug!("dropping segment: {}", e);
                return Err(e);
            }
        };
        trace!("received {:?} {:?}", segment.kind, segment.sequence);

        match (self.state, segment.packet_type()) {
            (ConnectionState::Listen, PacketType::Request) | (ConnectionState::Request, PacketType::Response) => {
                if let SequenceField::Long(seq) = segment.sequence {
                    self.tracker.capture_peer_reference(seq);
                }
            }
            _ => {}
        }

        let seq = match self.tracker.canonicalize_peer(segment.sequence) {
            Ok(seq) => seq,
            Err(e) => {
                self.stats.malformed += 1;
                debug!("dropping segment: {}", e);
                return Err(e);
            }
        };
        if let Err(e) = self.tracker.accept(seq) {
            self.stats.out_of_window += 1;
            debug!("dropping segment: {}", e);
            return Err(e);
        }

        let parsed_options = match options::parse(&segment.options) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.malformed += 1;
                debug!("dropping segment with malformed options: {}", e);
                return Err(e);
            }
        };

        let ack = match segment.kind.ack() {
            Some(field) => match self.tracker.canonicalize_local(field) {
                Ok(ack) => Some(ack),
                Err(e) => {
                    self.stats.malformed += 1;
                    debug!("dropping segment: {}", e);
                    return Err(e);
                }
            },
            None => None,
        };

        self.seq_recv = Some(seq);
        self.record_receipt(seq, ack);

        if let Err(e) = self.process_options(&parsed_options) {
            if let DccpError::FeatureNegotiationFailed { .. } = e {
                self.stats.negotiation_failed += 1;
                warn!("{} - resetting connection", e);
                // the abort's own result is secondary to the negotiation failure
                let _ = self.abort_with_reset(ResetReason::OptionError, tx);
            }
            return Err(e);
        }

        self.transition(&segment, seq, tx)
    }

    fn record_receipt(&mut self, seq: SeqNum, ack: Option<SeqNum>) {
        if let Some(ack_vector) = &mut self.ack_vector {
            if let Err(e) = ack_vector.mark_received(seq) {
                warn!("{} - no longer sending ack vectors", e);
                self.stats.resource_exhausted += 1;
                self.ack_vector = None;
                self.ack_vector_in_flight = None;
            }
        }

        if let (Some(ack), Some((sent_with, covered))) = (ack, self.ack_vector_in_flight) {
            if !seq_lt(ack, sent_with) {
                if let Some(ack_vector) = &mut self.ack_vector {
                    trace!("ack vector sent with {} was acknowledged, advancing head to {}", sent_with, covered);
                    ack_vector.advance_head(covered);
                }
                self.ack_vector_in_flight = None;
            }
        }
    }

    fn process_options(&mut self, parsed: &options::ParsedOptions) -> Result<(), DccpError> {
        self.negotiate_features(&parsed.features)?;

        if let Some(timestamp) = parsed.timestamp {
            self.pending.add_option(options::TIMESTAMP_ECHO, &timestamp)?;
        }
        if parsed.slow_receiver {
            trace!("peer signals slow receiver");
        }
        if parsed.buffer_closed {
            debug!("peer closed its receive buffer");
        }
        if parsed.data_discard {
            trace!("peer discarded payload");
        }
        if let Some(drops) = &parsed.receive_buffer_drops {
            debug!("peer reports receive buffer drops: {:?}", drops.as_ref());
        }
        if let Some(ack_vector) = &parsed.ack_vector {
            trace!("peer ack vector with {} run-length bytes", ack_vector.len());
        }
        Ok(())
    }

    fn transition(&mut self, segment: &Segment, seq: SeqNum, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        use ConnectionState::*;
        use PacketType as T;

        match (self.state, segment.packet_type()) {
            (Closed | TimeWait, T::Reset) => Ok(()),
            (Closed | TimeWait, _) => self.reply_reset(ResetReason::NoConnection, tx),

            (Listen, T::Request) => self.on_request(segment, tx),
            (Listen, T::Reset) => {
                self.destroy();
                Ok(())
            }
            (Listen, _) => {
                self.stats.unexpected_type += 1;
                self.abort_with_reset(ResetReason::NoConnection, tx)
            }

            (Request, T::Response) => self.on_response(segment, seq, tx),
            (Request, T::Reset) => {
                debug!("connection refused: {:?}", segment.kind);
                self.destroy();
                Ok(())
            }
            (Request, T::Close) => {
                self.stats.unexpected_type += 1;
                self.abort_with_reset(ResetReason::Aborted, tx)
            }
            (Request, _) => {
                self.stats.unexpected_type += 1;
                let result = self.reply_reset(ResetReason::Aborted, tx);
                self.enter_time_wait();
                result
            }

            (Respond, T::Request) => {
                if self.role == Role::Server {
                    trace!("duplicate request - resending response");
                    self.retransmit_response = true;
                    self.output(tx)
                }
                else {
                    Ok(())
                }
            }
            (Respond, T::Ack | T::DataAck) => self.on_handshake_ack(segment, seq, tx),
            (Respond, T::Close) => self.abort_with_reset(ResetReason::Closed, tx),
            (Respond, T::Reset) => {
                self.enter_time_wait();
                Ok(())
            }
            (Respond, _) => {
                self.stats.unexpected_type += 1;
                self.reply_reset(ResetReason::Aborted, tx)
            }

            (Established, T::Data | T::DataAck) => self.on_data(segment, seq, tx),
            (Established, T::Ack) => {
                self.feed_congestion_control(&segment.options);
                Ok(())
            }
            (Established, T::CloseReq) => {
                if self.role == Role::Client {
                    self.start_close(tx)
                }
                else {
                    self.stats.unexpected_type += 1;
                    self.reply_reset(ResetReason::Aborted, tx)
                }
            }
            (Established, T::Close) => self.abort_with_reset(ResetReason::Closed, tx),
            (Established, T::Reset) => {
                debug!("connection reset by peer: {:?}", segment.kind);
                self.enter_time_wait();
                Ok(())
            }
            (Established, T::Move) => Ok(()),
            (Established, T::Request | T::Response) => {
                self.stats.unexpected_type += 1;
                debug!("discarding unexpected {:?}", segment.packet_type());
                Ok(())
            }

            (ServerClose, T::Close) => {
                self.timers.stop(TimerKind::Retransmit);
                self.abort_with_reset(ResetReason::Closed, tx)
            }
            (ClientClose, T::Close) => Ok(()),
            (ClientClose, T::CloseReq) => self.output(tx),
            (ClientClose | ServerClose, T::Reset) => {
                self.enter_time_wait();
                Ok(())
            }
            (ClientClose | ServerClose, _) => {
                self.stats.unexpected_type += 1;
                debug!("discarding {:?} while closing", segment.packet_type());
                Ok(())
            }
        }
    }

    fn check_service_code(&mut self, actual: u32, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        let expected = self.config.service_code;
        if actual == expected {
            return Ok(());
        }

        self.stats.service_code_mismatch += 1;
        warn!("service code mismatch: expected {}, got {}", expected, actual);
        // the Reset is best effort, the mismatch is what the caller needs to hear about
        let _ = self.abort_with_reset(ResetReason::BadServiceCode, tx);
        Err(DccpError::ServiceCodeMismatch { expected, actual })
    }

    fn on_request(&mut self, segment: &Segment, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if let SegmentKind::Request { service_code } = segment.kind {
            self.check_service_code(service_code, tx)?;
        }

        self.start_sequence();
        self.stats.connection_attempts += 1;
        self.state = ConnectionState::Request;

        self.initiate_feature_changes()?;
        if !segment.payload.is_empty() {
            trace!("discarding {} bytes of data in Request", segment.payload.len());
            self.pending.add_option(options::DATA_DISCARD, &[])?;
        }

        self.timers.arm(TimerKind::Connect, self.config.connect_timeout);
        self.output(tx)
    }

    fn on_response(&mut self, segment: &Segment, seq: SeqNum, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        if let SegmentKind::Response { service_code, .. } = segment.kind {
            self.check_service_code(service_code, tx)?;
        }

        self.ack_pending = Some(seq);
        self.timers.stop(TimerKind::Retransmit);
        if self.congestion_control_resolved() {
            self.establish();
        }
        else {
            debug!("response received, congestion control not yet negotiated");
            self.state = ConnectionState::Respond;
        }
        self.output(tx)
    }

    fn on_handshake_ack(&mut self, segment: &Segment, seq: SeqNum, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        self.feed_congestion_control(&segment.options);

        if self.congestion_control_resolved() {
            self.establish();
            if segment.packet_type() == PacketType::DataAck {
                self.deliver(segment);
                self.ack_pending = Some(seq);
            }
        }
        else {
            if segment.packet_type() == PacketType::DataAck {
                self.deliver(segment);
            }
            self.ack_pending = Some(seq);
        }
        self.output(tx)
    }

    fn on_data(&mut self, segment: &Segment, seq: SeqNum, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        self.feed_congestion_control(&segment.options);
        self.deliver(segment);

        self.ack_pending = Some(match self.ack_pending {
            Some(pending) if seq_gt(pending, seq) => pending,
            _ => seq,
        });
        self.data_since_ack = self.data_since_ack.saturating_add(1);
        if self.ack_ratio > 0 && self.data_since_ack >= self.ack_ratio {
            trace!("ack ratio {} reached", self.ack_ratio);
            return self.output(tx);
        }
        Ok(())
    }

    fn deliver(&mut self, segment: &Segment) {
        if self.receive_closed || segment.payload.is_empty() {
            return;
        }
        if self.receive_queue.len() >= self.config.receive_queue_limit {
            self.stats.resource_exhausted += 1;
            debug!("receive queue full - dropping {} bytes", segment.payload.len());
            return;
        }
        self.receive_queue.push_back(segment.payload.clone());
    }

    fn feed_congestion_control(&mut self, options: &[u8]) {
        if let Some(cc) = &mut self.recv_cc {
            cc.on_packet_received(options);
        }
        if let Some(cc) = &mut self.send_cc {
            cc.on_packet_received(options);
        }
    }

    fn establish(&mut self) {
        debug!("connection established");
        self.state = ConnectionState::Established;
        self.stats.connects += 1;
        self.timers.stop(TimerKind::Connect);
        self.timers.stop(TimerKind::Retransmit);
    }

    fn enter_time_wait(&mut self) {
        debug!("entering time-wait from {:?}", self.state);
        self.timers.stop(TimerKind::Retransmit);
        self.timers.stop(TimerKind::Connect);
        self.timers.stop(TimerKind::Close);
        self.send_queue.clear();
        self.ack_pending = None;
        self.state = ConnectionState::TimeWait;
        self.timers.arm(TimerKind::TimeWait, self.config.time_wait);
    }

    pub(crate) fn reply_reset(&mut self, reason: ResetReason, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        self.reset_request = Some(reason);
        self.output(tx)
    }

    fn abort_with_reset(&mut self, reason: ResetReason, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        let result = self.reply_reset(reason, tx);
        self.destroy();
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;
    use rstest::rstest;
    use crate::error::TransmitError;
    use crate::timers::TimerCommand;
    use super::*;

    /// Collects everything a connection transmits
    #[derive(Default)]
    pub(crate) struct RecordingTransmit {
        pub segments: Mutex<Vec<Bytes>>,
    }

    impl RecordingTransmit {
        pub fn take(&self) -> Vec<Segment> {
            self.segments.lock().unwrap()
                .drain(..)
                .map(|raw| Segment::decode(&raw).unwrap())
                .collect()
        }
    }

    impl SegmentTransmit for RecordingTransmit {
        fn transmit(&self, segment: &[u8]) -> Result<(), TransmitError> {
            self.segments.lock().unwrap().push(Bytes::copy_from_slice(segment));
            Ok(())
        }
    }

    const CLIENT_PORT: u16 = 5001;
    const SERVER_PORT: u16 = 7000;

    fn registry() -> Arc<CongestionControlRegistry> {
        Arc::new(CongestionControlRegistry::default())
    }

    fn client(config: DccpConfig) -> Connection {
        Connection::new_client(config, registry(), CLIENT_PORT, SERVER_PORT).with_initial_sequence(100)
    }

    fn listener(config: DccpConfig) -> Connection {
        let mut listener = Connection::new_listener(config, registry(), SERVER_PORT).with_initial_sequence(5000);
        listener.listen().unwrap();
        listener
    }

    fn encode(segment: &Segment) -> Bytes {
        segment.encode().unwrap()
    }

    fn long(raw: u64) -> SequenceField {
        SequenceField::Long(SeqNum::from_raw(raw))
    }

    fn peer_segment(seq: u64, kind: SegmentKind) -> Segment {
        Segment {
            source_port: SERVER_PORT,
            dest_port: CLIENT_PORT,
            ccval: 0,
            checksum_coverage: 0,
            sequence: long(seq),
            kind,
            options: Bytes::new(),
            payload: Bytes::new(),
        }
    }

    /// Runs the handshake between a fresh client and listener, returning both established ends
    fn handshake(client_config: DccpConfig, server_config: DccpConfig) -> (Connection, Connection, RecordingTransmit, RecordingTransmit) {
        let client_tx = RecordingTransmit::default();
        let server_tx = RecordingTransmit::default();

        let mut client = client(client_config);
        client.connect(&client_tx).unwrap();
        let request = client_tx.segments.lock().unwrap().remove(0);

        let listener = listener(server_config);
        let mut server = listener.derive_for_request(CLIENT_PORT).unwrap();
        server.on_segment(&request, &server_tx).unwrap();
        let response = server_tx.segments.lock().unwrap().remove(0);

        client.on_segment(&response, &client_tx).unwrap();
        let ack = client_tx.segments.lock().unwrap().remove(0);

        server.on_segment(&ack, &server_tx).unwrap();
        (client, server, client_tx, server_tx)
    }

    #[test]
    fn test_connect_emits_single_request() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig { service_code: 42, ..DccpConfig::default() });
        client.connect(&tx).unwrap();

        assert_eq!(client.state(), ConnectionState::Request);
        let sent = tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SegmentKind::Request { service_code: 42 });
        assert_eq!(sent[0].sequence, long(100));
        assert_eq!((sent[0].source_port, sent[0].dest_port), (CLIENT_PORT, SERVER_PORT));

        let parsed = options::parse(&sent[0].options).unwrap();
        assert_eq!(parsed.features.len(), 1);
        assert_eq!(parsed.features[0].kind, options::NegotiationKind::ChangeR);
        assert_eq!(parsed.features[0].feature, 1);
        assert_eq!(parsed.features[0].values.as_ref(), &[CongestionControlRegistry::NO_CONGESTION_CONTROL]);

        assert!(client.timers.is_armed(TimerKind::Connect));
        assert!(client.timers.is_armed(TimerKind::Retransmit));
        assert!(client.connect(&tx).is_err());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig { loss_window: 4, ..DccpConfig::default() });
        assert_eq!(client.connect(&tx), Err(DccpError::InvalidArgument("invalid configuration")));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(tx.take().is_empty());

        let mut listener = Connection::new_listener(DccpConfig { backlog: 0, ..DccpConfig::default() }, registry(), SERVER_PORT);
        assert!(listener.listen().is_err());
    }

    #[test]
    fn test_end_to_end_handshake_and_data() {
        let client_tx = RecordingTransmit::default();
        let server_tx = RecordingTransmit::default();

        let mut client = client(DccpConfig::default());
        client.connect(&client_tx).unwrap();
        let request = client_tx.segments.lock().unwrap().remove(0);

        let listener = listener(DccpConfig::default());
        let mut server = listener.derive_for_request(CLIENT_PORT).unwrap();
        server.on_segment(&request, &server_tx).unwrap();
        assert_eq!(server.state(), ConnectionState::Respond);

        let response_raw = server_tx.segments.lock().unwrap().remove(0);
        let response = Segment::decode(&response_raw).unwrap();
        assert_eq!(response.sequence, long(5000));
        assert_eq!(response.kind, SegmentKind::Response { ack: SeqNum::from_raw(100), service_code: 0 });

        client.on_segment(&response_raw, &client_tx).unwrap();
        assert_eq!(client.state(), ConnectionState::Established);
        let ack_raw = client_tx.segments.lock().unwrap().remove(0);
        let ack = Segment::decode(&ack_raw).unwrap();
        assert_eq!(ack.sequence, long(101));
        assert_eq!(ack.kind, SegmentKind::Ack { ack: long(5000) });
        assert!(client_tx.take().is_empty());

        server.on_segment(&ack_raw, &server_tx).unwrap();
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(server.negotiated_ccids(), (Some(0), Some(0)));
        assert_eq!(client.negotiated_ccids(), (Some(0), Some(0)));
        assert!(!server.timers.is_armed(TimerKind::Connect));
        assert!(!client.timers.is_armed(TimerKind::Retransmit));

        client.send(Bytes::from_static(b"first datagram"), &client_tx).unwrap();
        let data_raw = client_tx.segments.lock().unwrap().remove(0);
        let data = Segment::decode(&data_raw).unwrap();
        assert_eq!(data.sequence, long(102));
        assert_eq!(data.kind, SegmentKind::Data);

        server.on_segment(&data_raw, &server_tx).unwrap();
        assert_eq!(server.gsr(), Some(SeqNum::from_raw(102)));
        assert_eq!(server.recv(), Some(Bytes::from_static(b"first datagram")));
        assert_eq!(server.recv(), None);
    }

    #[test]
    fn test_short_sequence_numbers_after_handshake() {
        let config = DccpConfig { request_short_seqnos: true, allow_short_seqnos: true, ..DccpConfig::default() };
        let client_tx = RecordingTransmit::default();
        let server_tx = RecordingTransmit::default();

        let mut client = client(config.clone());
        client.connect(&client_tx).unwrap();
        let request = client_tx.segments.lock().unwrap().remove(0);

        let listener = listener(config);
        let mut server = listener.derive_for_request(CLIENT_PORT).unwrap();
        server.on_segment(&request, &server_tx).unwrap();
        let response_raw = server_tx.segments.lock().unwrap().remove(0);
        assert_eq!(Segment::decode(&response_raw).unwrap().sequence, long(5000));

        client.on_segment(&response_raw, &client_tx).unwrap();
        assert!(client.short_sequence && client.peer_short_sequence);
        let ack_raw = client_tx.segments.lock().unwrap().remove(0);
        let ack = Segment::decode(&ack_raw).unwrap();
        assert_eq!(ack.sequence, SequenceField::Short(101));
        assert_eq!(ack.kind, SegmentKind::Ack { ack: SequenceField::Short(5000) });

        server.on_segment(&ack_raw, &server_tx).unwrap();
        assert_eq!(server.state(), ConnectionState::Established);
        assert!(server.short_sequence && server.peer_short_sequence);
        assert_eq!(server.gsr(), Some(SeqNum::from_raw(101)));

        server.send(Bytes::from_static(b"from server"), &server_tx).unwrap();
        let data_raw = server_tx.segments.lock().unwrap().remove(0);
        let data = Segment::decode(&data_raw).unwrap();
        assert_eq!(data.sequence, SequenceField::Short(5001));
        assert_eq!(data.kind, SegmentKind::Data);

        client.on_segment(&data_raw, &client_tx).unwrap();
        assert_eq!(client.gsr(), Some(SeqNum::from_raw(5001)));
        assert_eq!(client.recv(), Some(Bytes::from_static(b"from server")));

        client.send(Bytes::from_static(b"from client"), &client_tx).unwrap();
        let sent: Vec<Bytes> = client_tx.segments.lock().unwrap().drain(..).collect();
        assert!(!sent.is_empty());
        for raw in &sent {
            assert!(Segment::decode(raw).unwrap().sequence.is_short());
            server.on_segment(raw, &server_tx).unwrap();
        }
        assert_eq!(server.gsr(), Some(client.seq_send));
        assert_eq!(server.recv(), Some(Bytes::from_static(b"from client")));
    }

    #[test]
    fn test_established_reset_goes_to_time_wait() {
        let (mut client, _server, client_tx, _) = handshake(DccpConfig::default(), DccpConfig::default());

        let reset = peer_segment(5001, SegmentKind::Reset { ack: SeqNum::from_raw(101), reason: ResetReason::Aborted, data: [0; 3] });
        client.on_segment(&encode(&reset), &client_tx).unwrap();

        assert_eq!(client.state(), ConnectionState::TimeWait);
        assert!(client.timers.is_armed(TimerKind::TimeWait));
        assert!(!client.timers.is_armed(TimerKind::Retransmit));
        assert!(client_tx.take().is_empty());

        assert_eq!(client.send(Bytes::from_static(b"late"), &client_tx), Err(DccpError::NotConnected));
        assert!(client_tx.take().is_empty());
    }

    #[test]
    fn test_service_code_mismatch_on_request() {
        let client_tx = RecordingTransmit::default();
        let server_tx = RecordingTransmit::default();

        let mut client = client(DccpConfig { service_code: 1, ..DccpConfig::default() });
        client.connect(&client_tx).unwrap();
        let request = client_tx.segments.lock().unwrap().remove(0);

        let listener = listener(DccpConfig { service_code: 2, ..DccpConfig::default() });
        let mut server = listener.derive_for_request(CLIENT_PORT).unwrap();
        assert_eq!(
            server.on_segment(&request, &server_tx),
            Err(DccpError::ServiceCodeMismatch { expected: 2, actual: 1 })
        );
        assert!(server.is_destroyed());
        assert_eq!(server.stats().service_code_mismatch, 1);

        let sent = server_tx.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].kind, SegmentKind::Reset { ack, reason: ResetReason::BadServiceCode, .. } if ack == SeqNum::from_raw(100)));

        client.on_segment(&encode(&sent[0]), &client_tx).unwrap();
        assert!(client.is_destroyed());
    }

    #[test]
    fn test_service_code_mismatch_on_response() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig { service_code: 1, ..DccpConfig::default() });
        client.connect(&tx).unwrap();
        tx.take();

        let response = peer_segment(5000, SegmentKind::Response { ack: SeqNum::from_raw(100), service_code: 9 });
        assert_eq!(
            client.on_segment(&encode(&response), &tx),
            Err(DccpError::ServiceCodeMismatch { expected: 1, actual: 9 })
        );
        assert!(client.is_destroyed());
        assert!(matches!(tx.take()[0].kind, SegmentKind::Reset { reason: ResetReason::BadServiceCode, .. }));
    }

    #[test]
    fn test_response_without_negotiated_cc_goes_to_respond() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&tx).unwrap();
        tx.take();

        let response = peer_segment(5000, SegmentKind::Response { ack: SeqNum::from_raw(100), service_code: 0 });
        client.on_segment(&encode(&response), &tx).unwrap();

        assert_eq!(client.state(), ConnectionState::Respond);
        let sent = tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SegmentKind::Ack { ack: long(5000) });
    }

    #[rstest]
    #[case::listen_gets_ack(SegmentKind::Ack { ack: long(1) }, ResetReason::NoConnection)]
    #[case::listen_gets_data(SegmentKind::Data, ResetReason::NoConnection)]
    #[case::listen_gets_close(SegmentKind::Close, ResetReason::NoConnection)]
    fn test_listen_rejects_non_request(#[case] kind: SegmentKind, #[case] reason: ResetReason) {
        let tx = RecordingTransmit::default();
        let listener = listener(DccpConfig::default());
        let mut server = listener.derive_for_request(CLIENT_PORT).unwrap();

        server.on_segment(&encode(&peer_segment(77, kind)), &tx).unwrap();

        assert!(server.is_destroyed());
        assert_eq!(server.stats().unexpected_type, 1);
        let sent = tx.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].kind, SegmentKind::Reset { ack, reason: r, .. } if r == reason && ack == SeqNum::from_raw(77)));
    }

    #[test]
    fn test_request_state_unexpected_packet() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&tx).unwrap();
        tx.take();

        client.on_segment(&encode(&peer_segment(9000, SegmentKind::Data)), &tx).unwrap();

        assert_eq!(client.state(), ConnectionState::TimeWait);
        assert_eq!(client.stats().unexpected_type, 1);
        assert!(matches!(tx.take()[0].kind, SegmentKind::Reset { reason: ResetReason::Aborted, .. }));
    }

    #[test]
    fn test_established_discards_unexpected() {
        let (mut client, _server, client_tx, _) = handshake(DccpConfig::default(), DccpConfig::default());

        let request = peer_segment(5001, SegmentKind::Request { service_code: 0 });
        client.on_segment(&encode(&request), &client_tx).unwrap();

        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(client.stats().unexpected_type, 1);
        assert!(client_tx.take().is_empty());
    }

    #[rstest]
    #[case::data(SegmentKind::Data)]
    #[case::ack(SegmentKind::Ack { ack: long(102) })]
    #[case::request(SegmentKind::Request { service_code: 0 })]
    fn test_closing_discards_unexpected(#[case] kind: SegmentKind) {
        let (mut client, _server, client_tx, _) = handshake(DccpConfig::default(), DccpConfig::default());
        client.close(&client_tx).unwrap();
        assert_eq!(client.state(), ConnectionState::ClientClose);
        client_tx.take();

        client.on_segment(&encode(&peer_segment(5001, kind)), &client_tx).unwrap();

        assert_eq!(client.state(), ConnectionState::ClientClose);
        assert_eq!(client.stats().unexpected_type, 1);
        assert!(client_tx.take().is_empty());
    }

    #[rstest]
    #[case::malformed(vec![0; 5], |s: &ConnectionStats| s.malformed)]
    #[case::out_of_window(encode(&peer_segment(900_000, SegmentKind::Data)).to_vec(), |s: &ConnectionStats| s.out_of_window)]
    fn test_drops_are_counted(#[case] raw: Vec<u8>, #[case] counter: fn(&ConnectionStats) -> u64) {
        let (mut client, _server, client_tx, _) = handshake(DccpConfig::default(), DccpConfig::default());

        assert!(client.on_segment(&raw, &client_tx).is_err());
        assert_eq!(counter(client.stats()), 1);
        assert_eq!(client.state(), ConnectionState::Established);
        assert!(client_tx.take().is_empty());
    }

    #[test]
    fn test_checksum_mismatch_is_counted() {
        let (mut client, _server, client_tx, _) = handshake(DccpConfig::default(), DccpConfig::default());

        let mut raw = encode(&Segment { payload: Bytes::from_static(b"xyz"), ..peer_segment(5001, SegmentKind::Data) }).to_vec();
        raw[18] ^= 1;
        assert_eq!(client.on_segment(&raw, &client_tx), Err(DccpError::ChecksumMismatch));
        assert_eq!(client.stats().checksum_mismatch, 1);
    }

    #[test]
    fn test_graceful_close_client_initiated() {
        let (mut client, mut server, client_tx, server_tx) = handshake(DccpConfig::default(), DccpConfig::default());

        client.close(&client_tx).unwrap();
        assert_eq!(client.state(), ConnectionState::ClientClose);
        assert!(client.timers.is_armed(TimerKind::Retransmit));
        assert!(client.timers.is_armed(TimerKind::Close));
        let close = client_tx.segments.lock().unwrap().remove(0);
        assert_eq!(Segment::decode(&close).unwrap().kind, SegmentKind::Close);

        server.on_segment(&close, &server_tx).unwrap();
        assert!(server.is_destroyed());
        let reset = server_tx.segments.lock().unwrap().remove(0);
        assert!(matches!(Segment::decode(&reset).unwrap().kind, SegmentKind::Reset { reason: ResetReason::Closed, .. }));

        client.on_segment(&reset, &client_tx).unwrap();
        assert_eq!(client.state(), ConnectionState::TimeWait);
        assert!(!client.timers.is_armed(TimerKind::Retransmit));
        assert!(client.timers.is_armed(TimerKind::TimeWait));
    }

    #[test]
    fn test_graceful_close_server_initiated() {
        let (mut client, mut server, client_tx, server_tx) = handshake(DccpConfig::default(), DccpConfig::default());

        server.close(&server_tx).unwrap();
        assert_eq!(server.state(), ConnectionState::ServerClose);
        let close_req = server_tx.segments.lock().unwrap().remove(0);
        assert_eq!(Segment::decode(&close_req).unwrap().kind, SegmentKind::CloseReq);

        client.on_segment(&close_req, &client_tx).unwrap();
        assert_eq!(client.state(), ConnectionState::ClientClose);
        let close = client_tx.segments.lock().unwrap().remove(0);

        server.on_segment(&close, &server_tx).unwrap();
        assert!(server.is_destroyed());
        let reset = server_tx.segments.lock().unwrap().remove(0);

        client.on_segment(&reset, &client_tx).unwrap();
        assert_eq!(client.state(), ConnectionState::TimeWait);
    }

    #[test]
    fn test_close_before_established_destroys() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&tx).unwrap();
        tx.take();

        client.close(&tx).unwrap();
        assert!(client.is_destroyed());
        assert!(tx.take().is_empty());
        assert!(TimerKind::ALL.iter().all(|&k| !client.timers.is_armed(k)));
    }

    #[test]
    fn test_stale_timer_is_ignored() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&tx).unwrap();
        tx.take();

        let commands = client.timers.take_commands();
        let connect_epoch = commands.iter().find_map(|c| match c {
            TimerCommand::Arm { kind: TimerKind::Connect, epoch, .. } => Some(*epoch),
            _ => None,
        }).unwrap();

        let response = peer_segment(5000, SegmentKind::Response { ack: SeqNum::from_raw(100), service_code: 0 });
        let response = Segment {
            options: Bytes::from_static(&[options::CONFIRM_L, 4, 1, 0, options::CHANGE_R, 4, 1, 0]),
            ..response
        };
        client.on_segment(&encode(&response), &tx).unwrap();
        assert_eq!(client.state(), ConnectionState::Established);
        tx.take();

        client.on_timer(TimerKind::Connect, connect_epoch, &tx).unwrap();
        assert_eq!(client.state(), ConnectionState::Established);
        assert!(!client.is_destroyed());
        assert!(tx.take().is_empty());
    }

    #[test]
    fn test_retransmit_backs_off() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&tx).unwrap();
        tx.take();
        client.timers.take_commands();

        for (epoch, expected) in [(1, 4), (2, 8), (3, 16)] {
            client.on_timer(TimerKind::Retransmit, epoch, &tx).unwrap();
            let sent = tx.take();
            assert_eq!(sent.len(), 1);
            assert!(matches!(sent[0].kind, SegmentKind::Request { .. }));
            assert_eq!(client.timers.take_commands(), vec![
                TimerCommand::Arm { kind: TimerKind::Retransmit, epoch: epoch + 1, delay: Duration::from_secs(expected) },
            ]);
        }
        assert_eq!(client.state(), ConnectionState::Request);
    }

    #[test]
    fn test_connect_timeout_destroys() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&tx).unwrap();

        client.on_timer(TimerKind::Connect, 1, &tx).unwrap();
        assert!(client.is_destroyed());
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_close_timer_on_server_sends_reset_and_destroys() {
        let (_client, mut server, _, server_tx) = handshake(DccpConfig::default(), DccpConfig::default());
        server.close(&server_tx).unwrap();
        server_tx.take();
        let epoch = server.timers.take_commands().iter().rev().find_map(|c| match c {
            TimerCommand::Arm { kind: TimerKind::Close, epoch, .. } => Some(*epoch),
            _ => None,
        }).unwrap();

        server.on_timer(TimerKind::Close, epoch, &server_tx).unwrap();
        assert!(server.is_destroyed());
        assert!(matches!(server_tx.take()[0].kind, SegmentKind::Reset { reason: ResetReason::Closed, .. }));
    }

    #[test]
    fn test_time_wait_answers_with_reset() {
        let (mut client, _server, client_tx, _) = handshake(DccpConfig::default(), DccpConfig::default());
        let reset = peer_segment(5001, SegmentKind::Reset { ack: SeqNum::from_raw(101), reason: ResetReason::Aborted, data: [0; 3] });
        client.on_segment(&encode(&reset), &client_tx).unwrap();

        client.on_segment(&encode(&peer_segment(5002, SegmentKind::Data)), &client_tx).unwrap();
        assert!(matches!(client_tx.take()[0].kind, SegmentKind::Reset { reason: ResetReason::NoConnection, .. }));

        let reset = peer_segment(5003, SegmentKind::Reset { ack: SeqNum::from_raw(101), reason: ResetReason::Aborted, data: [0; 3] });
        client.on_segment(&encode(&reset), &client_tx).unwrap();
        assert!(client_tx.take().is_empty());
    }

    #[test]
    fn test_duplicate_request_resends_response() {
        let client_tx = RecordingTransmit::default();
        let server_tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&client_tx).unwrap();
        let request = client_tx.segments.lock().unwrap().remove(0);

        let listener = listener(DccpConfig::default());
        let mut server = listener.derive_for_request(CLIENT_PORT).unwrap();
        server.on_segment(&request, &server_tx).unwrap();
        server_tx.take();

        client.on_timer(TimerKind::Retransmit, 1, &client_tx).unwrap();
        let second_request = client_tx.segments.lock().unwrap().remove(0);
        server.on_segment(&second_request, &server_tx).unwrap();

        let sent = server_tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SegmentKind::Response { ack: SeqNum::from_raw(101), service_code: 0 });
        assert_eq!(sent[0].sequence, long(5001));
        assert_eq!(server.state(), ConnectionState::Respond);
    }

    #[test]
    fn test_request_payload_is_discarded() {
        let tx = RecordingTransmit::default();
        let listener = listener(DccpConfig::default());
        let mut server = listener.derive_for_request(CLIENT_PORT).unwrap();

        let request = Segment {
            payload: Bytes::from_static(b"early"),
            ..peer_segment(100, SegmentKind::Request { service_code: 0 })
        };
        server.on_segment(&encode(&request), &tx).unwrap();

        assert_eq!(server.recv(), None);
        let parsed = options::parse(&tx.take()[0].options).unwrap();
        assert!(parsed.data_discard);
    }

    #[test]
    fn test_large_datagram_is_split() {
        let (mut client, mut server, client_tx, server_tx) = handshake(
            DccpConfig { max_segment_size: 100, ..DccpConfig::default() },
            DccpConfig::default(),
        );

        client.send(Bytes::from(vec![7u8; 250]), &client_tx).unwrap();
        let sent: Vec<Bytes> = client_tx.segments.lock().unwrap().drain(..).collect();
        assert!(sent.len() > 1);
        assert!(sent.iter().all(|s| s.len() <= 100));

        let mut received = Vec::new();
        for raw in &sent {
            server.on_segment(raw, &server_tx).unwrap();
        }
        while let Some(part) = server.recv() {
            received.extend_from_slice(&part);
        }
        assert_eq!(received, vec![7u8; 250]);
    }

    #[test]
    fn test_send_queue_limit() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig { max_queued_packets: 2, ..DccpConfig::default() });
        assert_eq!(client.send(Bytes::from_static(b"a"), &tx), Err(DccpError::NotConnected));

        client.connect(&tx).unwrap();
        client.send(Bytes::from_static(b"a"), &tx).unwrap();
        client.send(Bytes::from_static(b"b"), &tx).unwrap();
        assert_eq!(client.send(Bytes::from_static(b"c"), &tx), Err(DccpError::ResourceExhausted("send queue full")));
        assert_eq!(tx.take().len(), 1);
    }

    #[test]
    fn test_data_queued_during_handshake_goes_out_with_ack() {
        let tx = RecordingTransmit::default();
        let mut client = client(DccpConfig::default());
        client.connect(&tx).unwrap();
        client.send(Bytes::from_static(b"queued"), &tx).unwrap();
        tx.take();

        let response = Segment {
            options: Bytes::from_static(&[options::CONFIRM_L, 4, 1, 0, options::CHANGE_R, 4, 1, 0]),
            ..peer_segment(5000, SegmentKind::Response { ack: SeqNum::from_raw(100), service_code: 0 })
        };
        client.on_segment(&encode(&response), &tx).unwrap();

        let sent = tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SegmentKind::DataAck { ack: long(5000) });
        assert_eq!(sent[0].payload.as_ref(), b"queued");
    }

    #[test]
    fn test_ack_ratio_triggers_ack() {
        let (mut client, mut server, client_tx, server_tx) = handshake(DccpConfig::default(), DccpConfig::default());

        client.send(Bytes::from_static(b"one"), &client_tx).unwrap();
        client.send(Bytes::from_static(b"two"), &client_tx).unwrap();
        for raw in client_tx.segments.lock().unwrap().drain(..) {
            server.on_segment(&raw, &server_tx).unwrap();
        }

        let sent = server_tx.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SegmentKind::Ack { ack: long(103) });
    }

    #[rstest]
    #[case::ccid_unknown(SocketOption::Ccid(7), false)]
    #[case::ccid_registered(SocketOption::Ccid(0), true)]
    #[case::coverage(SocketOption::ChecksumCoverage(15), true)]
    #[case::coverage_too_big(SocketOption::ChecksumCoverage(16), false)]
    #[case::mss_smaller(SocketOption::MaxSegmentSize(500), true)]
    #[case::mss_bigger(SocketOption::MaxSegmentSize(1500), false)]
    #[case::mss_zero(SocketOption::MaxSegmentSize(0), false)]
    #[case::mss_no_room_for_payload(SocketOption::MaxSegmentSize(16), false)]
    #[case::mss_minimal(SocketOption::MaxSegmentSize(MIN_SEGMENT_SIZE), true)]
    #[case::service_code(SocketOption::ServiceCode(0xdead_beef), true)]
    fn test_set_option(#[case] option: SocketOption, #[case] accepted: bool) {
        let mut client = client(DccpConfig::default());
        assert_eq!(client.set_option(option).is_ok(), accepted);

        let kind = match option {
            SocketOption::Ccid(_) => SocketOptionKind::Ccid,
            SocketOption::ChecksumCoverage(_) => SocketOptionKind::ChecksumCoverage,
            SocketOption::MaxSegmentSize(_) => SocketOptionKind::MaxSegmentSize,
            SocketOption::ServiceCode(_) => SocketOptionKind::ServiceCode,
        };
        assert_eq!(client.get_option(kind) == option, accepted);
    }

    #[test]
    fn test_negotiation_disabled_installs_no_op() {
        let config = DccpConfig { feature_negotiation: false, ..DccpConfig::default() };
        let (client, server, _, _) = handshake(config.clone(), config);
        assert_eq!(client.state(), ConnectionState::Established);
        assert_eq!(server.state(), ConnectionState::Established);
        assert_eq!(client.negotiated_ccids(), (Some(0), Some(0)));
    }

    #[test]
    fn test_refuse_answers_with_reset() {
        let tx = RecordingTransmit::default();
        let listener = listener(DccpConfig::default());
        let mut refused = listener.derive_for_request(CLIENT_PORT).unwrap();

        let request = peer_segment(300, SegmentKind::Request { service_code: 0 });
        refused.refuse(&encode(&request), ResetReason::TooBusy, &tx).unwrap();

        assert!(refused.is_destroyed());
        assert!(matches!(tx.take()[0].kind, SegmentKind::Reset { ack, reason: ResetReason::TooBusy, .. } if ack == SeqNum::from_raw(300)));
    }
}
