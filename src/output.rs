use std::cmp::min;
use bytes::Bytes;
use tracing::{error, trace, warn};
use crate::connection::{Connection, ConnectionState, Role};
use crate::error::DccpError;
use crate::options;
use crate::packet_header::{ResetReason, Segment, SegmentKind};
use crate::seq::{SeqNum, SequenceField};
use crate::transmit::SegmentTransmit;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Outgoing {
    Reset(ResetReason),
    Request,
    Response,
    Ack,
    DataAck,
    Data,
    Close,
    CloseReq,
}

impl Outgoing {
    /// control segments go out once per output pass, acks and data until there is nothing left
    fn continues(&self) -> bool {
        matches!(self, Outgoing::Ack | Outgoing::DataAck | Outgoing::Data)
    }

    fn carries_data(&self) -> bool {
        matches!(self, Outgoing::DataAck | Outgoing::Data)
    }

    fn allows_short_sequence(&self) -> bool {
        !matches!(self, Outgoing::Reset(_) | Outgoing::Request | Outgoing::Response)
    }
}

/// A segment ready for the transmit collaborator, with what to commit once it is out
struct Assembled {
    outgoing: Outgoing,
    segment: Segment,
    raw: Bytes,
    ack: SeqNum,
    ack_vector_sent: bool,
}

impl Connection {
    /// Emits whatever the current state calls for: a pending Reset, the handshake or teardown
    ///  segment for the state, or acks and queued data. Data is subject to the sending
    ///  congestion control.
    pub(crate) fn output(&mut self, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        while let Some(outgoing) = self.select_outgoing() {
            let outgoing = if outgoing.carries_data() {
                let pending_bytes = self.send_queue.front().map(|d| d.len()).unwrap_or(0);
                let permitted = self.send_cc.as_mut()
                    .map(|cc| cc.may_send(pending_bytes))
                    .unwrap_or(true);

                match (permitted, outgoing) {
                    (true, _) => outgoing,
                    (false, Outgoing::DataAck) => {
                        trace!("congestion control holds back data - sending plain ack");
                        Outgoing::Ack
                    }
                    (false, _) => {
                        trace!("congestion control holds back data");
                        return Ok(());
                    }
                }
            }
            else {
                outgoing
            };

            self.transmit_one(outgoing, tx)?;
            if !outgoing.continues() {
                break;
            }
        }
        Ok(())
    }

    fn select_outgoing(&mut self) -> Option<Outgoing> {
        if let Some(reason) = self.reset_request.take() {
            return Some(Outgoing::Reset(reason));
        }
        if self.destroyed {
            return None;
        }

        use ConnectionState::*;
        match (self.role, self.state) {
            (Role::Client, Closed) => {
                self.state = Request;
                Some(Outgoing::Request)
            }
            (Role::Client, Request) => Some(Outgoing::Request),
            (Role::Server, Request) => {
                self.state = Respond;
                Some(Outgoing::Response)
            }
            (Role::Server, Respond) if self.retransmit_response => {
                self.retransmit_response = false;
                Some(Outgoing::Response)
            }
            (_, Respond) if self.ack_pending.is_some() => Some(Outgoing::Ack),
            (_, Established) => match (self.ack_pending.is_some(), !self.send_queue.is_empty()) {
                (true, true) => Some(Outgoing::DataAck),
                (true, false) => Some(Outgoing::Ack),
                (false, true) => Some(Outgoing::Data),
                (false, false) => None,
            },
            (_, ClientClose) => Some(Outgoing::Close),
            (_, ServerClose) => Some(Outgoing::CloseReq),
            _ => None,
        }
    }

    /// Sends one segment. Sequence number, pending ack and one-shot options only change once
    ///  the transmit collaborator has accepted the segment.
    fn transmit_one(&mut self, outgoing: Outgoing, tx: &dyn SegmentTransmit) -> Result<(), DccpError> {
        let one_shot_mark = self.pending.one_shot_len();

        let assembled = match self.assemble(outgoing) {
            Ok(Some(assembled)) => assembled,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.pending.truncate_one_shot(one_shot_mark);
                return Err(e);
            }
        };

        if let Err(e) = tx.transmit(&assembled.raw) {
            error!("failed to transmit {:?}: {}", assembled.outgoing, e);
            self.pending.truncate_one_shot(one_shot_mark);
            if assembled.outgoing == Outgoing::Response {
                self.retransmit_response = true;
            }
            return Err(e.into());
        }

        let Assembled { outgoing, segment, raw, ack, ack_vector_sent } = assembled;
        trace!("sent {:?} with sequence number {:?}", segment.kind, segment.sequence);

        self.seq_send = self.seq_send + 1;
        self.pending.clear_one_shot();
        self.stats.packets_out += 1;
        self.stats.bytes_out += raw.len() as u64;
        match outgoing {
            Outgoing::Ack | Outgoing::DataAck => {
                self.ack_pending = None;
                self.data_since_ack = 0;
            }
            Outgoing::Reset(_) => self.stats.resets_sent += 1,
            _ => {}
        }
        if ack_vector_sent {
            self.ack_vector_in_flight = Some((self.seq_send, ack));
        }

        if outgoing.carries_data() {
            self.trim_send_queue(segment.payload.len());
            let more_queued = !self.send_queue.is_empty();
            if let Some(cc) = &mut self.send_cc {
                cc.on_send_complete(more_queued, segment.payload.len());
            }
        }
        Ok(())
    }

    /// Builds and encodes the segment without changing anything but the one-shot option
    ///  buffer. Returns `None` if there turned out to be nothing to send.
    fn assemble(&mut self, mut outgoing: Outgoing) -> Result<Option<Assembled>, DccpError> {
        let seq = self.seq_send + 1;
        let short = self.short_sequence && outgoing.allows_short_sequence();

        let ack = match outgoing {
            Outgoing::Ack | Outgoing::DataAck => self.ack_pending.or(self.seq_recv).unwrap_or_default(),
            _ => self.seq_recv.unwrap_or_default(),
        };

        let ack_vector_sent = matches!(outgoing, Outgoing::Ack | Outgoing::DataAck) && self.attach_ack_vector(ack);
        let options = self.pending.block();

        let mut room = 0;
        while outgoing.carries_data() {
            let header_len = Segment::fixed_header_len(&self.segment_kind(outgoing, ack, short), short) + options.len();
            room = self.config.max_segment_size.saturating_sub(header_len);
            if room > 0 {
                break;
            }

            warn!("no room for payload within a maximum segment size of {} - dropping datagram", self.config.max_segment_size);
            self.stats.resource_exhausted += 1;
            self.send_queue.pop_front();
            if outgoing == Outgoing::Data {
                return Ok(None);
            }
            outgoing = Outgoing::Ack;
        }

        let payload = if outgoing.carries_data() {
            let front = self.send_queue.front().cloned().unwrap_or_default();
            front.slice(..min(room, front.len()))
        }
        else {
            Bytes::new()
        };

        let segment = Segment {
            source_port: self.local_port,
            dest_port: self.remote_port,
            ccval: 0,
            checksum_coverage: self.config.checksum_coverage,
            sequence: SequenceField::for_mode(seq, short),
            kind: self.segment_kind(outgoing, ack, short),
            options,
            payload,
        };
        let raw = segment.encode()?;

        Ok(Some(Assembled { outgoing, segment, raw, ack, ack_vector_sent }))
    }

    fn segment_kind(&self, outgoing: Outgoing, ack: SeqNum, short: bool) -> SegmentKind {
        match outgoing {
            Outgoing::Reset(reason) => SegmentKind::Reset { ack, reason, data: [0; 3] },
            Outgoing::Request => SegmentKind::Request { service_code: self.config.service_code },
            Outgoing::Response => SegmentKind::Response { ack, service_code: self.config.service_code },
            Outgoing::Ack => SegmentKind::Ack { ack: SequenceField::for_mode(ack, short) },
            Outgoing::DataAck => SegmentKind::DataAck { ack: SequenceField::for_mode(ack, short) },
            Outgoing::Data => SegmentKind::Data,
            Outgoing::Close => SegmentKind::Close,
            Outgoing::CloseReq => SegmentKind::CloseReq,
        }
    }

    /// Adds the receive history up to `ack` to the pending options. Returns whether it was
    ///  added.
    fn attach_ack_vector(&mut self, ack: SeqNum) -> bool {
        let Some(ack_vector) = &self.ack_vector else { return false };

        let encoded = ack_vector.encode(ack);
        if encoded.is_empty() {
            return false;
        }
        match self.pending.add_option(options::ACK_VECTOR_0, &encoded) {
            Ok(()) => true,
            Err(e) => {
                trace!("not sending ack vector: {}", e);
                false
            }
        }
    }

    fn trim_send_queue(&mut self, sent: usize) {
        if let Some(front) = self.send_queue.front_mut() {
            if sent >= front.len() {
                self.send_queue.pop_front();
            }
            else {
                *front = front.slice(sent..);
            }
        }
    }
}
