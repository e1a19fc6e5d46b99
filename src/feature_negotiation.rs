//! Feature negotiation with Change and Confirm options.
//!
//! Change-L / Confirm-R refer to a feature located at the sender of the Change, Change-R /
//!  Confirm-L to one located at its receiver. A Change is answered with a Confirm carrying the
//!  value this endpoint settled on, or an empty Confirm if it does not know the feature or cannot
//!  accept the value. Changes initiated here are repeated until the matching Confirm arrives.

use std::sync::Arc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, trace, warn};
use crate::ack_vector::AckVector;
use crate::congestion_control::{ActiveCongestionControl, Direction};
use crate::connection::Connection;
use crate::error::DccpError;
use crate::options::{FeatureOption, NegotiationKind, CHANGE_L, CHANGE_R, CONFIRM_L, CONFIRM_R};

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Feature {
    Ccid = 1,
    ShortSeqnos = 2,
    SequenceWindow = 3,
    AckRatio = 5,
    SendAckVector = 6,
}

/// Where a feature lives, seen from this endpoint
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Location {
    Local,
    Remote,
}

impl Location {
    fn confirm_type(&self) -> u8 {
        match self {
            Location::Local => CONFIRM_L,
            Location::Remote => CONFIRM_R,
        }
    }

    fn change_type(&self) -> u8 {
        match self {
            Location::Local => CHANGE_L,
            Location::Remote => CHANGE_R,
        }
    }
}

const MIN_SEQUENCE_WINDOW: u64 = 32;

fn big_endian(values: &[u8], max_len: usize) -> Option<u64> {
    if values.is_empty() || values.len() > max_len {
        return None;
    }
    Some(values.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
}

fn boolean(values: &[u8]) -> Option<bool> {
    match values {
        [0] => Some(false),
        [1] => Some(true),
        _ => None,
    }
}

impl Connection {
    /// Queues the Change options this endpoint starts negotiation with
    pub(crate) fn initiate_feature_changes(&mut self) -> Result<(), DccpError> {
        if self.config.feature_negotiation && self.recv_cc.is_none() {
            let offered = self.registry.offered(self.config.preferred_ccid);
            trace!("offering CCIDs {:?}", offered);
            self.pending.add_feature(CHANGE_R, Feature::Ccid.into(), &offered)?;
        }
        if self.config.request_ack_vector {
            self.pending.add_feature(CHANGE_R, Feature::SendAckVector.into(), &[1])?;
        }
        if self.config.request_short_seqnos {
            self.pending.add_feature(CHANGE_R, Feature::ShortSeqnos.into(), &[1])?;
        }
        Ok(())
    }

    pub(crate) fn negotiate_features(&mut self, features: &[FeatureOption]) -> Result<(), DccpError> {
        for option in features {
            let (location, is_change) = match option.kind {
                NegotiationKind::ChangeR => (Location::Local, true),
                NegotiationKind::ChangeL => (Location::Remote, true),
                NegotiationKind::ConfirmL => (Location::Remote, false),
                NegotiationKind::ConfirmR => (Location::Local, false),
            };

            let feature = match Feature::try_from(option.feature) {
                Ok(feature) => feature,
                Err(_) => {
                    debug!("unknown feature {} in {:?}", option.feature, option.kind);
                    if is_change {
                        self.pending.add_confirm(location.confirm_type(), option.feature, &[])?;
                    }
                    continue;
                }
            };

            if is_change {
                let confirmed = self.apply_feature(feature, location, &option.values, true)?;
                let value = confirmed.as_deref().unwrap_or(&[]);
                self.pending.add_confirm(location.confirm_type(), option.feature, value)?;
            }
            else {
                self.pending.remove_feature(location.change_type(), option.feature);
                if option.values.is_empty() {
                    if feature == Feature::Ccid && self.cc_slot(location).is_none() {
                        warn!("peer supports none of the offered CCIDs");
                        return Err(DccpError::FeatureNegotiationFailed { feature: option.feature });
                    }
                    debug!("peer rejected {:?} at {:?}", feature, location);
                    continue;
                }
                if self.apply_feature(feature, location, &option.values, false)?.is_none() {
                    debug!("ignoring invalid confirm for {:?}: {:?}", feature, option.values);
                }
            }
        }
        Ok(())
    }

    fn cc_slot(&self, location: Location) -> Option<&ActiveCongestionControl> {
        match location {
            Location::Local => self.send_cc.as_ref(),
            Location::Remote => self.recv_cc.as_ref(),
        }
    }

    /// Sets a feature to a value received from the peer. Returns the value that is now in
    ///  effect, or `None` if the value is not acceptable.
    fn apply_feature(&mut self, feature: Feature, location: Location, values: &[u8], is_change: bool) -> Result<Option<Vec<u8>>, DccpError> {
        match feature {
            Feature::Ccid => self.apply_ccid(location, values, is_change).map(|ccid| Some(vec![ccid])),
            Feature::SendAckVector => {
                let Some(enabled) = boolean(values) else { return Ok(None) };
                match location {
                    Location::Local if enabled => {
                        if self.ack_vector.is_none() {
                            match AckVector::new(self.config.ack_vector_initial_cells, self.config.ack_vector_max_cells) {
                                Ok(ack_vector) => self.ack_vector = Some(ack_vector),
                                Err(e) => {
                                    warn!("cannot allocate ack vector: {}", e);
                                    self.stats.resource_exhausted += 1;
                                    return Ok(Some(vec![0]));
                                }
                            }
                        }
                    }
                    Location::Local => {
                        self.ack_vector = None;
                        self.ack_vector_in_flight = None;
                    }
                    Location::Remote => self.remote_ack_vector = enabled,
                }
                Ok(Some(vec![enabled as u8]))
            }
            Feature::ShortSeqnos => {
                let Some(enabled) = boolean(values) else { return Ok(None) };
                match location {
                    Location::Local => {
                        self.short_sequence = enabled && self.config.allow_short_seqnos;
                        Ok(Some(vec![self.short_sequence as u8]))
                    }
                    Location::Remote => {
                        self.peer_short_sequence = enabled;
                        Ok(Some(vec![enabled as u8]))
                    }
                }
            }
            Feature::AckRatio => {
                let ratio = match big_endian(values, 2) {
                    Some(ratio) if ratio > 0 => ratio as u16,
                    _ => return Ok(None),
                };
                if location == Location::Remote {
                    self.ack_ratio = ratio;
                }
                Ok(Some(ratio.to_be_bytes().to_vec()))
            }
            Feature::SequenceWindow => {
                let window = match big_endian(values, 6) {
                    Some(window) if window >= MIN_SEQUENCE_WINDOW => window,
                    _ => return Ok(None),
                };
                if location == Location::Local {
                    self.tracker.loss_window = window;
                }
                Ok(Some(values.to_vec()))
            }
        }
    }

    /// A Change carries the peer's preference list and we pick from it. A Confirm carries the
    ///  value the peer settled on first.
    fn apply_ccid(&mut self, location: Location, values: &[u8], is_change: bool) -> Result<u8, DccpError> {
        let failed = DccpError::FeatureNegotiationFailed { feature: Feature::Ccid.into() };

        let candidates = if is_change { values } else { &values[..1] };
        if let Some(existing) = self.cc_slot(location).map(|cc| cc.ccid()) {
            if is_change || candidates[0] == existing {
                return Ok(existing);
            }
            warn!("peer confirmed CCID {} but {} is active", candidates[0], existing);
            return Err(failed);
        }

        let ccid = self.registry.choose(candidates, self.config.preferred_ccid)
            .ok_or(failed.clone())?;
        let algorithm = self.registry.get(ccid)
            .map(Arc::clone)
            .ok_or(failed.clone())?;

        let direction = match location {
            Location::Local => Direction::Send,
            Location::Remote => Direction::Receive,
        };
        let active = ActiveCongestionControl::init(ccid, direction, algorithm)
            .map_err(|e| {
                warn!("CCID {} failed to initialize: {}", ccid, e);
                failed
            })?;

        match location {
            Location::Local => self.send_cc = Some(active),
            Location::Remote => self.recv_cc = Some(active),
        }
        Ok(ccid)
    }
}
