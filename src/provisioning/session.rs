//! Per-attempt provisioning state.
//!
//! The session is mutated only by [`ProvisioningSession::dispatch`], which
//! classifies inbound packets, and by the step driver when a step begins or
//! ends. Each step starts from a clean outcome and an empty payload buffer.

use super::topics::{match_topic, Disposition, StepKind, TopicSet};
use crate::transport::{Inbound, PacketCategory};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("response payload of {len} bytes exceeds {capacity} byte buffer")]
    PayloadTooLarge { len: usize, capacity: usize },
    #[error("{active} still in flight; cannot start {requested}")]
    Busy {
        active: StepKind,
        requested: StepKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotReceived,
    Accepted,
    Rejected,
}

/// Named result of classifying one inbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    CsrAccepted,
    CsrRejected,
    RegisterAccepted,
    RegisterRejected,
    Unmatched,
}

impl Classification {
    fn from_parts(step: StepKind, disposition: Disposition) -> Self {
        match (step, disposition) {
            (StepKind::CreateCertificateFromCsr, Disposition::Accepted) => Self::CsrAccepted,
            (StepKind::CreateCertificateFromCsr, Disposition::Rejected) => Self::CsrRejected,
            (StepKind::RegisterThing, Disposition::Accepted) => Self::RegisterAccepted,
            (StepKind::RegisterThing, Disposition::Rejected) => Self::RegisterRejected,
        }
    }
}

/// Fixed-capacity copy of the last response body. Never truncates.
#[derive(Debug, Clone)]
pub struct PayloadBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl PayloadBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn store(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if bytes.len() > self.capacity {
            return Err(SessionError::PayloadTooLarge {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        self.data.clear();
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Clone)]
struct ActiveStep {
    kind: StepKind,
    topics: TopicSet,
}

#[derive(Debug)]
pub struct ProvisioningSession {
    last_packet: Option<PacketCategory>,
    last_outcome: Outcome,
    last_suback: Option<bool>,
    last_unmatched_topic: Option<String>,
    payload: PayloadBuffer,
    active: Option<ActiveStep>,
    subscriptions: Vec<String>,
    stray_publishes: u32,
    duplicate_responses: u32,
}

impl ProvisioningSession {
    pub fn new(payload_capacity: usize) -> Self {
        Self {
            last_packet: None,
            last_outcome: Outcome::NotReceived,
            last_suback: None,
            last_unmatched_topic: None,
            payload: PayloadBuffer::with_capacity(payload_capacity),
            active: None,
            subscriptions: Vec::new(),
            stray_publishes: 0,
            duplicate_responses: 0,
        }
    }

    /// Mark `kind` in flight. Only one step may be in flight at a time.
    pub fn begin_step(&mut self, kind: StepKind, topics: TopicSet) -> Result<(), SessionError> {
        if let Some(active) = &self.active {
            return Err(SessionError::Busy {
                active: active.kind,
                requested: kind,
            });
        }
        self.last_outcome = Outcome::NotReceived;
        self.last_suback = None;
        self.last_unmatched_topic = None;
        self.payload.clear();
        self.active = Some(ActiveStep { kind, topics });
        Ok(())
    }

    pub fn finish_step(&mut self) {
        self.active = None;
    }

    pub fn active_step(&self) -> Option<StepKind> {
        self.active.as_ref().map(|a| a.kind)
    }

    pub fn reset_last_packet(&mut self) {
        self.last_packet = None;
    }

    pub fn last_packet(&self) -> Option<PacketCategory> {
        self.last_packet
    }

    pub fn last_outcome(&self) -> Outcome {
        self.last_outcome
    }

    pub fn last_suback(&self) -> Option<bool> {
        self.last_suback
    }

    pub fn last_unmatched_topic(&self) -> Option<&str> {
        self.last_unmatched_topic.as_deref()
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn stray_publishes(&self) -> u32 {
        self.stray_publishes
    }

    pub fn duplicate_responses(&self) -> u32 {
        self.duplicate_responses
    }

    pub fn record_subscriptions(&mut self, filters: &[String]) {
        for filter in filters {
            if !self.subscriptions.contains(filter) {
                self.subscriptions.push(filter.clone());
            }
        }
    }

    pub fn drop_subscription(&mut self, filter: &str) {
        self.subscriptions.retain(|f| f != filter);
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Feed one inbound packet into the session.
    ///
    /// Returns the classification for publishes. A payload larger than the
    /// buffer is the only fatal condition.
    pub fn dispatch(&mut self, inbound: &Inbound) -> Result<Option<Classification>, SessionError> {
        self.last_packet = Some(inbound.category());
        match inbound {
            Inbound::SubAck { granted } => {
                self.last_suback = Some(*granted);
                Ok(None)
            }
            Inbound::Publish { topic, payload } => self.classify(topic, payload).map(Some),
            other => {
                debug!("inbound {}", other.category());
                Ok(None)
            }
        }
    }

    fn classify(&mut self, topic: &str, payload: &Bytes) -> Result<Classification, SessionError> {
        let disposition = self
            .active
            .as_ref()
            .and_then(|active| active.topics.disposition_of(topic).map(|d| (active.kind, d)));
        let Some((kind, disposition)) = disposition else {
            self.stray_publishes += 1;
            self.last_unmatched_topic = Some(topic.to_string());
            match match_topic(topic) {
                Some(m) => warn!(
                    "ignoring {} response for {:?} outside its step on {}",
                    m.step, m.disposition, topic
                ),
                None => warn!("ignoring publish on unexpected topic {}", topic),
            }
            return Ok(Classification::Unmatched);
        };

        if self.last_outcome != Outcome::NotReceived {
            self.duplicate_responses += 1;
            warn!("duplicate {} response on {} ignored", kind, topic);
            return Ok(Classification::from_parts(kind, disposition));
        }

        match disposition {
            Disposition::Accepted => {
                self.payload.store(payload)?;
                self.last_outcome = Outcome::Accepted;
                info!("{} accepted ({} bytes)", kind, payload.len());
            }
            Disposition::Rejected => {
                // Kept for diagnostics; a too-large rejection body is not fatal.
                if self.payload.store(payload).is_err() {
                    self.payload.clear();
                }
                self.last_outcome = Outcome::Rejected;
                warn!("{} rejected on {}", kind, topic);
            }
        }
        Ok(Classification::from_parts(kind, disposition))
    }
}
