//! Common test harness utilities for integration tests.
//!
//! This module provides:
//! - A scripted in-memory broker implementing the engine traits
//! - A clock that records backoff pauses instead of sleeping
//! - Deterministic and failing entropy sources
//! - An in-memory key store
//! - CBOR payload builders for service responses

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use fleetprov::keystore::{CsrArtifact, IdentityRecord, KeyHandle, KeyStore, KeyStoreError};
use fleetprov::provisioning::{
    Backoff, EntropyError, EntropySource, PayloadFormat, ProvisioningPlan, Provisioner,
    RetryPolicy, StandardCodec, StepSettings, StrayPublishPolicy, WaitBudget,
};
use fleetprov::time::Clock;
use fleetprov::transport::{ConnectRequest, Connector, EngineError, Inbound, PubSubLink};
use minicbor::Encoder;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const TEMPLATE: &str = "FleetTemplate";
pub const CLIENT_ID: &str = "SN-0001";

// -----------------------------------------------------------------------------
// Scripted broker
// -----------------------------------------------------------------------------

/// Everything the fake broker observed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Connect(String),
    Subscribe(Vec<String>),
    Publish(String, Vec<u8>),
    Unsubscribe(String),
    Disconnect,
}

#[derive(Debug, Default)]
struct BrokerState {
    ops: Vec<Op>,
    connect_failures: VecDeque<EngineError>,
    suback_refusals: u32,
    replies: HashMap<String, VecDeque<Vec<Inbound>>>,
    queue: VecDeque<Inbound>,
    polls: u32,
    fail_poll_at: Option<u32>,
    fail_disconnect: bool,
    connected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FakeBroker(Arc<Mutex<BrokerState>>);

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector(self.clone())
    }

    /// Fail the next connect attempts with these errors, in order.
    pub fn fail_connects(&self, errors: Vec<EngineError>) {
        self.0.lock().unwrap().connect_failures.extend(errors);
    }

    /// Answer the next `n` SUBSCRIBEs with a refused SUBACK.
    pub fn refuse_subacks(&self, n: u32) {
        self.0.lock().unwrap().suback_refusals = n;
    }

    /// Queue `replies` after the PUBACK of the next publish to `topic`.
    pub fn reply_to(&self, topic: &str, replies: Vec<Inbound>) {
        self.0
            .lock()
            .unwrap()
            .replies
            .entry(topic.to_string())
            .or_default()
            .push_back(replies);
    }

    /// Fail the `n`-th poll (1-based, counted across the whole run) with a transport error.
    pub fn fail_poll_at(&self, n: u32) {
        self.0.lock().unwrap().fail_poll_at = Some(n);
    }

    /// Close the link but report the DISCONNECT as failed.
    pub fn fail_disconnect(&self) {
        self.0.lock().unwrap().fail_disconnect = true;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.0.lock().unwrap().ops.clone()
    }

    pub fn polls(&self) -> u32 {
        self.0.lock().unwrap().polls
    }

    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.0.lock().unwrap().ops.iter().filter(|op| pred(op)).count()
    }

    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.0
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Publish(t, payload) if t == topic => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct FakeConnector(FakeBroker);

#[async_trait]
impl Connector for FakeConnector {
    type Link = FakeLink;

    async fn connect(&self, request: &ConnectRequest) -> Result<FakeLink, EngineError> {
        let mut state = (self.0).0.lock().unwrap();
        state.ops.push(Op::Connect(request.client_id.clone()));
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        state.connected = true;
        state.queue.clear();
        Ok(FakeLink(self.0.clone()))
    }
}

#[derive(Debug)]
pub struct FakeLink(FakeBroker);

impl FakeLink {
    fn with<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let mut state = (self.0).0.lock().unwrap();
        f(&mut state)
    }
}

#[async_trait]
impl PubSubLink for FakeLink {
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), EngineError> {
        self.with(|s| {
            s.ops.push(Op::Subscribe(filters.to_vec()));
            let granted = if s.suback_refusals > 0 {
                s.suback_refusals -= 1;
                false
            } else {
                true
            };
            s.queue.push_back(Inbound::SubAck { granted });
            Ok(())
        })
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), EngineError> {
        self.with(|s| {
            s.ops.push(Op::Publish(topic.to_string(), payload));
            s.queue.push_back(Inbound::PubAck);
            if let Some(batch) = s.replies.get_mut(topic).and_then(VecDeque::pop_front) {
                s.queue.extend(batch);
            }
            Ok(())
        })
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), EngineError> {
        self.with(|s| {
            s.ops.push(Op::Unsubscribe(filter.to_string()));
            s.queue.push_back(Inbound::UnsubAck);
            Ok(())
        })
    }

    async fn poll_once(&mut self, _timeout: Duration) -> Result<Option<Inbound>, EngineError> {
        self.with(|s| {
            s.polls += 1;
            if s.fail_poll_at == Some(s.polls) {
                return Err(EngineError::Transport("connection reset".into()));
            }
            Ok(s.queue.pop_front())
        })
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        self.with(|s| {
            if s.connected {
                s.connected = false;
                s.ops.push(Op::Disconnect);
                if s.fail_disconnect {
                    return Err(EngineError::Transport("broken pipe".into()));
                }
            }
            Ok(())
        })
    }
}

pub fn publish(topic: &str, payload: Vec<u8>) -> Inbound {
    Inbound::Publish {
        topic: topic.to_string(),
        payload: Bytes::from(payload),
    }
}

// -----------------------------------------------------------------------------
// Clock and entropy
// -----------------------------------------------------------------------------

/// Wall-clock time reported by [`RecordingClock`].
pub fn fixed_wall_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// Records requested pauses and never actually waits.
#[derive(Clone, Default)]
pub struct RecordingClock {
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for RecordingClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_time(&self) -> DateTime<Utc> {
        fixed_wall_time()
    }

    fn sleep(&self, duration: Duration) -> tokio::time::Sleep {
        self.sleeps.lock().unwrap().push(duration);
        tokio::time::sleep(Duration::ZERO)
    }
}

pub struct FixedEntropy(pub u64);

impl EntropySource for FixedEntropy {
    fn next_u64(&self) -> Result<u64, EntropyError> {
        Ok(self.0)
    }
}

pub struct FailingEntropy;

impl EntropySource for FailingEntropy {
    fn next_u64(&self) -> Result<u64, EntropyError> {
        Err(EntropyError("getrandom unavailable".into()))
    }
}

pub fn backoff(clock: &RecordingClock, entropy: Arc<dyn EntropySource>) -> Backoff<RecordingClock> {
    Backoff::new(RetryPolicy::default(), clock.clone(), entropy)
}

// -----------------------------------------------------------------------------
// Key store
// -----------------------------------------------------------------------------

#[derive(Default)]
pub struct KeyStoreLog {
    pub generated: Vec<(String, String)>,
    pub certificates: Vec<(KeyHandle, String, String)>,
    pub identities: Vec<IdentityRecord>,
    pub fail_generate: bool,
}

#[derive(Clone, Default)]
pub struct MemoryKeyStore(pub Arc<Mutex<KeyStoreLog>>);

impl MemoryKeyStore {
    pub fn failing() -> Self {
        let store = Self::default();
        store.0.lock().unwrap().fail_generate = true;
        store
    }

    pub fn certificates(&self) -> Vec<(KeyHandle, String, String)> {
        self.0.lock().unwrap().certificates.clone()
    }

    pub fn identities(&self) -> Vec<IdentityRecord> {
        self.0.lock().unwrap().identities.clone()
    }
}

impl KeyStore for MemoryKeyStore {
    fn generate_key_and_csr(
        &self,
        label: &str,
        common_name: &str,
    ) -> Result<CsrArtifact, KeyStoreError> {
        let mut log = self.0.lock().unwrap();
        if log.fail_generate {
            return Err(KeyStoreError::Generation("secure element busy".into()));
        }
        log.generated.push((label.to_string(), common_name.to_string()));
        Ok(CsrArtifact {
            csr_pem: format!("-----BEGIN CERTIFICATE REQUEST-----\n{common_name}\n"),
            key_handle: KeyHandle::new(label),
        })
    }

    fn store_certificate(
        &self,
        handle: &KeyHandle,
        label: &str,
        certificate_pem: &str,
    ) -> Result<(), KeyStoreError> {
        self.0.lock().unwrap().certificates.push((
            handle.clone(),
            label.to_string(),
            certificate_pem.to_string(),
        ));
        Ok(())
    }

    fn store_identity(&self, record: &IdentityRecord) -> Result<(), KeyStoreError> {
        self.0.lock().unwrap().identities.push(record.clone());
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Plans and provisioners
// -----------------------------------------------------------------------------

pub fn test_plan(max_polls: u32, stray_policy: StrayPublishPolicy) -> ProvisioningPlan {
    let mut parameters = BTreeMap::new();
    parameters.insert("SerialNumber".to_string(), CLIENT_ID.to_string());
    ProvisioningPlan {
        connect: ConnectRequest {
            client_id: CLIENT_ID.to_string(),
            keep_alive: Duration::from_secs(60),
            transport_timeout: Duration::from_secs(5),
            connack_timeout: Duration::from_millis(1_000),
            max_packet_bytes: 2048,
        },
        template: TEMPLATE.to_string(),
        format: PayloadFormat::Cbor,
        parameters,
        key_label: "device".to_string(),
        certificate_label: "device".to_string(),
        payload_capacity: 2048,
        step: StepSettings {
            budget: WaitBudget::new(Duration::from_millis(1), max_polls),
            stray_policy,
        },
    }
}

pub fn provisioner<S: KeyStore>(
    broker: &FakeBroker,
    keystore: S,
    clock: &RecordingClock,
    plan: ProvisioningPlan,
) -> Provisioner<FakeConnector, S, RecordingClock> {
    Provisioner::new(
        broker.connector(),
        keystore,
        Box::new(StandardCodec::default()),
        backoff(clock, Arc::new(FixedEntropy(u64::MAX))),
        plan,
    )
}

// -----------------------------------------------------------------------------
// Service payloads (CBOR)
// -----------------------------------------------------------------------------

pub fn csr_accepted(pem: &str, certificate_id: &str, token: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3).unwrap();
    enc.str("certificatePem").unwrap().str(pem).unwrap();
    enc.str("certificateId").unwrap().str(certificate_id).unwrap();
    enc.str("certificateOwnershipToken").unwrap().str(token).unwrap();
    buf
}

pub fn register_accepted(thing_name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(2).unwrap();
    enc.str("deviceConfiguration").unwrap().map(0).unwrap();
    enc.str("thingName").unwrap().str(thing_name).unwrap();
    buf
}

pub fn rejected(status: u16, code: &str, message: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3).unwrap();
    enc.str("statusCode").unwrap().u16(status).unwrap();
    enc.str("errorCode").unwrap().str(code).unwrap();
    enc.str("errorMessage").unwrap().str(message).unwrap();
    buf
}

/// A PEM-shaped string of exactly `len` bytes.
pub fn pem_of_len(len: usize) -> String {
    let head = "-----BEGIN CERTIFICATE-----\n";
    let tail = "\n-----END CERTIFICATE-----\n";
    let body = "A".repeat(len - head.len() - tail.len());
    format!("{head}{body}{tail}")
}
