//! Secure pub/sub engine seam.
//!
//! The provisioning flow only ever talks to a [`Connector`] and the
//! [`PubSubLink`] it yields. Inbound traffic is surfaced as [`Inbound`]
//! values returned from [`PubSubLink::poll_once`], so the caller owns all
//! session state and nothing is mutated behind its back.
//!
//! - `mqtt` - rumqttc-backed engine over rustls

pub mod mqtt;

pub use mqtt::{MqttConnector, MqttLink};

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// TCP or TLS level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Broker refused the session or never answered CONNECT.
    #[error("handshake error: {0}")]
    Handshake(String),
    /// Request could not be queued on the client.
    #[error("request rejected by client: {0}")]
    Request(String),
    #[error("link closed")]
    Closed,
}

/// Coarse packet kind used to correlate waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketCategory {
    ConnAck,
    SubAck,
    UnsubAck,
    PubAck,
    Publish,
    PingResp,
    Other,
}

impl fmt::Display for PacketCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnAck => "CONNACK",
            Self::SubAck => "SUBACK",
            Self::UnsubAck => "UNSUBACK",
            Self::PubAck => "PUBACK",
            Self::Publish => "PUBLISH",
            Self::PingResp => "PINGRESP",
            Self::Other => "OTHER",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ConnAck { accepted: bool },
    /// `granted` is false when any filter in the request was refused.
    SubAck { granted: bool },
    UnsubAck,
    PubAck,
    Publish { topic: String, payload: Bytes },
    PingResp,
    Other,
}

impl Inbound {
    pub fn category(&self) -> PacketCategory {
        match self {
            Self::ConnAck { .. } => PacketCategory::ConnAck,
            Self::SubAck { .. } => PacketCategory::SubAck,
            Self::UnsubAck => PacketCategory::UnsubAck,
            Self::PubAck => PacketCategory::PubAck,
            Self::Publish { .. } => PacketCategory::Publish,
            Self::PingResp => PacketCategory::PingResp,
            Self::Other => PacketCategory::Other,
        }
    }
}

/// Parameters for one MQTT session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub client_id: String,
    pub keep_alive: Duration,
    /// Budget for TCP connect and the TLS handshake.
    pub transport_timeout: Duration,
    /// Budget for the CONNACK once the secure channel is up.
    pub connack_timeout: Duration,
    /// Largest packet accepted or produced on the link.
    pub max_packet_bytes: usize,
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Link: PubSubLink;

    /// Open the secure transport and complete the MQTT handshake with a clean session.
    async fn connect(&self, request: &ConnectRequest) -> Result<Self::Link, EngineError>;
}

/// An established MQTT session. All requests are QoS 1.
#[async_trait]
pub trait PubSubLink: Send {
    /// Queue a SUBSCRIBE for `filters`; the SUBACK arrives through `poll_once`.
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), EngineError>;

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), EngineError>;

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), EngineError>;

    /// Drive the session for at most `timeout` and return the first inbound
    /// packet, or `None` when nothing arrived.
    async fn poll_once(&mut self, timeout: Duration) -> Result<Option<Inbound>, EngineError>;

    /// Close the session. Calling it on a closed link is a no-op.
    async fn disconnect(&mut self) -> Result<(), EngineError>;
}
