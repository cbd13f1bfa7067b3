use super::{ConnectRequest, Connector, EngineError, Inbound, PubSubLink};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, SubscribeFilter, SubscribeReasonCode, TlsConfiguration, Transport,
};
use rustls::ClientConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 16;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

/// Broker endpoint plus the TLS material used for every connect attempt.
#[derive(Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    tls: Arc<ClientConfig>,
}

impl MqttConnector {
    pub fn new(host: impl Into<String>, port: u16, tls: Arc<ClientConfig>) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Link = MqttLink;

    async fn connect(&self, request: &ConnectRequest) -> Result<MqttLink, EngineError> {
        // rumqttc panics on ids it cannot encode.
        if request.client_id.is_empty() || request.client_id.chars().any(char::is_whitespace) {
            return Err(EngineError::Handshake(format!(
                "invalid client id {:?}",
                request.client_id
            )));
        }
        let mut options = MqttOptions::new(&request.client_id, &self.host, self.port);
        options.set_keep_alive(request.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(request.max_packet_bytes, request.max_packet_bytes);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            self.tls.clone(),
        )));

        // A fresh client per attempt; rumqttc would otherwise reconnect on its own.
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        eventloop
            .network_options
            .set_connection_timeout(whole_seconds(request.transport_timeout));
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                        return if ack.code == ConnectReturnCode::Success {
                            Ok(())
                        } else {
                            Err(EngineError::Handshake(format!("{:?}", ack.code)))
                        };
                    }
                    Ok(_) => continue,
                    Err(err) => return Err(map_connection_error(err)),
                }
            }
        };
        // rumqttc bounds TCP and TLS itself; the CONNACK budget runs on top of that.
        let budget = request.transport_timeout + request.connack_timeout;
        match tokio::time::timeout(budget, handshake).await {
            Ok(Ok(())) => {
                info!(
                    "mqtt session established with {}:{} as {}",
                    self.host, self.port, request.client_id
                );
                Ok(MqttLink {
                    client,
                    eventloop,
                    connected: true,
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(EngineError::Handshake(format!(
                "no CONNACK within {}ms",
                request.connack_timeout.as_millis()
            ))),
        }
    }
}

pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
}

impl MqttLink {
    fn ensure_connected(&self) -> Result<(), EngineError> {
        if self.connected {
            Ok(())
        } else {
            Err(EngineError::Closed)
        }
    }
}

#[async_trait]
impl PubSubLink for MqttLink {
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), EngineError> {
        self.ensure_connected()?;
        let filters = filters
            .iter()
            .map(|f| SubscribeFilter::new(f.clone(), QoS::AtLeastOnce))
            .collect::<Vec<_>>();
        self.client
            .subscribe_many(filters)
            .await
            .map_err(|e| EngineError::Request(e.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| EngineError::Request(e.to_string()))
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), EngineError> {
        self.ensure_connected()?;
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| EngineError::Request(e.to_string()))
    }

    async fn poll_once(&mut self, timeout: Duration) -> Result<Option<Inbound>, EngineError> {
        self.ensure_connected()?;
        let deadline = Instant::now() + timeout;
        loop {
            let polled = match tokio::time::timeout_at(deadline, self.eventloop.poll()).await {
                Ok(polled) => polled,
                Err(_) => return Ok(None),
            };
            match polled {
                Ok(Event::Incoming(packet)) => return Ok(Some(map_incoming(packet))),
                Ok(Event::Outgoing(outgoing)) => {
                    debug!("outgoing {:?}", outgoing);
                }
                Err(err) => {
                    self.connected = false;
                    return Err(map_connection_error(err));
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), EngineError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.client
            .disconnect()
            .await
            .map_err(|e| EngineError::Request(e.to_string()))?;
        // Drive the event loop until the DISCONNECT is written out.
        let deadline = Instant::now() + DISCONNECT_FLUSH;
        loop {
            match tokio::time::timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => return Ok(()),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) => {
                    debug!("event loop ended during disconnect: {err}");
                    return Ok(());
                }
                Err(_) => {
                    warn!("DISCONNECT not flushed within {}ms", DISCONNECT_FLUSH.as_millis());
                    return Ok(());
                }
            }
        }
    }
}

/// rumqttc takes its connection timeout in whole seconds.
fn whole_seconds(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

fn map_incoming(packet: Incoming) -> Inbound {
    match packet {
        Incoming::ConnAck(ack) => Inbound::ConnAck {
            accepted: ack.code == ConnectReturnCode::Success,
        },
        Incoming::SubAck(ack) => Inbound::SubAck {
            granted: !ack.return_codes.is_empty()
                && ack
                    .return_codes
                    .iter()
                    .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
        },
        Incoming::UnsubAck(_) => Inbound::UnsubAck,
        Incoming::PubAck(_) => Inbound::PubAck,
        Incoming::Publish(publish) => Inbound::Publish {
            topic: publish.topic,
            payload: publish.payload,
        },
        Incoming::PingResp => Inbound::PingResp,
        _ => Inbound::Other,
    }
}

fn map_connection_error(err: ConnectionError) -> EngineError {
    match err {
        ConnectionError::ConnectionRefused(code) => {
            EngineError::Handshake(format!("connection refused: {code:?}"))
        }
        ConnectionError::NotConnAck(packet) => {
            EngineError::Handshake(format!("expected CONNACK, got {packet:?}"))
        }
        ConnectionError::NetworkTimeout => {
            EngineError::Transport("tcp/tls not established in time".to_string())
        }
        ConnectionError::Tls(err) => EngineError::Transport(format!("tls: {err}")),
        ConnectionError::Io(err) => EngineError::Transport(format!("io: {err}")),
        other => EngineError::Transport(other.to_string()),
    }
}
