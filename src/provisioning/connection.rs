//! Connect phase with backoff, and best-effort disconnect.

use super::backoff::{Backoff, BackoffError, EntropyError};
use crate::time::Clock;
use crate::transport::{ConnectRequest, Connector, EngineError, PubSubLink};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport connect failed: {0}")]
    TransportFailed(String),
    #[error("mqtt handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("connect gave up after {attempts} attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<ConnectError>,
    },
    #[error(transparent)]
    EntropyUnavailable(EntropyError),
}

impl From<EngineError> for ConnectError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Handshake(reason) => Self::HandshakeFailed(reason),
            other => Self::TransportFailed(other.to_string()),
        }
    }
}

/// Failure during teardown. Logged, never surfaced to the caller.
#[derive(Debug, Error)]
#[error("teardown of {what} failed: {source}")]
pub struct TeardownError {
    pub what: String,
    #[source]
    pub source: EngineError,
}

/// Open a link, retrying transport and handshake failures alike under one
/// retry context.
pub async fn connect_with_retry<C, K>(
    connector: &C,
    request: &ConnectRequest,
    backoff: &Backoff<K>,
) -> Result<C::Link, ConnectError>
where
    C: Connector,
    K: Clock,
{
    let mut ctx = backoff.start();
    loop {
        let err = match connector.connect(request).await {
            Ok(link) => {
                info!(
                    "connected as {} after {} retries",
                    request.client_id,
                    ctx.attempts_done()
                );
                return Ok(link);
            }
            Err(err) => ConnectError::from(err),
        };
        warn!("connect attempt {} failed: {}", ctx.attempts_done() + 1, err);
        match backoff.pause(&mut ctx).await {
            Ok(_) => continue,
            Err(BackoffError::RetriesExhausted { attempts }) => {
                return Err(ConnectError::Exhausted {
                    attempts,
                    last: Box::new(err),
                });
            }
            Err(BackoffError::EntropyUnavailable(e)) => {
                return Err(ConnectError::EntropyUnavailable(e));
            }
        }
    }
}

/// Close the link; errors are reported for logging only.
pub async fn disconnect<L: PubSubLink + ?Sized>(link: &mut L) -> Result<(), TeardownError> {
    link.disconnect().await.map_err(|source| TeardownError {
        what: "disconnect".to_string(),
        source,
    })
}
