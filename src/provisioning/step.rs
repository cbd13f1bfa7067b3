//! One request/response exchange: subscribe, publish, correlate, classify,
//! unsubscribe.

use super::backoff::{Backoff, BackoffError, EntropyError};
use super::codec::{CodecError, PayloadCodec, RejectionDetail};
use super::connection::TeardownError;
use super::correlator::{wait_for, WaitBudget, WaitError};
use super::session::{Outcome, ProvisioningSession, SessionError};
use super::topics::{PayloadFormat, StepKind, TopicSet};
use crate::time::Clock;
use crate::transport::{EngineError, PacketCategory, PubSubLink};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum StepError {
    #[error("subscribe to {topic} failed after {attempts} attempts: {reason}")]
    SubscribeFailed {
        topic: String,
        attempts: u32,
        reason: String,
    },
    #[error("publish to {topic} failed: {source}")]
    PublishFailed {
        topic: String,
        #[source]
        source: EngineError,
    },
    #[error("{step} rejected by server: {detail}")]
    ServerRejected {
        step: StepKind,
        detail: RejectionDetail,
    },
    #[error("no {step} response within {polls} polls")]
    NoResponse { step: StepKind, polls: u32 },
    #[error("unexpected publish on {topic} while waiting for {step}")]
    UnexpectedResponse { step: StepKind, topic: String },
    #[error(transparent)]
    PayloadTooLarge(SessionError),
    #[error("{step} response could not be decoded: {source}")]
    DecodeFailed {
        step: StepKind,
        #[source]
        source: CodecError,
    },
    #[error("link failed during {step}: {source}")]
    Transport {
        step: StepKind,
        #[source]
        source: EngineError,
    },
    #[error(transparent)]
    EntropyUnavailable(EntropyError),
    #[error(transparent)]
    Busy(SessionError),
}

/// What to do with a publish that matches neither response topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrayPublishPolicy {
    /// Keep waiting within the remaining poll budget.
    #[default]
    Tolerate,
    /// Fail the step immediately.
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepSettings {
    pub budget: WaitBudget,
    pub stray_policy: StrayPublishPolicy,
}

/// Milestones reported while a step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepProgress {
    Subscribed,
    Published,
    Result(Outcome),
    Unsubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSpec {
    pub kind: StepKind,
    pub topics: TopicSet,
}

impl StepSpec {
    pub fn create_certificate_from_csr(format: PayloadFormat) -> Self {
        Self {
            kind: StepKind::CreateCertificateFromCsr,
            topics: TopicSet::create_certificate_from_csr(format),
        }
    }

    pub fn register_thing(template: &str, format: PayloadFormat) -> Self {
        Self {
            kind: StepKind::RegisterThing,
            topics: TopicSet::register_thing(template, format),
        }
    }
}

/// Borrowed collaborators shared by both steps of one attempt.
pub struct StepContext<'a, L: ?Sized, K: Clock> {
    pub link: &'a mut L,
    pub session: &'a mut ProvisioningSession,
    pub backoff: &'a Backoff<K>,
    pub codec: &'a dyn PayloadCodec,
    pub settings: StepSettings,
}

/// Run one exchange and decode the accepted payload with `decode`.
///
/// Subscriptions are always torn down before returning, whatever the result.
pub async fn run_step<L, K, T, F>(
    ctx: &mut StepContext<'_, L, K>,
    spec: &StepSpec,
    request: Vec<u8>,
    decode: F,
    progress: &mut (dyn FnMut(StepProgress) + Send),
) -> Result<T, StepError>
where
    L: PubSubLink + ?Sized,
    K: Clock,
    F: FnOnce(&[u8]) -> Result<T, CodecError> + Send,
{
    ctx.session
        .begin_step(spec.kind, spec.topics.clone())
        .map_err(StepError::Busy)?;
    info!("{} started", spec.kind);

    let result = exchange(ctx, spec, request, progress).await;
    let result = match result {
        Ok(()) => decode(ctx.session.payload()).map_err(|source| StepError::DecodeFailed {
            step: spec.kind,
            source,
        }),
        Err(err) => Err(err),
    };

    let clean = unsubscribe_all(ctx).await;
    ctx.session.finish_step();
    if result.is_ok() && clean {
        progress(StepProgress::Unsubscribed);
    }
    match &result {
        Ok(_) => info!("{} complete", spec.kind),
        Err(err) => error!("{} failed: {}", spec.kind, err),
    }
    result
}

async fn exchange<L, K>(
    ctx: &mut StepContext<'_, L, K>,
    spec: &StepSpec,
    request: Vec<u8>,
    progress: &mut (dyn FnMut(StepProgress) + Send),
) -> Result<(), StepError>
where
    L: PubSubLink + ?Sized,
    K: Clock,
{
    subscribe_with_retry(ctx, spec).await?;
    progress(StepProgress::Subscribed);

    ctx.link
        .publish(&spec.topics.publish, request)
        .await
        .map_err(|source| StepError::PublishFailed {
            topic: spec.topics.publish.clone(),
            source,
        })?;
    debug!("request published to {}", spec.topics.publish);
    progress(StepProgress::Published);

    let budget = ctx.settings.budget;
    let mut remaining = budget.max_polls;
    loop {
        if remaining == 0 {
            return Err(StepError::NoResponse {
                step: spec.kind,
                polls: budget.max_polls,
            });
        }
        let used = match wait_for(
            &mut *ctx.link,
            ctx.session,
            PacketCategory::Publish,
            budget.with_polls(remaining),
        )
        .await
        {
            Ok(used) => used,
            Err(WaitError::Timeout { .. }) => {
                return Err(StepError::NoResponse {
                    step: spec.kind,
                    polls: budget.max_polls,
                });
            }
            Err(WaitError::Transport(source)) => {
                return Err(StepError::Transport {
                    step: spec.kind,
                    source,
                });
            }
            Err(WaitError::PayloadTooLarge(err)) => return Err(StepError::PayloadTooLarge(err)),
        };
        remaining = remaining.saturating_sub(used);

        match ctx.session.last_outcome() {
            Outcome::Accepted => {
                progress(StepProgress::Result(Outcome::Accepted));
                return Ok(());
            }
            Outcome::Rejected => {
                progress(StepProgress::Result(Outcome::Rejected));
                let detail = ctx
                    .codec
                    .decode_rejection(ctx.session.payload())
                    .unwrap_or_default();
                return Err(StepError::ServerRejected {
                    step: spec.kind,
                    detail,
                });
            }
            Outcome::NotReceived => {
                let topic = ctx
                    .session
                    .last_unmatched_topic()
                    .unwrap_or_default()
                    .to_string();
                match ctx.settings.stray_policy {
                    StrayPublishPolicy::Tolerate => {
                        debug!("stray publish on {}; {} polls left", topic, remaining);
                    }
                    StrayPublishPolicy::Reject => {
                        return Err(StepError::UnexpectedResponse {
                            step: spec.kind,
                            topic,
                        });
                    }
                }
            }
        }
    }
}

async fn subscribe_with_retry<L, K>(
    ctx: &mut StepContext<'_, L, K>,
    spec: &StepSpec,
) -> Result<(), StepError>
where
    L: PubSubLink + ?Sized,
    K: Clock,
{
    let filters = spec.topics.response_filters();
    let mut retry = ctx.backoff.start();
    loop {
        let reason = match subscribe_once(ctx, &filters).await {
            Ok(()) => return Ok(()),
            Err(reason) => reason,
        };
        warn!(
            "subscribe to {} failed (attempt {}): {}",
            spec.topics.accepted,
            retry.attempts_done() + 1,
            reason
        );
        match ctx.backoff.pause(&mut retry).await {
            Ok(_) => continue,
            Err(BackoffError::RetriesExhausted { attempts }) => {
                return Err(StepError::SubscribeFailed {
                    topic: spec.topics.accepted.clone(),
                    attempts,
                    reason,
                });
            }
            Err(BackoffError::EntropyUnavailable(e)) => {
                return Err(StepError::EntropyUnavailable(e))
            }
        }
    }
}

async fn subscribe_once<L, K>(
    ctx: &mut StepContext<'_, L, K>,
    filters: &[String],
) -> Result<(), String>
where
    L: PubSubLink + ?Sized,
    K: Clock,
{
    ctx.link
        .subscribe(filters)
        .await
        .map_err(|e| e.to_string())?;
    ctx.session.record_subscriptions(filters);
    wait_for(
        &mut *ctx.link,
        ctx.session,
        PacketCategory::SubAck,
        ctx.settings.budget,
    )
    .await
    .map_err(|e| e.to_string())?;
    match ctx.session.last_suback() {
        Some(true) => Ok(()),
        _ => Err("SUBACK refused".to_string()),
    }
}

/// Unsubscribe every active filter. Returns false if anything failed.
async fn unsubscribe_all<L, K>(ctx: &mut StepContext<'_, L, K>) -> bool
where
    L: PubSubLink + ?Sized,
    K: Clock,
{
    let mut clean = true;
    let filters = ctx.session.subscriptions().to_vec();
    for filter in filters {
        let outcome = match ctx.link.unsubscribe(&filter).await {
            Ok(()) => wait_for(
                &mut *ctx.link,
                ctx.session,
                PacketCategory::UnsubAck,
                ctx.settings.budget,
            )
            .await
            .map(|_| ())
            .map_err(|e| match e {
                WaitError::Transport(source) => source,
                other => EngineError::Request(other.to_string()),
            }),
            Err(err) => Err(err),
        };
        ctx.session.drop_subscription(&filter);
        if let Err(source) = outcome {
            clean = false;
            let err = TeardownError {
                what: format!("unsubscribe {filter}"),
                source,
            };
            warn!("{}", err);
        }
    }
    clean
}
