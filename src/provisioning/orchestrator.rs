//! Claim-to-identity state machine.
//!
//! ```text
//! Init -> Connected -> CsrSubscribed -> CsrPublished -> CsrResult
//!      -> CsrUnsubscribed -> RegisterSubscribed -> RegisterPublished
//!      -> RegisterResult -> RegisterUnsubscribed -> Disconnected -> Done
//! ```
//!
//! Any failure jumps to `Failed`. The link is always closed when one was
//! opened, and teardown problems are logged without masking the failure.

use super::backoff::Backoff;
use super::codec::{CodecError, PayloadCodec, ThingIdentity};
use super::connection::{connect_with_retry, disconnect, ConnectError};
use super::session::{Outcome, ProvisioningSession};
use super::step::{run_step, StepContext, StepError, StepProgress, StepSettings, StepSpec};
use super::topics::{PayloadFormat, StepKind};
use crate::keystore::{IdentityRecord, KeyHandle, KeyStore, KeyStoreError};
use crate::time::Clock;
use crate::transport::{ConnectRequest, Connector};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("{step} request could not be encoded: {source}")]
    Encode {
        step: StepKind,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    Step(#[from] StepError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Init,
    Connected,
    CsrSubscribed,
    CsrPublished,
    CsrResult(Outcome),
    CsrUnsubscribed,
    RegisterSubscribed,
    RegisterPublished,
    RegisterResult(Outcome),
    RegisterUnsubscribed,
    Disconnected,
    Done,
    Failed,
}

impl ProvisioningState {
    fn after(step: StepKind, progress: StepProgress) -> Self {
        match (step, progress) {
            (StepKind::CreateCertificateFromCsr, StepProgress::Subscribed) => Self::CsrSubscribed,
            (StepKind::CreateCertificateFromCsr, StepProgress::Published) => Self::CsrPublished,
            (StepKind::CreateCertificateFromCsr, StepProgress::Result(o)) => Self::CsrResult(o),
            (StepKind::CreateCertificateFromCsr, StepProgress::Unsubscribed) => {
                Self::CsrUnsubscribed
            }
            (StepKind::RegisterThing, StepProgress::Subscribed) => Self::RegisterSubscribed,
            (StepKind::RegisterThing, StepProgress::Published) => Self::RegisterPublished,
            (StepKind::RegisterThing, StepProgress::Result(o)) => Self::RegisterResult(o),
            (StepKind::RegisterThing, StepProgress::Unsubscribed) => Self::RegisterUnsubscribed,
        }
    }
}

/// Everything the orchestrator needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ProvisioningPlan {
    pub connect: ConnectRequest,
    pub template: String,
    pub format: PayloadFormat,
    pub parameters: BTreeMap<String, String>,
    pub key_label: String,
    pub certificate_label: String,
    pub payload_capacity: usize,
    pub step: StepSettings,
}

pub struct Provisioner<C, S, K>
where
    C: Connector,
    S: KeyStore,
    K: Clock,
{
    connector: C,
    keystore: S,
    codec: Box<dyn PayloadCodec>,
    backoff: Backoff<K>,
    plan: ProvisioningPlan,
    history: Vec<ProvisioningState>,
}

impl<C, S, K> Provisioner<C, S, K>
where
    C: Connector,
    S: KeyStore,
    K: Clock,
{
    pub fn new(
        connector: C,
        keystore: S,
        codec: Box<dyn PayloadCodec>,
        backoff: Backoff<K>,
        plan: ProvisioningPlan,
    ) -> Self {
        Self {
            connector,
            keystore,
            codec,
            backoff,
            plan,
            history: Vec::new(),
        }
    }

    /// States visited by the most recent [`Provisioner::run`].
    pub fn history(&self) -> &[ProvisioningState] {
        &self.history
    }

    pub fn state(&self) -> ProvisioningState {
        self.history
            .last()
            .copied()
            .unwrap_or(ProvisioningState::Init)
    }

    pub fn keystore(&self) -> &S {
        &self.keystore
    }

    /// Run the whole flow once, from a clean `Init`.
    pub async fn run(&mut self) -> Result<ThingIdentity, ProvisioningError> {
        let started = self.backoff.clock().now();
        let mut history = vec![ProvisioningState::Init];
        let result = self.drive(&mut history).await;
        match &result {
            Ok(identity) => {
                history.push(ProvisioningState::Done);
                info!(
                    "provisioned {} in {}ms",
                    identity.thing_name,
                    self.backoff.clock().elapsed_since(started).as_millis()
                );
            }
            Err(err) => {
                history.push(ProvisioningState::Failed);
                error!("provisioning failed: {}", err);
            }
        }
        self.history = history;
        result
    }

    async fn drive(
        &self,
        history: &mut Vec<ProvisioningState>,
    ) -> Result<ThingIdentity, ProvisioningError> {
        let artifact = self
            .keystore
            .generate_key_and_csr(&self.plan.key_label, &self.plan.connect.client_id)?;

        let mut link =
            connect_with_retry(&self.connector, &self.plan.connect, &self.backoff).await?;
        history.push(ProvisioningState::Connected);

        let mut session = ProvisioningSession::new(self.plan.payload_capacity);
        let result = self
            .exchange(&mut link, &mut session, &artifact.key_handle, &artifact.csr_pem, history)
            .await;

        // Teardown was attempted either way; a failed DISCONNECT is only logged.
        if let Err(err) = disconnect(&mut link).await {
            warn!("{}", err);
        }
        if result.is_ok() {
            history.push(ProvisioningState::Disconnected);
        }
        result
    }

    async fn exchange(
        &self,
        link: &mut C::Link,
        session: &mut ProvisioningSession,
        key_handle: &KeyHandle,
        csr_pem: &str,
        history: &mut Vec<ProvisioningState>,
    ) -> Result<ThingIdentity, ProvisioningError> {
        let codec = self.codec.as_ref();
        let mut ctx = StepContext {
            link,
            session,
            backoff: &self.backoff,
            codec,
            settings: self.plan.step,
        };

        let csr_step = StepSpec::create_certificate_from_csr(self.plan.format);
        let request = codec
            .encode_csr_request(csr_pem)
            .map_err(|source| ProvisioningError::Encode {
                step: csr_step.kind,
                source,
            })?;
        let credential = run_step(
            &mut ctx,
            &csr_step,
            request,
            |payload: &[u8]| codec.decode_csr_response(payload),
            &mut |p: StepProgress| {
                history.push(ProvisioningState::after(csr_step.kind, p));
            },
        )
        .await?;
        info!("certificate {} issued", credential.certificate_id);

        self.keystore.store_certificate(
            key_handle,
            &self.plan.certificate_label,
            &credential.certificate_pem,
        )?;

        let register_step = StepSpec::register_thing(&self.plan.template, self.plan.format);
        let request = codec
            .encode_register_request(&credential.ownership_token, &self.plan.parameters)
            .map_err(|source| ProvisioningError::Encode {
                step: register_step.kind,
                source,
            })?;
        let identity = run_step(
            &mut ctx,
            &register_step,
            request,
            |payload: &[u8]| codec.decode_register_response(payload),
            &mut |p: StepProgress| {
                history.push(ProvisioningState::after(register_step.kind, p));
            },
        )
        .await?;

        self.keystore.store_identity(&IdentityRecord {
            thing_name: identity.thing_name.clone(),
            certificate_id: credential.certificate_id,
            template: self.plan.template.clone(),
            key_label: self.plan.key_label.clone(),
            certificate_label: self.plan.certificate_label.clone(),
            provisioned_at: self.backoff.clock().wall_time(),
            device_configuration: identity.device_configuration.clone(),
        })?;
        Ok(identity)
    }
}
