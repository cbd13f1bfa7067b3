//! Fleet provisioning by claim.
//!
//! - `backoff` - jittered exponential retry delays
//! - `topics` - request/response topic layout and matching
//! - `codec` - CBOR/JSON payloads
//! - `session` - per-attempt state and inbound classification
//! - `correlator` - bounded wait for a packet category
//! - `connection` - connect with retry, disconnect
//! - `step` - one subscribe/publish/wait/unsubscribe exchange
//! - `orchestrator` - CSR then RegisterThing state machine

pub mod backoff;
pub mod codec;
pub mod connection;
pub mod correlator;
pub mod orchestrator;
pub mod session;
pub mod step;
pub mod topics;

pub use backoff::{
    Backoff, BackoffError, EntropyError, EntropySource, OsEntropy, RetryContext, RetryPolicy,
};
pub use codec::{
    CodecError, FieldLimits, IssuedCredential, PayloadCodec, RejectionDetail, StandardCodec,
    ThingIdentity,
};
pub use connection::{connect_with_retry, disconnect, ConnectError, TeardownError};
pub use correlator::{wait_for, WaitBudget, WaitError};
pub use orchestrator::{ProvisioningError, ProvisioningPlan, ProvisioningState, Provisioner};
pub use session::{Classification, Outcome, PayloadBuffer, ProvisioningSession, SessionError};
pub use step::{
    run_step, StepContext, StepError, StepProgress, StepSettings, StepSpec, StrayPublishPolicy,
};
pub use topics::{match_topic, PayloadFormat, StepKind, TopicSet};
