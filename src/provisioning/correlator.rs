//! Bounded wait for a packet category.
//!
//! Turns the asynchronous link into request/response: poll, dispatch every
//! inbound packet into the session, stop when the expected category shows up
//! or the poll budget runs out. Never re-sends anything.

use super::session::{ProvisioningSession, SessionError};
use crate::transport::{EngineError, PacketCategory, PubSubLink};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("no {expected} within {polls} polls")]
    Timeout {
        expected: PacketCategory,
        polls: u32,
    },
    #[error(transparent)]
    Transport(#[from] EngineError),
    #[error(transparent)]
    PayloadTooLarge(SessionError),
}

/// Per-poll timeout times the number of polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBudget {
    pub per_poll: Duration,
    pub max_polls: u32,
}

impl WaitBudget {
    pub fn new(per_poll: Duration, max_polls: u32) -> Self {
        Self {
            per_poll,
            max_polls,
        }
    }

    pub fn with_polls(self, max_polls: u32) -> Self {
        Self { max_polls, ..self }
    }

    pub fn total(&self) -> Duration {
        self.per_poll.saturating_mul(self.max_polls)
    }
}

impl Default for WaitBudget {
    fn default() -> Self {
        Self::new(Duration::from_millis(700), 30)
    }
}

/// Poll until `expected` arrives. Returns the number of polls used.
pub async fn wait_for<L: PubSubLink + ?Sized>(
    link: &mut L,
    session: &mut ProvisioningSession,
    expected: PacketCategory,
    budget: WaitBudget,
) -> Result<u32, WaitError> {
    session.reset_last_packet();
    for poll in 1..=budget.max_polls {
        if let Some(inbound) = link.poll_once(budget.per_poll).await? {
            session.dispatch(&inbound).map_err(WaitError::PayloadTooLarge)?;
        }
        if session.last_packet() == Some(expected) {
            debug!("{} received after {} polls", expected, poll);
            return Ok(poll);
        }
    }
    Err(WaitError::Timeout {
        expected,
        polls: budget.max_polls,
    })
}
