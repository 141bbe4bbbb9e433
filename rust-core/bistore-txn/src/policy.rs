// SPDX-License-Identifier: PMPL-1.0-or-later

use bistore_errors::RetryPolicy;
use chrono::{DateTime, Utc};

use crate::ticket::RecoveryTicket;

/// Decides whether an open recovery ticket may be replayed without an
/// operator asking for it.
pub trait RecoveryPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn should_replay(&self, ticket: &RecoveryTicket, now: DateTime<Utc>) -> bool;
}

/// Tickets wait for an explicit replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualRecovery;

impl RecoveryPolicy for ManualRecovery {
    fn name(&self) -> &str {
        "manual"
    }

    fn should_replay(&self, _ticket: &RecoveryTicket, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// Replay open tickets in the background, backing off between attempts and
/// leaving a ticket to the operator after `backoff.max_attempts`.
#[derive(Debug, Clone)]
pub struct AutomaticReplay {
    pub backoff: RetryPolicy,
}

impl AutomaticReplay {
    pub fn new(backoff: RetryPolicy) -> Self {
        Self { backoff }
    }
}

impl Default for AutomaticReplay {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RecoveryPolicy for AutomaticReplay {
    fn name(&self) -> &str {
        "automatic_replay"
    }

    fn should_replay(&self, ticket: &RecoveryTicket, now: DateTime<Utc>) -> bool {
        if !ticket.is_open() || ticket.attempts >= self.backoff.max_attempts {
            return false;
        }
        match ticket.last_attempt_at {
            None => true,
            Some(last) => {
                let wait = self.backoff.backoff_for(ticket.attempts);
                (now - last).to_std().map(|elapsed| elapsed >= wait).unwrap_or(false)
            }
        }
    }
}
