//! Balancer round outcomes and the status snapshot served by the admin API

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What one balancer round did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Held the lease and balanced; `moved` collections had a chunk moved
    Balanced { moved: usize },
    /// Another live instance holds the lease
    NotLeader { holder: String },
    /// The chunk identifier check failed
    Inconsistent { reason: String },
    /// The metadata store could not be used
    Failed { error: String },
    /// Shutdown was requested before the round started
    Stopped,
}

impl CycleOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CycleOutcome::Balanced { .. } => "balanced",
            CycleOutcome::NotLeader { .. } => "not_leader",
            CycleOutcome::Inconsistent { .. } => "inconsistent",
            CycleOutcome::Failed { .. } => "failed",
            CycleOutcome::Stopped => "stopped",
        }
    }

    pub fn moved(&self) -> usize {
        match self {
            CycleOutcome::Balanced { moved } => *moved,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerStatus {
    pub identity: String,
    pub started: DateTime<Utc>,
    /// Held the lease in the last round
    pub leader: bool,
    pub running: bool,
    pub rounds: u64,
    pub last_round: Option<DateTime<Utc>>,
    pub last_outcome: Option<CycleOutcome>,
    /// Chunks moved in the last round
    pub balanced_last_time: usize,
    pub last_error: Option<String>,
}

impl BalancerStatus {
    pub fn new(identity: impl Into<String>, started: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            started,
            leader: false,
            running: false,
            rounds: 0,
            last_round: None,
            last_outcome: None,
            balanced_last_time: 0,
            last_error: None,
        }
    }

    /// Fold one finished round into the status
    pub fn record(&mut self, outcome: &CycleOutcome, at: DateTime<Utc>) {
        self.rounds += 1;
        self.last_round = Some(at);
        self.leader = matches!(
            outcome,
            CycleOutcome::Balanced { .. } | CycleOutcome::Inconsistent { .. }
        );
        self.balanced_last_time = outcome.moved();
        self.last_error = match outcome {
            CycleOutcome::Failed { error } => Some(error.clone()),
            CycleOutcome::Inconsistent { reason } => Some(reason.clone()),
            _ => None,
        };
        self.last_outcome = Some(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(CycleOutcome::Balanced { moved: 2 }).unwrap();
        assert_eq!(json["outcome"], "balanced");
        assert_eq!(json["moved"], 2);
    }

    #[test]
    fn test_record_tracks_leadership_and_errors() {
        let mut status = BalancerStatus::new("h:1:0:x", Utc::now());
        status.record(&CycleOutcome::Balanced { moved: 1 }, Utc::now());
        assert!(status.leader);
        assert_eq!(status.balanced_last_time, 1);

        status.record(
            &CycleOutcome::NotLeader {
                holder: "other".into(),
            },
            Utc::now(),
        );
        assert!(!status.leader);
        assert_eq!(status.balanced_last_time, 0);
        assert_eq!(status.rounds, 2);

        status.record(
            &CycleOutcome::Failed {
                error: "offline".into(),
            },
            Utc::now(),
        );
        assert_eq!(status.last_error.as_deref(), Some("offline"));
    }
}
