use serde::Serialize;

use crate::feed::{ErrorKind, FetchError};
use crate::storage::DeltaCounts;

/// Lifecycle of one feed's job within a run.
///
/// `Pending → Fetching → {NotModified | Parsing → Reconciling → Committed}`,
/// with `Failed` reachable from every non-terminal state and `Skipped` only
/// from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Fetching,
    Parsing,
    Reconciling,
    Committed,
    NotModified,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Committed | JobState::NotModified | JobState::Failed | JobState::Skipped
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Fetching | Skipped | Failed)
                | (Fetching, NotModified | Parsing | Failed)
                | (Parsing, Reconciling | Failed)
                | (Reconciling, Committed | Failed)
        )
    }

    /// Reported outcome for a terminal state.
    fn outcome_status(self) -> Option<OutcomeStatus> {
        match self {
            JobState::Committed => Some(OutcomeStatus::Committed),
            JobState::NotModified => Some(OutcomeStatus::NotModified),
            JobState::Failed => Some(OutcomeStatus::Failed),
            JobState::Skipped => Some(OutcomeStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Committed,
    NotModified,
    Skipped,
    Failed,
}

/// What happened to one feed in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedOutcome {
    pub url: String,
    pub status: OutcomeStatus,
    pub inserted: usize,
    pub updated: usize,
    pub archived: usize,
    pub resurrected: usize,
    /// Inserted items whose unfurl request the queue refused
    #[serde(skip_serializing_if = "is_zero")]
    pub unfurl_dropped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl FeedOutcome {
    fn new(url: String, status: OutcomeStatus) -> Self {
        Self {
            url,
            status,
            inserted: 0,
            updated: 0,
            archived: 0,
            resurrected: 0,
            unfurl_dropped: 0,
            error: None,
            error_kind: None,
        }
    }

    pub(crate) fn from_state(url: String, state: JobState) -> Self {
        let status = state.outcome_status().unwrap_or(OutcomeStatus::Failed);
        Self::new(url, status)
    }

    pub(crate) fn committed(url: String, counts: DeltaCounts) -> Self {
        Self {
            inserted: counts.inserted,
            updated: counts.updated,
            archived: counts.archived,
            resurrected: counts.resurrected,
            ..Self::new(url, OutcomeStatus::Committed)
        }
    }

    pub(crate) fn failed(url: String, error: &FetchError) -> Self {
        Self {
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            ..Self::new(url, OutcomeStatus::Failed)
        }
    }
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Per-feed outcomes of a run plus totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub committed: usize,
    pub not_modified: usize,
    pub skipped: usize,
    pub failed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub archived: usize,
    pub resurrected: usize,
    pub unfurl_dropped: usize,
    /// The run was cancelled or hit its deadline before every feed finished
    pub cancelled: bool,
    pub outcomes: Vec<FeedOutcome>,
}

impl RunSummary {
    /// Tally `outcomes`. The run counts as cancelled only if some feed was
    /// cut short by it.
    pub fn from_outcomes(outcomes: Vec<FeedOutcome>) -> Self {
        let mut summary = RunSummary::default();
        for o in &outcomes {
            if o.error_kind == Some(ErrorKind::Cancelled) {
                summary.cancelled = true;
            }
            match o.status {
                OutcomeStatus::Committed => summary.committed += 1,
                OutcomeStatus::NotModified => summary.not_modified += 1,
                OutcomeStatus::Skipped => summary.skipped += 1,
                OutcomeStatus::Failed => summary.failed += 1,
            }
            summary.inserted += o.inserted;
            summary.updated += o.updated;
            summary.archived += o.archived;
            summary.resurrected += o.resurrected;
            summary.unfurl_dropped += o.unfurl_dropped;
        }
        summary.outcomes = outcomes;
        summary
    }

    /// True when there was work to do and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.failed == self.outcomes.len()
    }

    pub fn outcome(&self, url: &str) -> Option<&FeedOutcome> {
        self.outcomes.iter().find(|o| o.url == url)
    }
}
