//! The fetch cycle: reconciliation of fresh items against the store, and the
//! bounded scheduler that drives fetch, parse, reconcile and commit for each
//! feed.

mod outcome;
mod reconcile;
mod scheduler;
mod unfurl;

pub use outcome::{FeedOutcome, JobState, OutcomeStatus, RunSummary};
pub use reconcile::reconcile;
pub use scheduler::{Scheduler, SchedulerConfig, DEFAULT_CONCURRENCY};
pub use unfurl::{unfurl_channel, UnfurlRequest, UnfurlSink};
