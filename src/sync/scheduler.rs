use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::outcome::{FeedOutcome, JobState, RunSummary};
use super::reconcile::reconcile;
use super::unfurl::{UnfurlRequest, UnfurlSink};
use crate::feed::{fetch_feed, parse_feed, FetchError, FetchResponse, DEFAULT_TIMEOUT};
use crate::storage::{Database, DeltaCounts, FeedMeta, InsertedItem};
use crate::util::canonicalize_feed_url;

/// Default number of feeds processed at once.
pub const DEFAULT_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Feeds in flight at once; 0 is treated as 1
    pub concurrency: usize,
    /// Bound on each feed's HTTP exchange
    pub timeout: Duration,
    /// Skip feeds whose last attempt is younger than this
    pub max_age: Option<Duration>,
    /// Ignore stored cache validators
    pub force: bool,
    /// Bound on the whole run
    pub deadline: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            max_age: None,
            force: false,
            deadline: None,
        }
    }
}

/// Runs the fetch → parse → reconcile → commit pipeline over a set of feeds.
pub struct Scheduler {
    db: Database,
    client: reqwest::Client,
    config: SchedulerConfig,
    unfurl: Option<UnfurlSink>,
}

/// Per-feed job bookkeeping.
struct FeedJob {
    url: String,
    state: JobState,
    /// Status of the last HTTP response, for failure records
    http_status: Option<u16>,
}

impl FeedJob {
    fn new(url: String) -> Self {
        Self {
            url,
            state: JobState::Pending,
            http_status: None,
        }
    }

    fn advance(&mut self, next: JobState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal job transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::trace!(feed = %self.url, from = ?self.state, to = ?next, "Job state");
        self.state = next;
    }
}

impl Scheduler {
    pub fn new(db: Database, client: reqwest::Client, config: SchedulerConfig) -> Self {
        Self {
            db,
            client,
            config,
            unfurl: None,
        }
    }

    /// Forward every newly inserted item with a link to `sink`.
    pub fn with_unfurl(mut self, sink: UnfurlSink) -> Self {
        self.unfurl = Some(sink);
        self
    }

    /// Sync every feed in `urls` and report one outcome per distinct feed.
    ///
    /// URLs are canonicalized and de-duplicated first; outcomes come back in
    /// input order. Failures never stop sibling feeds. When `cancel` fires or
    /// the configured deadline passes, in-flight fetches are abandoned and
    /// every unfinished feed is reported as failed with
    /// [`FetchError::Cancelled`]. Commits already under way finish.
    pub async fn run(&self, urls: &[String], cancel: CancellationToken) -> RunSummary {
        let run_cancel = cancel.child_token();
        if let Some(deadline) = self.config.deadline {
            let timer = run_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        tracing::warn!(deadline_secs = deadline.as_secs_f64(), "Run deadline reached");
                        timer.cancel();
                    }
                    _ = timer.cancelled() => {}
                }
            });
        }

        let mut seen = HashSet::new();
        let mut jobs = Vec::with_capacity(urls.len());
        let mut rejected = Vec::new();
        for raw in urls {
            match canonicalize_feed_url(raw) {
                Ok(url) => {
                    if seen.insert(url.clone()) {
                        jobs.push(url);
                    } else {
                        tracing::debug!(feed = %url, "Duplicate feed URL collapsed");
                    }
                }
                Err(e) => {
                    tracing::warn!(url = %raw, error = %e, "Invalid feed URL");
                    rejected.push(FeedOutcome::failed(raw.clone(), &FetchError::InvalidUrl(e)));
                }
            }
        }

        tracing::info!(
            feeds = jobs.len(),
            concurrency = self.config.concurrency.max(1),
            force = self.config.force,
            "Starting fetch run"
        );

        let mut results: Vec<(usize, FeedOutcome)> = stream::iter(jobs.into_iter().enumerate())
            .map(|(index, url)| {
                let cancel = run_cancel.clone();
                async move { (index, self.run_job(url, &cancel).await) }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        results.sort_by_key(|(index, _)| *index);

        // Stops the deadline timer; does not propagate to the caller's token.
        run_cancel.cancel();

        let mut outcomes = rejected;
        outcomes.extend(results.into_iter().map(|(_, outcome)| outcome));
        let summary = RunSummary::from_outcomes(outcomes);

        tracing::info!(
            committed = summary.committed,
            not_modified = summary.not_modified,
            skipped = summary.skipped,
            failed = summary.failed,
            inserted = summary.inserted,
            updated = summary.updated,
            archived = summary.archived,
            resurrected = summary.resurrected,
            unfurl_dropped = summary.unfurl_dropped,
            cancelled = summary.cancelled,
            "Fetch run finished"
        );
        summary
    }

    async fn run_job(&self, url: String, cancel: &CancellationToken) -> FeedOutcome {
        let mut job = FeedJob::new(url);

        let result = if cancel.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            self.sync_feed(&mut job, cancel).await
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                job.advance(JobState::Failed);
                match &e {
                    FetchError::Cancelled => {
                        tracing::debug!(feed = %job.url, "Feed cancelled");
                    }
                    _ => {
                        tracing::warn!(feed = %job.url, error = %e, "Feed sync failed");
                        self.record_failure(&job, &e).await;
                    }
                }
                FeedOutcome::failed(job.url, &e)
            }
        }
    }

    async fn sync_feed(
        &self,
        job: &mut FeedJob,
        cancel: &CancellationToken,
    ) -> Result<FeedOutcome, FetchError> {
        let now = chrono::Utc::now().timestamp();
        let existing = self.db.get_feed_by_url(&job.url).await?;

        if let (Some(max_age), Some(last)) = (
            self.config.max_age,
            existing.as_ref().and_then(|f| f.last_fetched),
        ) {
            let age = now.saturating_sub(last);
            if age >= 0 && (age as u64) < max_age.as_secs() {
                job.advance(JobState::Skipped);
                tracing::debug!(feed = %job.url, age_secs = age, "Fetched recently, skipping");
                return Ok(FeedOutcome::from_state(job.url.clone(), job.state));
            }
        }

        let feed_id = match &existing {
            Some(feed) => feed.id,
            None => self.db.ensure_feed(&job.url).await?,
        };
        let validators = if self.config.force {
            None
        } else {
            existing
                .as_ref()
                .map(|f| &f.validators)
                .filter(|v| !v.is_empty())
        };

        job.advance(JobState::Fetching);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = fetch_feed(&self.client, &job.url, validators, self.config.timeout) => response?,
        };

        let fetched = match response {
            FetchResponse::NotModified => {
                job.http_status = Some(304);
                self.db
                    .upsert_feed_meta(&FeedMeta {
                        url: job.url.clone(),
                        fetched_at: now,
                        status: Some(304),
                        ..Default::default()
                    })
                    .await?;
                job.advance(JobState::NotModified);
                tracing::info!(feed = %job.url, "Not modified");
                return Ok(FeedOutcome::from_state(job.url.clone(), job.state));
            }
            FetchResponse::Modified(fetched) => fetched,
        };
        job.http_status = Some(fetched.status);

        job.advance(JobState::Parsing);
        let parsed = parse_feed(&fetched.body, fetched.content_type.as_deref())?;

        job.advance(JobState::Reconciling);
        let active = self.db.get_active_items(feed_id).await?;
        let archived = self.db.get_archived_items(feed_id).await?;
        let delta = reconcile(&parsed.items, &active, &archived, now);
        let applied = self.db.apply_delta(feed_id, &delta).await?;

        // Validators are only stored once the items they describe are committed.
        let meta = FeedMeta {
            url: job.url.clone(),
            fetched_at: now,
            status: Some(fetched.status),
            error: None,
            validators: Some(fetched.validators),
            title: parsed.title,
            description: parsed.description,
            link: parsed.link,
        };
        if let Err(e) = self.db.upsert_feed_meta(&meta).await {
            tracing::warn!(feed = %job.url, error = %e, "Items committed but feed metadata update failed");
        }
        job.advance(JobState::Committed);

        let mut outcome = FeedOutcome::committed(job.url.clone(), applied.counts);
        outcome.unfurl_dropped = self.hand_off_inserted(&job.url, feed_id, &applied.inserted);
        log_commit(&job.url, parsed.format, applied.counts);
        Ok(outcome)
    }

    /// Queue an unfurl request for each inserted item with a link. Returns how
    /// many the queue refused; those items are not offered again.
    fn hand_off_inserted(&self, url: &str, feed_id: i64, inserted: &[InsertedItem]) -> usize {
        let Some(sink) = &self.unfurl else {
            return 0;
        };
        let mut dropped = 0;
        for item in inserted {
            let Some(link) = &item.link else { continue };
            let request = UnfurlRequest {
                item_id: item.item_id,
                feed_id,
                url: link.clone(),
            };
            if !sink.try_send(request) {
                tracing::warn!(feed = %url, guid = %item.guid, "Unfurl request dropped");
                dropped += 1;
            }
        }
        dropped
    }

    /// Record a failed attempt. Validators and descriptive fields are kept.
    async fn record_failure(&self, job: &FeedJob, error: &FetchError) {
        let meta = FeedMeta {
            url: job.url.clone(),
            fetched_at: chrono::Utc::now().timestamp(),
            status: error.status().or(job.http_status),
            error: Some(error.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.db.upsert_feed_meta(&meta).await {
            tracing::warn!(feed = %job.url, error = %e, "Failed to record fetch failure");
        }
    }
}

fn log_commit(url: &str, format: crate::feed::FeedFormat, counts: DeltaCounts) {
    tracing::info!(
        feed = %url,
        format = ?format,
        inserted = counts.inserted,
        updated = counts.updated,
        archived = counts.archived,
        resurrected = counts.resurrected,
        unchanged = counts.unchanged,
        "Committed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ItemFilter;
    use crate::sync::{unfurl_channel, OutcomeStatus};
    use crate::feed::ErrorKind;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Test Feed</title>
    <link>https://example.com/</link>
    <item><guid>1</guid><title>One</title><link>https://example.com/1</link></item>
    <item><guid>2</guid><title>Two</title><link>https://example.com/2</link></item>
</channel></rss>"#;

    async fn setup() -> (Database, reqwest::Client) {
        let db = Database::open(":memory:").await.unwrap();
        let client = crate::feed::build_client().unwrap();
        (db, client)
    }

    async fn mount_feed(server: &MockServer, route: &str, body: &str) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_run_commits_new_feed() {
        let server = MockServer::start().await;
        mount_feed(&server, "/feed", RSS).await;
        let (db, client) = setup().await;

        let url = format!("{}/feed", server.uri());
        let scheduler = Scheduler::new(db.clone(), client, SchedulerConfig::default());
        let summary = scheduler.run(&[url.clone()], CancellationToken::new()).await;

        assert_eq!(summary.committed, 1);
        let outcome = summary.outcome(&url).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Committed);
        assert_eq!(outcome.inserted, 2);

        let feed = db.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(feed.title.as_deref(), Some("Test Feed"));
        assert_eq!(feed.last_status, Some(200));
        let items = db.get_items(feed.id, ItemFilter::Active).await.unwrap();
        assert_eq!(items.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_urls_processed_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .expect(1)
            .mount(&server)
            .await;
        let (db, client) = setup().await;

        let url = format!("{}/feed", server.uri());
        let urls = vec![url.clone(), format!("{}#top", url), url.clone()];
        let summary = Scheduler::new(db, client, SchedulerConfig::default())
            .run(&urls, CancellationToken::new())
            .await;

        assert_eq!(summary.outcomes.len(), 1);
        assert_eq!(summary.committed, 1);
    }

    #[tokio::test]
    async fn test_invalid_url_reported_not_fetched() {
        let (db, client) = setup().await;
        let summary = Scheduler::new(db.clone(), client, SchedulerConfig::default())
            .run(&["ftp://example.com/feed".to_string()], CancellationToken::new())
            .await;

        assert!(summary.all_failed());
        assert_eq!(summary.outcomes[0].error_kind, Some(ErrorKind::InvalidUrl));
        assert!(db.list_feeds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_age_skips_without_network() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .expect(1)
            .mount(&server)
            .await;
        let (db, client) = setup().await;
        let url = format!("{}/feed", server.uri());

        let config = SchedulerConfig {
            max_age: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let scheduler = Scheduler::new(db, client, config);

        let first = scheduler.run(&[url.clone()], CancellationToken::new()).await;
        assert_eq!(first.committed, 1);

        let second = scheduler.run(&[url.clone()], CancellationToken::new()).await;
        assert_eq!(second.skipped, 1);
        assert_eq!(second.outcome(&url).unwrap().status, OutcomeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_parse_failure_keeps_items_and_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("ETag", "\"good\""),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body>maintenance</body></html>")
                    .insert_header("ETag", "\"bad\""),
            )
            .mount(&server)
            .await;
        let (db, client) = setup().await;
        let url = format!("{}/feed", server.uri());
        let scheduler = Scheduler::new(db.clone(), client, SchedulerConfig::default());

        scheduler.run(&[url.clone()], CancellationToken::new()).await;
        let summary = scheduler.run(&[url.clone()], CancellationToken::new()).await;

        let outcome = summary.outcome(&url).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Parse));

        let feed = db.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(feed.validators.etag.as_deref(), Some("\"good\""));
        assert_eq!(feed.consecutive_failures, 1);
        assert_eq!(feed.last_status, Some(200));
        assert!(feed.last_error.is_some());
        let counts = db.item_counts(feed.id).await.unwrap();
        assert_eq!(counts.active, 2);
        assert_eq!(counts.archived, 0);
    }

    #[tokio::test]
    async fn test_unfurl_receives_inserted_links() {
        let server = MockServer::start().await;
        mount_feed(&server, "/feed", RSS).await;
        let (db, client) = setup().await;
        let (sink, mut rx) = unfurl_channel(16);

        let url = format!("{}/feed", server.uri());
        let scheduler =
            Scheduler::new(db.clone(), client, SchedulerConfig::default()).with_unfurl(sink);
        scheduler.run(&[url.clone()], CancellationToken::new()).await;

        let mut links = Vec::new();
        while let Ok(req) = rx.try_recv() {
            links.push(req.url);
        }
        links.sort();
        assert_eq!(
            links,
            vec![
                "https://example.com/1".to_string(),
                "https://example.com/2".to_string()
            ]
        );

        // Nothing new on the second pass
        scheduler.run(&[url], CancellationToken::new()).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unfurl_overflow_is_counted() {
        let items: String = (1..=5)
            .map(|i| {
                format!(
                    "<item><guid>{i}</guid><title>Post {i}</title><link>https://example.com/{i}</link></item>"
                )
            })
            .collect();
        let body = format!(r#"<rss version="2.0"><channel><title>Busy</title>{}</channel></rss>"#, items);
        let server = MockServer::start().await;
        mount_feed(&server, "/feed", &body).await;
        let (db, client) = setup().await;
        let (sink, mut rx) = unfurl_channel(2);

        let url = format!("{}/feed", server.uri());
        let summary = Scheduler::new(db, client, SchedulerConfig::default())
            .with_unfurl(sink)
            .run(&[url.clone()], CancellationToken::new())
            .await;

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        let outcome = summary.outcome(&url).unwrap();
        assert_eq!(outcome.inserted, 5);
        assert_eq!(received, 2);
        assert_eq!(outcome.unfurl_dropped, 3);
        assert_eq!(summary.unfurl_dropped, 3);
    }

    #[tokio::test]
    async fn test_storage_failure_still_records_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .insert_header("ETag", "\"v1\""),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        let replacement = RSS.replace("<guid>2</guid>", "<guid>3</guid>");
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(replacement)
                    .insert_header("ETag", "\"v2\""),
            )
            .mount(&server)
            .await;
        let (db, client) = setup().await;
        let url = format!("{}/feed", server.uri());
        let scheduler = Scheduler::new(db.clone(), client, SchedulerConfig::default());
        scheduler.run(&[url.clone()], CancellationToken::new()).await;

        sqlx::query(
            "CREATE TRIGGER reject_items BEFORE INSERT ON items \
             BEGIN SELECT RAISE(ABORT, 'disk full'); END",
        )
        .execute(&db.pool)
        .await
        .unwrap();
        let before = db.get_feed_by_url(&url).await.unwrap().unwrap();

        let summary = scheduler.run(&[url.clone()], CancellationToken::new()).await;
        let outcome = summary.outcome(&url).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Storage));

        let feed = db.get_feed_by_url(&url).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 1);
        assert_eq!(feed.last_status, Some(200));
        assert!(feed.last_error.is_some());
        assert!(feed.last_fetched.is_some());
        assert_eq!(feed.validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(feed.validators, before.validators);

        // The whole delta rolled back: item 2 not archived, item 3 not stored
        let active = db.get_active_items(feed.id).await.unwrap();
        let guids: Vec<&str> = active.iter().map(|i| i.guid.as_str()).collect();
        assert_eq!(guids, vec!["1", "2"]);
        assert!(db.get_archived_items(feed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .expect(0)
            .mount(&server)
            .await;
        let (db, client) = setup().await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let urls = vec![
            format!("{}/a", server.uri()),
            format!("{}/b", server.uri()),
        ];
        let summary = Scheduler::new(db, client, SchedulerConfig::default())
            .run(&urls, cancel)
            .await;

        assert!(summary.cancelled);
        assert_eq!(summary.failed, 2);
        assert!(summary
            .outcomes
            .iter()
            .all(|o| o.error_kind == Some(ErrorKind::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_abandons_slow_feed() {
        let server = MockServer::start().await;
        mount_feed(&server, "/fast", RSS).await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(RSS)
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;
        let (db, client) = setup().await;

        let fast = format!("{}/fast", server.uri());
        let slow = format!("{}/slow", server.uri());
        let config = SchedulerConfig {
            deadline: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let summary = Scheduler::new(db.clone(), client, config)
            .run(&[fast.clone(), slow.clone()], CancellationToken::new())
            .await;

        assert!(summary.cancelled);
        assert_eq!(summary.outcome(&fast).unwrap().status, OutcomeStatus::Committed);
        let slow_outcome = summary.outcome(&slow).unwrap();
        assert_eq!(slow_outcome.status, OutcomeStatus::Failed);
        assert_eq!(slow_outcome.error_kind, Some(ErrorKind::Cancelled));

        // A cancelled attempt is not counted as a feed failure
        let feed = db.get_feed_by_url(&slow).await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 0);
    }
}
