use std::{collections::HashSet, future::Future, sync::Arc};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    api::{ApiError, DirectoryApi},
    config::{VerifierConfig, VerifyStrategy},
    json_scan::{FieldVariants, collect_values_outside, next_cursor, reply_targets},
    types::{PostId, StableId},
};

/// The account whose engagement is being checked.
#[derive(Debug, Clone)]
pub struct Engager {
    pub stable_id: StableId,
    pub handle: String,
}

/// Result of one verification pass. `failure` is for operator visibility only;
/// `matched` already reflects whatever was found before it happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
    pub matched: usize,
    pub pages: usize,
    pub failure: Option<String>,
}

#[derive(Clone)]
pub struct EngagementVerifier {
    api: Arc<dyn DirectoryApi>,
    fields: FieldVariants,
    cfg: VerifierConfig,
}

impl EngagementVerifier {
    pub fn new(api: Arc<dyn DirectoryApi>, fields: FieldVariants, cfg: VerifierConfig) -> Self {
        Self { api, fields, cfg }
    }

    /// How many of `targets` the engager replied to. Never errors; never
    /// exceeds `targets.len()`.
    pub async fn count_matched_replies(
        &self,
        who: &Engager,
        targets: &HashSet<PostId>,
    ) -> Verification {
        if targets.is_empty() {
            return Verification::default();
        }
        let mut outcome = match self.cfg.strategy {
            VerifyStrategy::Replies => self.scan_reply_history(who, targets).await,
            VerifyStrategy::Comments => self.scan_target_comments(who, targets).await,
        };
        outcome.matched = outcome.matched.min(targets.len());
        info!(
            handle = %who.handle,
            matched = outcome.matched,
            targets = targets.len(),
            pages = outcome.pages,
            "verification finished"
        );
        outcome
    }

    async fn scan_reply_history(&self, who: &Engager, targets: &HashSet<PostId>) -> Verification {
        let mut matched: HashSet<&PostId> = HashSet::new();
        let mut seen_cursors: HashSet<String> = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;
        let mut failure = None;

        while pages < self.cfg.max_pages {
            let page = self
                .with_retry("reply page", || {
                    self.api.replies_by_user(
                        who.stable_id.as_str(),
                        self.cfg.page_size,
                        cursor.as_deref(),
                    )
                })
                .await;
            let body = match page {
                Ok(body) => body,
                Err(e) => {
                    warn!(handle = %who.handle, page = pages + 1, error = %e, "aborting reply scan");
                    failure = Some(format!("page {}: {e}", pages + 1));
                    break;
                }
            };
            pages += 1;

            for id in reply_targets(&body, &self.fields) {
                if let Some(target) = targets.get(&PostId(id)) {
                    matched.insert(target);
                }
            }
            if matched.len() >= targets.len() {
                debug!(handle = %who.handle, "all targets matched, stopping early");
                break;
            }

            match next_cursor(&body, &self.fields) {
                Some(next) if seen_cursors.insert(next.clone()) => cursor = Some(next),
                Some(_) => {
                    debug!(handle = %who.handle, "cursor did not advance, stopping");
                    break;
                }
                None => break,
            }
        }

        Verification {
            matched: matched.len(),
            pages,
            failure,
        }
    }

    async fn scan_target_comments(&self, who: &Engager, targets: &HashSet<PostId>) -> Verification {
        let mut matched = 0;
        let mut pages = 0;
        let mut failures = Vec::new();

        let mut ordered: Vec<&PostId> = targets.iter().collect();
        ordered.sort();
        for post_id in ordered {
            let fetched = self
                .with_retry("comment page", || {
                    self.api.comments_by_post(post_id, self.cfg.comments_per_post)
                })
                .await;
            match fetched {
                Ok(body) => {
                    pages += 1;
                    if self.commented_by(&body, who) {
                        matched += 1;
                    }
                }
                Err(e) => {
                    warn!(handle = %who.handle, post_id = %post_id, error = %e, "comment fetch failed");
                    failures.push(format!("post {post_id}: {e}"));
                }
            }
        }

        Verification {
            matched,
            pages,
            failure: (!failures.is_empty()).then(|| failures.join("; ")),
        }
    }

    /// Only author fields count; mentions and quoted posts name other accounts.
    fn commented_by(&self, body: &Value, who: &Engager) -> bool {
        let skip = &self.fields.foreign_account_keys;
        let by_id = collect_values_outside(body, &self.fields.author_id_keys, skip)
            .iter()
            .any(|id| id == who.stable_id.as_str());
        by_id
            || collect_values_outside(body, &self.fields.author_handle_keys, skip)
                .iter()
                .any(|h| h.trim_start_matches('@').eq_ignore_ascii_case(&who.handle))
    }

    /// Fetch one page and report how many reply relations it carries.
    pub async fn probe(&self, stable_id: &StableId) -> Result<(usize, bool), ApiError> {
        let body = self
            .with_retry("probe page", || {
                self.api
                    .replies_by_user(stable_id.as_str(), self.cfg.page_size, None)
            })
            .await?;
        let replies: HashSet<String> = reply_targets(&body, &self.fields).into_iter().collect();
        Ok((replies.len(), next_cursor(&body, &self.fields).is_some()))
    }

    /// Retry the same request on rate limiting, following the backoff schedule.
    async fn with_retry<F, Fut>(&self, what: &str, mut call: F) -> Result<Value, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Value, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(ApiError::RateLimited) if attempt < self.cfg.retry_budget => {
                    let wait = self.cfg.backoff(attempt);
                    warn!(
                        what,
                        attempt = attempt + 1,
                        wait_ms = wait.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
