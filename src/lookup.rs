use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
    api::DirectoryApi,
    json_scan::{
        FieldVariants, collect_values, collect_values_outside, first_value, is_plausible_stable_id,
    },
    types::{PostId, StableId},
};

/// Resolves handles and posts against the external directory. Never fails:
/// every error degrades to `None` and is logged.
#[derive(Clone)]
pub struct DirectoryLookup {
    api: Arc<dyn DirectoryApi>,
    fields: FieldVariants,
}

impl DirectoryLookup {
    pub fn new(api: Arc<dyn DirectoryApi>, fields: FieldVariants) -> Self {
        Self { api, fields }
    }

    pub async fn resolve_handle_to_id(&self, handle: &str) -> Option<StableId> {
        debug!(handle, "looking up stable id");
        let body = match self.api.user_by_handle(handle).await {
            Ok(body) => body,
            Err(e) => {
                warn!(handle, error = %e, "handle lookup failed");
                return None;
            }
        };

        let preferred = first_value(&body, &self.fields.stable_id_keys)
            .filter(|id| id.bytes().all(|b| b.is_ascii_digit()));
        let found = preferred.or_else(|| {
            collect_values(&body, &self.fields.fallback_id_keys)
                .into_iter()
                .find(|id| is_plausible_stable_id(id))
        });

        if found.is_none() {
            warn!(handle, "handle lookup returned no plausible id");
        }
        found.map(StableId)
    }

    /// Author handle of a post, lower-cased.
    pub async fn resolve_post_author(&self, post_id: &PostId) -> Option<String> {
        let body = match self.api.post_by_id(post_id).await {
            Ok(body) => body,
            Err(e) => {
                warn!(post_id = %post_id, error = %e, "post lookup failed");
                return None;
            }
        };
        let handle = collect_values_outside(
            &body,
            &self.fields.author_handle_keys,
            &self.fields.foreign_account_keys,
        )
        .into_iter()
        .next()
        .map(|h| h.trim_start_matches('@').to_ascii_lowercase());
        if handle.is_none() {
            warn!(post_id = %post_id, "post lookup returned no author");
        }
        handle
    }
}
