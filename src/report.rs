use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{
    store::RaidStore,
    types::{Participant, PostId, Submission},
    verifier::{Engager, EngagementVerifier},
};

const REPORT_CHUNK_CHARS: usize = 1900;
const RULE: &str = "═══════════════════════════════════════";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportEntry {
    pub participant: Participant,
    pub handle: Option<String>,
    pub matched: usize,
    pub required: usize,
    pub percent: u32,
    /// Why verification came up short, if it did.
    pub failure: Option<String>,
}

impl ReportEntry {
    pub fn is_complete(&self) -> bool {
        !self.participant.is_ghost() && self.percent >= 100
    }
}

#[derive(Debug, Clone)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub total_targets: usize,
    /// Sorted by raw match count, highest first; ties keep submission order.
    pub entries: Vec<ReportEntry>,
}

/// Posts a participant must reply to: everyone else's, never fewer than one.
pub fn requirement(total_targets: usize, own_submissions: usize) -> usize {
    total_targets.saturating_sub(own_submissions).max(1)
}

pub fn completion_percent(matched: usize, required: usize) -> u32 {
    let required = required.max(1);
    ((100 * matched) / required).min(100) as u32
}

/// Score every attributed participant of the window, one at a time.
/// A participant whose verification fails scores 0; the report still completes.
pub async fn generate_report(
    submissions: &[Submission],
    store: &dyn RaidStore,
    verifier: &EngagementVerifier,
    pace: Duration,
) -> Report {
    let all_posts: HashSet<&PostId> = submissions.iter().map(|s| &s.post_id).collect();

    let mut order: Vec<&Participant> = Vec::new();
    let mut own: HashMap<&Participant, HashSet<&PostId>> = HashMap::new();
    for s in submissions {
        let posts = own.entry(&s.participant).or_insert_with(|| {
            order.push(&s.participant);
            HashSet::new()
        });
        posts.insert(&s.post_id);
    }

    info!(
        participants = order.len(),
        targets = all_posts.len(),
        "report run started"
    );

    let mut entries = Vec::with_capacity(order.len());
    let mut queried_any = false;
    for participant in order {
        let own_posts = own.get(participant).cloned().unwrap_or_default();
        let required = requirement(all_posts.len(), own_posts.len());
        let mut entry = ReportEntry {
            participant: participant.clone(),
            handle: None,
            matched: 0,
            required,
            percent: 0,
            failure: None,
        };

        match participant {
            Participant::Ghost(handle) => {
                entry.handle = Some(handle.clone());
            }
            Participant::Registered(key) => match store.participant(key) {
                Ok(Some(registered)) => {
                    if queried_any && !pace.is_zero() {
                        tokio::time::sleep(pace).await;
                    }
                    queried_any = true;

                    let targets: HashSet<PostId> = all_posts
                        .iter()
                        .filter(|p| !own_posts.contains(*p))
                        .map(|p| (*p).clone())
                        .collect();
                    let who = Engager {
                        stable_id: registered.stable_id,
                        handle: registered.handle.clone(),
                    };
                    let outcome = verifier.count_matched_replies(&who, &targets).await;
                    entry.handle = Some(registered.handle);
                    entry.matched = outcome.matched.min(required);
                    entry.failure = outcome.failure;
                }
                Ok(None) => {
                    warn!(key = %key, "attributed participant is not registered");
                    entry.failure = Some("not registered".to_string());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "participant lookup failed");
                    entry.failure = Some(e.to_string());
                }
            },
        }

        entry.percent = completion_percent(entry.matched, entry.required);
        entries.push(entry);
    }

    entries.sort_by(|a, b| b.matched.cmp(&a.matched));
    info!(entries = entries.len(), "report run finished");

    Report {
        generated_at: Utc::now(),
        total_targets: all_posts.len(),
        entries,
    }
}

impl Report {
    pub fn complete(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| e.is_complete())
    }

    pub fn incomplete(&self) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(|e| !e.is_complete())
    }

    /// Plain-text report, split into chat-sized chunks on line boundaries.
    pub fn render(&self) -> Vec<String> {
        let mut lines = vec![
            RULE.to_string(),
            format!("📊 RAID REPORT — {}", self.generated_at.format("%Y-%m-%d")),
            RULE.to_string(),
            String::new(),
            "📈 STATISTICS".to_string(),
            format!("▸ Total posts: {}", self.total_targets),
            format!("▸ Participants: {}", self.entries.len()),
            "▸ Self-reply: not required".to_string(),
            String::new(),
            "✅ 100% completed:".to_string(),
        ];
        let mut any = false;
        for entry in self.complete() {
            lines.push(format!("  ▸ {}", entry_line(entry)));
            any = true;
        }
        if !any {
            lines.push("  (none)".to_string());
        }

        lines.push(String::new());
        lines.push("⚠️ Incomplete:".to_string());
        any = false;
        for entry in self.incomplete() {
            lines.push(format!("  ▸ {}", entry_line(entry)));
            any = true;
        }
        if !any {
            lines.push("  (none)".to_string());
        }

        let issues: Vec<&ReportEntry> = self
            .entries
            .iter()
            .filter(|e| e.failure.is_some())
            .collect();
        if !issues.is_empty() {
            lines.push(String::new());
            lines.push("🛠 Verification issues:".to_string());
            for entry in issues {
                lines.push(format!(
                    "  ▸ {}: {}",
                    entry.participant,
                    entry.failure.as_deref().unwrap_or_default()
                ));
            }
        }
        lines.push(RULE.to_string());

        chunk_lines(&lines, REPORT_CHUNK_CHARS)
    }
}

fn entry_line(entry: &ReportEntry) -> String {
    let who = match (&entry.participant, &entry.handle) {
        (Participant::Registered(_), Some(handle)) => format!("{} (@{handle})", entry.participant),
        _ => entry.participant.to_string(),
    };
    format!(
        "{who} — {}/{} ({}%)",
        entry.matched, entry.required, entry.percent
    )
}

fn chunk_lines(lines: &[String], max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in lines {
        let needed = line.chars().count() + 1;
        if !current.is_empty() && current.chars().count() + needed > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
