use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::{json_scan::FieldVariants, scheduler::validate_schedule, types::ParticipantKey};

const ENV_API_KEY: &str = "RAPID_API_KEY";
const ENV_API_HOST: &str = "RAPID_API_HOST";
const ENV_DB_PATH: &str = "RAIDBOT_DB";
const ENV_SUPER_ADMIN: &str = "RAIDBOT_SUPER_ADMIN";
const ENV_CONFIG_FILE: &str = "RAIDBOT_CONFIG";
const ENV_API_TIMEOUT_MS: &str = "API_TIMEOUT_MS";
const DEFAULT_CONFIG_FILENAME: &str = "raidbot.toml";
const DEFAULT_API_HOST: &str = "twitter241.p.rapidapi.com";
const DEFAULT_DB_PATH: &str = "./data/raid.db";
const DEFAULT_API_TIMEOUT_MS: u64 = 20_000;
const MIN_API_TIMEOUT_MS: u64 = 15_000;
const MAX_API_TIMEOUT_MS: u64 = 25_000;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub key: String,
    pub host: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyStrategy {
    /// Page through the participant's own reply history.
    #[default]
    Replies,
    /// Scan each target post's comments for the participant.
    Comments,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    pub strategy: VerifyStrategy,
    pub max_pages: usize,
    pub page_size: usize,
    pub retry_budget: usize,
    pub backoff_ms: Vec<u64>,
    /// Pause between participants during a report run.
    pub pace_ms: u64,
    /// Comments fetched per target post by the comment strategy.
    pub comments_per_post: usize,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            strategy: VerifyStrategy::Replies,
            max_pages: 5,
            page_size: 40,
            retry_budget: 3,
            backoff_ms: vec![2_000, 5_000, 10_000],
            pace_ms: 1_500,
            comments_per_post: 100,
        }
    }
}

impl VerifierConfig {
    /// Backoff before retry number `attempt` (0-based); the last step repeats.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .or_else(|| self.backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    pub fn pace(&self) -> Duration {
        Duration::from_millis(self.pace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Hours of day (UTC) used until an admin sets their own.
    pub default_hours: [u8; 3],
    /// Delay between an open trigger and its report trigger.
    pub report_delay_hours: u8,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_hours: [8, 14, 21],
            report_delay_hours: 3,
        }
    }
}

/// Optional on-disk overrides (`raidbot.toml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    verifier: VerifierConfig,
    schedule: ScheduleConfig,
    fields: FieldVariants,
}

#[derive(Debug, Clone)]
pub struct RaidConfig {
    pub api: ApiConfig,
    pub db_path: PathBuf,
    pub super_admin: Option<ParticipantKey>,
    pub verifier: VerifierConfig,
    pub schedule: ScheduleConfig,
    pub fields: FieldVariants,
}

impl RaidConfig {
    /// Environment first, then the optional TOML file for tuning knobs.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var(ENV_API_KEY)
            .with_context(|| format!("{ENV_API_KEY} env var not set"))?;
        let host = std::env::var(ENV_API_HOST).unwrap_or_else(|_| DEFAULT_API_HOST.to_string());
        let timeout_ms = std::env::var(ENV_API_TIMEOUT_MS)
            .ok()
            .and_then(|ms| ms.parse::<u64>().ok())
            .unwrap_or(DEFAULT_API_TIMEOUT_MS)
            .clamp(MIN_API_TIMEOUT_MS, MAX_API_TIMEOUT_MS);
        let db_path = std::env::var(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));
        let super_admin = std::env::var(ENV_SUPER_ADMIN)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(ParticipantKey::new);

        let file = load_file_config()?;

        Ok(Self {
            api: ApiConfig {
                key,
                host,
                timeout: Duration::from_millis(timeout_ms),
            },
            db_path,
            super_admin,
            verifier: file.verifier,
            schedule: file.schedule,
            fields: file.fields,
        })
    }
}

fn load_file_config() -> Result<FileConfig> {
    let explicit = std::env::var(ENV_CONFIG_FILE).ok().map(PathBuf::from);
    let path = match explicit {
        Some(path) => path,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_FILENAME);
            if !default.exists() {
                return Ok(FileConfig::default());
            }
            default
        }
    };
    let text =
        fs::read_to_string(&path).with_context(|| format!("failed to read `{}`", path.display()))?;
    parse_file_config(&text).with_context(|| format!("invalid config `{}`", path.display()))
}

fn parse_file_config(text: &str) -> Result<FileConfig> {
    let cfg: FileConfig = toml::from_str(text)?;
    validate_schedule(cfg.schedule.default_hours, cfg.schedule.report_delay_hours)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_file_config("").expect("parse");
        assert_eq!(cfg.verifier.max_pages, 5);
        assert_eq!(cfg.verifier.strategy, VerifyStrategy::Replies);
        assert_eq!(cfg.schedule.default_hours, [8, 14, 21]);
        assert_eq!(cfg.schedule.report_delay_hours, 3);
    }

    #[test]
    fn file_overrides_selected_knobs() {
        let text = r#"
[verifier]
strategy = "comments"
max_pages = 9
backoff_ms = [100]

[schedule]
default_hours = [1, 9, 17]

[fields]
cursor_keys = ["nextPage"]
"#;
        let cfg = parse_file_config(text).expect("parse");
        assert_eq!(cfg.verifier.strategy, VerifyStrategy::Comments);
        assert_eq!(cfg.verifier.max_pages, 9);
        assert_eq!(cfg.verifier.page_size, 40);
        assert_eq!(cfg.schedule.default_hours, [1, 9, 17]);
        assert_eq!(cfg.fields.cursor_keys, vec!["nextPage"]);
    }

    #[test]
    fn out_of_range_hour_is_rejected() {
        assert!(parse_file_config("[schedule]\ndefault_hours = [8, 14, 24]").is_err());
    }

    #[test]
    fn overlapping_windows_are_rejected() {
        assert!(parse_file_config("[schedule]\ndefault_hours = [8, 10, 20]").is_err());
        assert!(parse_file_config("[schedule]\nreport_delay_hours = 1").is_err());
        let spaced = "[schedule]\ndefault_hours = [0, 6, 12]\nreport_delay_hours = 5";
        assert_eq!(
            parse_file_config(spaced).expect("parse").schedule.default_hours,
            [0, 6, 12]
        );
    }

    #[test]
    fn backoff_repeats_last_step() {
        let cfg = VerifierConfig {
            backoff_ms: vec![10, 20],
            ..VerifierConfig::default()
        };
        assert_eq!(cfg.backoff(0), Duration::from_millis(10));
        assert_eq!(cfg.backoff(1), Duration::from_millis(20));
        assert_eq!(cfg.backoff(5), Duration::from_millis(20));
        let empty = VerifierConfig {
            backoff_ms: Vec::new(),
            ..VerifierConfig::default()
        };
        assert_eq!(empty.backoff(0), Duration::ZERO);
    }
}
