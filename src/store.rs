use std::{fs, path::Path, sync::Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;

use crate::types::{
    Participant, ParticipantKey, PostId, RegisteredParticipant, SessionStatus, StableId, Submission,
};

pub const SETTING_CHANNEL: &str = "channel_id";
pub const SETTING_ADMIN_ROLE: &str = "admin_role_id";
pub const SETTING_HOURS: [&str; 3] = ["schedule_hour_1", "schedule_hour_2", "schedule_hour_3"];
pub const SETTING_STATUS: &str = "session_status";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS participants (
    participant_key TEXT PRIMARY KEY,
    handle          TEXT NOT NULL,
    stable_id       TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS participants_handle
    ON participants (handle COLLATE NOCASE);
CREATE TABLE IF NOT EXISTS submissions (
    post_id          TEXT PRIMARY KEY,
    participant_kind TEXT NOT NULL,
    participant_ref  TEXT NOT NULL
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Durable settings, participants and the current window's submissions.
pub trait RaidStore: Send + Sync {
    fn setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn participant(
        &self,
        key: &ParticipantKey,
    ) -> Result<Option<RegisteredParticipant>, StoreError>;
    /// Case-insensitive.
    fn participant_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<RegisteredParticipant>, StoreError>;
    /// Returns `false` when the key or the handle is already taken.
    fn insert_participant(&self, participant: &RegisteredParticipant) -> Result<bool, StoreError>;

    fn clear_submissions(&self) -> Result<(), StoreError>;
    /// The post id is the key; a later attribution replaces an earlier one.
    fn upsert_submission(&self, submission: &Submission) -> Result<(), StoreError>;
    /// In first-submitted order.
    fn submissions(&self) -> Result<Vec<Submission>, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&conn)
    }
}

fn participant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RegisteredParticipant> {
    Ok(RegisteredParticipant {
        key: ParticipantKey(row.get(0)?),
        handle: row.get(1)?,
        stable_id: StableId(row.get(2)?),
    })
}

fn decode_participant(kind: &str, reference: String) -> Result<Participant, StoreError> {
    match kind {
        "registered" => Ok(Participant::Registered(ParticipantKey(reference))),
        "ghost" => Ok(Participant::Ghost(reference)),
        other => Err(StoreError::Corrupt(format!(
            "unknown participant kind `{other}`"
        ))),
    }
}

impl RaidStore for SqliteStore {
    fn setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    fn participant(
        &self,
        key: &ParticipantKey,
    ) -> Result<Option<RegisteredParticipant>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT participant_key, handle, stable_id FROM participants
                     WHERE participant_key = ?1",
                    params![key.as_str()],
                    participant_from_row,
                )
                .optional()?)
        })
    }

    fn participant_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<RegisteredParticipant>, StoreError> {
        let handle = handle.trim().trim_start_matches('@');
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT participant_key, handle, stable_id FROM participants
                     WHERE handle = ?1 COLLATE NOCASE",
                    params![handle],
                    participant_from_row,
                )
                .optional()?)
        })
    }

    fn insert_participant(&self, participant: &RegisteredParticipant) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO participants (participant_key, handle, stable_id)
                 VALUES (?1, ?2, ?3)",
                params![
                    participant.key.as_str(),
                    participant.handle,
                    participant.stable_id.as_str()
                ],
            )?;
            Ok(changed == 1)
        })
    }

    fn clear_submissions(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM submissions", [])?;
            Ok(())
        })
    }

    fn upsert_submission(&self, submission: &Submission) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO submissions (post_id, participant_kind, participant_ref)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(post_id) DO UPDATE SET
                    participant_kind = excluded.participant_kind,
                    participant_ref = excluded.participant_ref",
                params![
                    submission.post_id.as_str(),
                    submission.participant.kind_str(),
                    submission.participant.reference()
                ],
            )?;
            Ok(())
        })
    }

    fn submissions(&self) -> Result<Vec<Submission>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT post_id, participant_kind, participant_ref FROM submissions
                 ORDER BY rowid",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                let (post_id, kind, reference) = row?;
                out.push(Submission {
                    post_id: PostId(post_id),
                    participant: decode_participant(&kind, reference)?,
                });
            }
            Ok(out)
        })
    }
}

/// Typed view over the settings table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub channel_id: Option<String>,
    pub admin_role_id: Option<String>,
    pub schedule_hours: [u8; 3],
    pub status: SessionStatus,
}

impl Settings {
    pub fn load(store: &dyn RaidStore, default_hours: [u8; 3]) -> Result<Self, StoreError> {
        let mut schedule_hours = default_hours;
        for (slot, key) in schedule_hours.iter_mut().zip(SETTING_HOURS) {
            if let Some(hour) = store
                .setting(key)?
                .and_then(|raw| raw.trim().parse::<u8>().ok())
                .filter(|h| *h <= 23)
            {
                *slot = hour;
            }
        }
        Ok(Self {
            channel_id: store.setting(SETTING_CHANNEL)?.filter(|s| !s.is_empty()),
            admin_role_id: store.setting(SETTING_ADMIN_ROLE)?.filter(|s| !s.is_empty()),
            schedule_hours,
            status: load_status(store)?,
        })
    }
}

pub fn load_status(store: &dyn RaidStore) -> Result<SessionStatus, StoreError> {
    Ok(store
        .setting(SETTING_STATUS)?
        .and_then(|raw| SessionStatus::parse(&raw))
        .unwrap_or_default())
}

pub fn save_status(store: &dyn RaidStore, status: SessionStatus) -> Result<(), StoreError> {
    store.set_setting(SETTING_STATUS, status.as_str())
}

pub fn save_schedule_hours(store: &dyn RaidStore, hours: [u8; 3]) -> Result<(), StoreError> {
    for (hour, key) in hours.iter().zip(SETTING_HOURS) {
        store.set_setting(key, &hour.to_string())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(key: &str, handle: &str, id: &str) -> RegisteredParticipant {
        RegisteredParticipant {
            key: ParticipantKey::new(key),
            handle: handle.to_string(),
            stable_id: StableId(id.to_string()),
        }
    }

    #[test]
    fn participant_is_found_by_key_and_case_insensitive_handle() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(store.insert_participant(&participant("A", "foo", "42")).expect("insert"));

        let by_key = store.participant(&ParticipantKey::new("A")).expect("query");
        let by_handle = store.participant_by_handle("FOO").expect("query");
        assert_eq!(by_key, Some(participant("A", "foo", "42")));
        assert_eq!(by_handle, by_key);
        assert_eq!(store.participant_by_handle("@Foo").expect("query"), by_key);
    }

    #[test]
    fn duplicate_key_or_handle_is_not_inserted() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(store.insert_participant(&participant("A", "foo", "42")).expect("insert"));
        assert!(!store.insert_participant(&participant("A", "bar", "43")).expect("insert"));
        assert!(!store.insert_participant(&participant("B", "FOO", "44")).expect("insert"));
        let kept = store.participant(&ParticipantKey::new("A")).expect("query");
        assert_eq!(kept.map(|p| p.handle).as_deref(), Some("foo"));
    }

    #[test]
    fn submission_upsert_keeps_first_position_and_last_attribution() {
        let store = SqliteStore::open_in_memory().expect("open");
        let first = Submission {
            post_id: PostId::new("1"),
            participant: Participant::Registered(ParticipantKey::new("A")),
        };
        let second = Submission {
            post_id: PostId::new("2"),
            participant: Participant::ghost("ghosty"),
        };
        store.upsert_submission(&first).expect("upsert");
        store.upsert_submission(&second).expect("upsert");
        let reattributed = Submission {
            post_id: PostId::new("1"),
            participant: Participant::Registered(ParticipantKey::new("B")),
        };
        store.upsert_submission(&reattributed).expect("upsert");

        let all = store.submissions().expect("list");
        assert_eq!(all, vec![reattributed, second]);

        store.clear_submissions().expect("clear");
        assert!(store.submissions().expect("list").is_empty());
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.set_setting(SETTING_HOURS[1], "99").expect("set");
        let settings = Settings::load(&store, [8, 14, 21]).expect("load");
        assert_eq!(settings.schedule_hours, [8, 14, 21]);
        assert_eq!(settings.channel_id, None);
        assert_eq!(settings.status, SessionStatus::Idle);

        save_schedule_hours(&store, [1, 2, 3]).expect("save");
        store.set_setting(SETTING_CHANNEL, "raids").expect("set");
        save_status(&store, SessionStatus::Locked).expect("save");
        let settings = Settings::load(&store, [8, 14, 21]).expect("load");
        assert_eq!(settings.schedule_hours, [1, 2, 3]);
        assert_eq!(settings.channel_id.as_deref(), Some("raids"));
        assert_eq!(settings.status, SessionStatus::Locked);
    }

    #[test]
    fn submissions_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("raid.db");
        {
            let store = SqliteStore::open(&path).expect("open");
            save_status(&store, SessionStatus::Open).expect("status");
            store
                .upsert_submission(&Submission {
                    post_id: PostId::new("9"),
                    participant: Participant::Registered(ParticipantKey::new("A")),
                })
                .expect("upsert");
        }
        let reopened = SqliteStore::open(&path).expect("reopen");
        assert_eq!(load_status(&reopened).expect("status"), SessionStatus::Open);
        assert_eq!(reopened.submissions().expect("list").len(), 1);
    }
}
