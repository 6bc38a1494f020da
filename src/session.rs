use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    lookup::DirectoryLookup,
    store::{RaidStore, SETTING_CHANNEL, StoreError, load_status, save_status},
    types::{Participant, ParticipantKey, PostId, RegisteredParticipant, SessionStatus, Submission},
};

pub const REGISTRATION_CONFIRM_WINDOW: Duration = Duration::from_secs(30);
const MAX_HANDLE_CHARS: usize = 15;

/// Why an operation was refused. The message is shown to whoever asked.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no raid channel is configured; set one with `set-channel`")]
    NoChannel,
    #[error("the raid window is not open")]
    NotOpen,
    #[error("unregistered! use `register @handle` first")]
    NotRegistered,
    #[error("one link per session")]
    AlreadySubmitted,
    #[error("could not resolve the author of post {0}")]
    AuthorUnresolved(PostId),
    #[error("already registered as @{0}; this cannot be changed")]
    AlreadyRegistered(String),
    #[error("@{0} is already linked to another participant")]
    HandleTaken(String),
    #[error("`{0}` is not a valid handle")]
    InvalidHandle(String),
    #[error("could not find @{0}; check the spelling and try again")]
    HandleNotFound(String),
    #[error("only admins can register other participants")]
    NotPermitted,
    #[error("nothing to confirm")]
    NoPendingRegistration,
    #[error("registration timed out")]
    RegistrationExpired,
    #[error("storage failure: {0}")]
    Store(String),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e.to_string())
    }
}

/// A registration waiting for its requester to confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRegistration {
    pub participant: RegisteredParticipant,
    pub expires_at: Instant,
}

/// The raid window: idle → open → locked → (report) → idle.
pub struct SessionMachine {
    store: Arc<dyn RaidStore>,
    lookup: DirectoryLookup,
    pending: HashMap<ParticipantKey, PendingRegistration>,
}

impl SessionMachine {
    pub fn new(store: Arc<dyn RaidStore>, lookup: DirectoryLookup) -> Self {
        Self {
            store,
            lookup,
            pending: HashMap::new(),
        }
    }

    pub fn status(&self) -> Result<SessionStatus, SessionError> {
        Ok(load_status(self.store.as_ref())?)
    }

    pub fn lookup(&self) -> &DirectoryLookup {
        &self.lookup
    }

    pub fn submissions(&self) -> Result<Vec<Submission>, SessionError> {
        Ok(self.store.submissions()?)
    }

    fn require_channel(&self) -> Result<String, SessionError> {
        self.store
            .setting(SETTING_CHANNEL)?
            .filter(|c| !c.is_empty())
            .ok_or(SessionError::NoChannel)
    }

    /// Start a fresh window. Calling it twice leaves the same state as once.
    pub fn open(&mut self) -> Result<(), SessionError> {
        self.require_channel()?;
        self.store.clear_submissions()?;
        save_status(self.store.as_ref(), SessionStatus::Open)?;
        info!("raid window opened");
        Ok(())
    }

    /// Stop accepting links. Submissions stay for the report.
    pub fn close(&mut self) -> Result<usize, SessionError> {
        self.require_channel()?;
        match self.status()? {
            SessionStatus::Idle => return Err(SessionError::NotOpen),
            SessionStatus::Open => save_status(self.store.as_ref(), SessionStatus::Locked)?,
            SessionStatus::Locked => {}
        }
        let count = self.store.submissions()?.len();
        info!(submissions = count, "raid window locked");
        Ok(count)
    }

    /// Mark the locked window as reported. A window opened meanwhile is left alone.
    pub fn finish_report(&mut self) -> Result<(), SessionError> {
        if self.status()? == SessionStatus::Locked {
            save_status(self.store.as_ref(), SessionStatus::Idle)?;
        }
        Ok(())
    }

    /// Record a link. Non-admins get one link per window under their own
    /// identity; admin links are attributed to the post's author instead.
    pub async fn submit(
        &mut self,
        sender: &ParticipantKey,
        post_id: PostId,
        is_admin: bool,
    ) -> Result<Participant, SessionError> {
        if self.status()? != SessionStatus::Open {
            return Err(SessionError::NotOpen);
        }

        let participant = if is_admin {
            self.attribute_to_author(&post_id).await?
        } else {
            if self.store.participant(sender)?.is_none() {
                return Err(SessionError::NotRegistered);
            }
            let me = Participant::Registered(sender.clone());
            if self.store.submissions()?.iter().any(|s| s.participant == me) {
                return Err(SessionError::AlreadySubmitted);
            }
            me
        };

        self.store.upsert_submission(&Submission {
            post_id: post_id.clone(),
            participant: participant.clone(),
        })?;
        info!(post_id = %post_id, participant = %participant, admin = is_admin, "submission recorded");
        Ok(participant)
    }

    async fn attribute_to_author(&self, post_id: &PostId) -> Result<Participant, SessionError> {
        let Some(author) = self.lookup.resolve_post_author(post_id).await else {
            return Err(SessionError::AuthorUnresolved(post_id.clone()));
        };
        Ok(match self.store.participant_by_handle(&author)? {
            Some(registered) => Participant::Registered(registered.key),
            None => Participant::ghost(&author),
        })
    }

    /// Resolve `handle` and hold the link until the requester confirms it.
    pub async fn begin_registration(
        &mut self,
        requester: &ParticipantKey,
        target: &ParticipantKey,
        raw_handle: &str,
        is_admin: bool,
        now: Instant,
    ) -> Result<PendingRegistration, SessionError> {
        if requester != target && !is_admin {
            return Err(SessionError::NotPermitted);
        }
        if let Some(existing) = self.store.participant(target)? {
            return Err(SessionError::AlreadyRegistered(existing.handle));
        }
        let handle = normalize_handle(raw_handle)?;
        if self.store.participant_by_handle(&handle)?.is_some() {
            return Err(SessionError::HandleTaken(handle));
        }
        let Some(stable_id) = self.lookup.resolve_handle_to_id(&handle).await else {
            return Err(SessionError::HandleNotFound(handle));
        };

        let pending = PendingRegistration {
            participant: RegisteredParticipant {
                key: target.clone(),
                handle,
                stable_id,
            },
            expires_at: now + REGISTRATION_CONFIRM_WINDOW,
        };
        self.pending.insert(requester.clone(), pending.clone());
        Ok(pending)
    }

    pub fn confirm_registration(
        &mut self,
        requester: &ParticipantKey,
        now: Instant,
    ) -> Result<RegisteredParticipant, SessionError> {
        let pending = self
            .pending
            .remove(requester)
            .ok_or(SessionError::NoPendingRegistration)?;
        if now > pending.expires_at {
            return Err(SessionError::RegistrationExpired);
        }

        let participant = pending.participant;
        if !self.store.insert_participant(&participant)? {
            warn!(key = %participant.key, "registration raced with another");
            return Err(match self.store.participant(&participant.key)? {
                Some(existing) => SessionError::AlreadyRegistered(existing.handle),
                None => SessionError::HandleTaken(participant.handle),
            });
        }
        info!(key = %participant.key, handle = %participant.handle, "participant registered");
        Ok(participant)
    }

    pub fn cancel_registration(&mut self, requester: &ParticipantKey) -> bool {
        self.pending.remove(requester).is_some()
    }

    /// Drop confirmations nobody answered; returns the requesters dropped.
    pub fn expire_pending(&mut self, now: Instant) -> Vec<ParticipantKey> {
        let expired: Vec<ParticipantKey> = self
            .pending
            .iter()
            .filter(|(_, p)| now > p.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.pending.remove(key);
        }
        expired
    }
}

/// Strip a leading `@` and check the handle is 1–15 of `[A-Za-z0-9_]`.
pub fn normalize_handle(raw: &str) -> Result<String, SessionError> {
    let handle = raw.trim().trim_start_matches('@').trim();
    let valid = !handle.is_empty()
        && handle.chars().count() <= MAX_HANDLE_CHARS
        && handle.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(handle.to_string())
    } else {
        Err(SessionError::InvalidHandle(raw.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::fake::FakeDirectory, json_scan::FieldVariants, store::SqliteStore, types::StableId,
    };
    use serde_json::json;

    fn machine_with(fake: FakeDirectory) -> (SessionMachine, Arc<dyn RaidStore>) {
        let store: Arc<dyn RaidStore> = Arc::new(SqliteStore::open_in_memory().expect("store"));
        store.set_setting(SETTING_CHANNEL, "raids").expect("channel");
        let lookup = DirectoryLookup::new(Arc::new(fake), FieldVariants::default());
        (SessionMachine::new(store.clone(), lookup), store)
    }

    fn register(store: &Arc<dyn RaidStore>, key: &str, handle: &str) {
        store
            .insert_participant(&RegisteredParticipant {
                key: ParticipantKey::new(key),
                handle: handle.to_string(),
                stable_id: StableId(format!("{key}000000")),
            })
            .expect("insert");
    }

    fn key(k: &str) -> ParticipantKey {
        ParticipantKey::new(k)
    }

    #[tokio::test]
    async fn open_without_channel_is_rejected() {
        let store: Arc<dyn RaidStore> = Arc::new(SqliteStore::open_in_memory().expect("store"));
        let lookup = DirectoryLookup::new(Arc::new(FakeDirectory::default()), FieldVariants::default());
        let mut machine = SessionMachine::new(store, lookup);
        assert_eq!(machine.open(), Err(SessionError::NoChannel));
        assert_eq!(machine.status(), Ok(SessionStatus::Idle));
    }

    #[tokio::test]
    async fn open_is_not_cumulative() {
        let (mut machine, store) = machine_with(FakeDirectory::default());
        register(&store, "A", "alice");
        machine.open().expect("open");
        machine
            .submit(&key("A"), PostId::new("1"), false)
            .await
            .expect("submit");
        machine.open().expect("open");
        machine.open().expect("open");
        assert!(machine.submissions().expect("list").is_empty());
        assert_eq!(machine.status(), Ok(SessionStatus::Open));
    }

    #[tokio::test]
    async fn non_admin_gets_one_submission_per_window() {
        let (mut machine, store) = machine_with(FakeDirectory::default());
        register(&store, "A", "alice");
        machine.open().expect("open");

        let first = machine.submit(&key("A"), PostId::new("1"), false).await;
        assert_eq!(first, Ok(Participant::Registered(key("A"))));
        let second = machine.submit(&key("A"), PostId::new("2"), false).await;
        assert_eq!(second, Err(SessionError::AlreadySubmitted));
        assert_eq!(machine.submissions().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn submissions_rejected_unless_open_and_registered() {
        let (mut machine, store) = machine_with(FakeDirectory::default());
        register(&store, "A", "alice");
        assert_eq!(
            machine.submit(&key("A"), PostId::new("1"), false).await,
            Err(SessionError::NotOpen)
        );
        machine.open().expect("open");
        assert_eq!(
            machine.submit(&key("Z"), PostId::new("1"), false).await,
            Err(SessionError::NotRegistered)
        );
        machine.close().expect("close");
        assert_eq!(
            machine.submit(&key("A"), PostId::new("1"), false).await,
            Err(SessionError::NotOpen)
        );
    }

    #[tokio::test]
    async fn admin_link_by_unregistered_author_becomes_ghost() {
        let fake = FakeDirectory::default().with_post(
            "500",
            json!({"data": {"core": {"user": {"screen_name": "Ghosty"}}}}),
        );
        let (mut machine, store) = machine_with(fake);
        register(&store, "ADMIN", "boss");
        machine.open().expect("open");

        let attributed = machine.submit(&key("ADMIN"), PostId::new("500"), true).await;
        assert_eq!(attributed, Ok(Participant::Ghost("ghosty".to_string())));
        let all = machine.submissions().expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].participant, Participant::ghost("ghosty"));
    }

    #[tokio::test]
    async fn admin_links_go_to_registered_author_without_cap() {
        let fake = FakeDirectory::default()
            .with_post("1", json!({"user": {"screen_name": "ALICE"}}))
            .with_post("2", json!({"user": {"screen_name": "alice"}}));
        let (mut machine, store) = machine_with(fake);
        register(&store, "A", "alice");
        machine.open().expect("open");

        machine
            .submit(&key("A"), PostId::new("0"), false)
            .await
            .expect("own link");
        for post in ["1", "2"] {
            let who = machine.submit(&key("ADMIN"), PostId::new(post), true).await;
            assert_eq!(who, Ok(Participant::Registered(key("A"))));
        }
        assert_eq!(machine.submissions().expect("list").len(), 3);
    }

    #[tokio::test]
    async fn admin_link_with_unknown_author_is_rejected() {
        let (mut machine, _store) = machine_with(FakeDirectory::default());
        machine.open().expect("open");
        assert_eq!(
            machine.submit(&key("ADMIN"), PostId::new("9"), true).await,
            Err(SessionError::AuthorUnresolved(PostId::new("9")))
        );
    }

    #[tokio::test]
    async fn close_locks_and_report_returns_to_idle() {
        let (mut machine, store) = machine_with(FakeDirectory::default());
        register(&store, "A", "alice");
        assert_eq!(machine.close(), Err(SessionError::NotOpen));
        machine.open().expect("open");
        machine
            .submit(&key("A"), PostId::new("1"), false)
            .await
            .expect("submit");
        assert_eq!(machine.close(), Ok(1));
        assert_eq!(machine.close(), Ok(1));
        assert_eq!(machine.status(), Ok(SessionStatus::Locked));
        machine.finish_report().expect("finish");
        assert_eq!(machine.status(), Ok(SessionStatus::Idle));
        assert_eq!(machine.submissions().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn registration_needs_confirmation_in_time() {
        let fake = FakeDirectory::default()
            .with_user("foo", json!({"data": {"user": {"result": {"rest_id": "42424242"}}}}));
        let (mut machine, store) = machine_with(fake);
        let t0 = Instant::now();

        let pending = machine
            .begin_registration(&key("A"), &key("A"), "@foo", false, t0)
            .await
            .expect("pending");
        assert_eq!(pending.participant.stable_id, StableId("42424242".to_string()));
        assert!(store.participant(&key("A")).expect("query").is_none());

        let late = t0 + REGISTRATION_CONFIRM_WINDOW + Duration::from_secs(1);
        assert_eq!(
            machine.confirm_registration(&key("A"), late),
            Err(SessionError::RegistrationExpired)
        );

        machine
            .begin_registration(&key("A"), &key("A"), "foo", false, t0)
            .await
            .expect("pending");
        let saved = machine
            .confirm_registration(&key("A"), t0 + Duration::from_secs(5))
            .expect("confirm");
        assert_eq!(saved.handle, "foo");
        assert_eq!(
            store.participant_by_handle("FOO").expect("query").map(|p| p.key),
            Some(key("A"))
        );
    }

    #[tokio::test]
    async fn registration_rejections() {
        let fake = FakeDirectory::default()
            .with_user("bar", json!({"rest_id": "77777777"}));
        let (mut machine, store) = machine_with(fake);
        register(&store, "A", "alice");
        let now = Instant::now();

        assert_eq!(
            machine.begin_registration(&key("A"), &key("A"), "bar", false, now).await,
            Err(SessionError::AlreadyRegistered("alice".to_string()))
        );
        assert_eq!(
            machine.begin_registration(&key("B"), &key("C"), "bar", false, now).await,
            Err(SessionError::NotPermitted)
        );
        assert_eq!(
            machine.begin_registration(&key("B"), &key("B"), "Alice", false, now).await,
            Err(SessionError::HandleTaken("Alice".to_string()))
        );
        assert_eq!(
            machine.begin_registration(&key("B"), &key("B"), "no such!", false, now).await,
            Err(SessionError::InvalidHandle("no such!".to_string()))
        );
        assert_eq!(
            machine.begin_registration(&key("B"), &key("B"), "missing", false, now).await,
            Err(SessionError::HandleNotFound("missing".to_string()))
        );
        assert!(
            machine
                .begin_registration(&key("ADMIN"), &key("C"), "bar", true, now)
                .await
                .is_ok()
        );
        assert!(machine.cancel_registration(&key("ADMIN")));
        assert_eq!(
            machine.confirm_registration(&key("ADMIN"), now),
            Err(SessionError::NoPendingRegistration)
        );
    }

    #[test]
    fn normalize_handle_strips_at_and_validates() {
        assert_eq!(normalize_handle(" @Foo_1 ").as_deref(), Ok("Foo_1"));
        assert!(normalize_handle("@").is_err());
        assert!(normalize_handle("sixteen_chars_xx").is_err());
        assert!(normalize_handle("dash-name").is_err());
    }
}
