use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    links::extract_post_id,
    lookup::DirectoryLookup,
    report::{Report, generate_report},
    scheduler::{Scheduler, validate_schedule},
    session::{SessionError, SessionMachine, normalize_handle},
    store::{
        RaidStore, SETTING_ADMIN_ROLE, SETTING_CHANNEL, Settings, save_schedule_hours,
    },
    types::{ParticipantKey, SessionStatus, TriggerKind},
    verifier::EngagementVerifier,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
const NOTICE_TTL: Duration = Duration::from_secs(5);

/// Who sent an event, as the chat platform describes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub key: ParticipantKey,
    pub roles: Vec<String>,
    /// The platform's own administrator flag.
    pub platform_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open,
    Close,
    ReportNow,
    /// `target` defaults to the sender.
    Register {
        target: Option<ParticipantKey>,
        handle: String,
    },
    Confirm,
    Cancel,
    SetChannel(String),
    SetRole(String),
    SetSchedule([u8; 3]),
    Diagnose(String),
    Config,
    Version,
}

impl Command {
    pub fn admin_only(&self) -> bool {
        matches!(
            self,
            Self::Open
                | Self::Close
                | Self::ReportNow
                | Self::SetChannel(_)
                | Self::SetRole(_)
                | Self::SetSchedule(_)
                | Self::Config
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message {
        sender: Sender,
        channel_id: String,
        text: String,
    },
    Command {
        sender: Sender,
        command: Command,
    },
}

/// Something the chat side should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Announcement in the raid channel.
    Channel(String),
    /// Answer to whoever issued the command.
    Reply(String),
    /// Short-lived warning that deletes itself after `ttl`.
    Ephemeral { text: String, ttl: Duration },
    /// The link in this message was accepted.
    Ack(String),
}

impl Notice {
    fn ephemeral(who: &ParticipantKey, text: impl std::fmt::Display) -> Self {
        Self::Ephemeral {
            text: format!("<@{who}> ⚠️ {text}"),
            ttl: NOTICE_TTL,
        }
    }
}

pub struct BotParts {
    pub store: Arc<dyn RaidStore>,
    pub lookup: DirectoryLookup,
    pub verifier: EngagementVerifier,
    pub scheduler: Scheduler,
    pub report_tx: mpsc::Sender<Report>,
    /// Late notices from background jobs such as `diagnose`.
    pub notice_tx: mpsc::Sender<Vec<Notice>>,
    pub super_admin: Option<ParticipantKey>,
    pub default_hours: [u8; 3],
    pub pace: Duration,
}

/// Single owner of the session state; every event is handled in arrival order.
pub struct Bot {
    session: SessionMachine,
    store: Arc<dyn RaidStore>,
    verifier: EngagementVerifier,
    scheduler: Scheduler,
    report_tx: mpsc::Sender<Report>,
    notice_tx: mpsc::Sender<Vec<Notice>>,
    report_running: bool,
    super_admin: Option<ParticipantKey>,
    default_hours: [u8; 3],
    pace: Duration,
}

impl Bot {
    pub fn new(parts: BotParts) -> Self {
        Self {
            session: SessionMachine::new(parts.store.clone(), parts.lookup),
            store: parts.store,
            verifier: parts.verifier,
            scheduler: parts.scheduler,
            report_tx: parts.report_tx,
            notice_tx: parts.notice_tx,
            report_running: false,
            super_admin: parts.super_admin,
            default_hours: parts.default_hours,
            pace: parts.pace,
        }
    }

    pub fn report_running(&self) -> bool {
        self.report_running
    }

    fn settings(&self) -> Result<Settings, SessionError> {
        Ok(Settings::load(self.store.as_ref(), self.default_hours)?)
    }

    /// Install timers from the stored hours and log what a restart resumed.
    pub fn start(&mut self) -> Result<(), SessionError> {
        let settings = self.settings()?;
        self.scheduler.replace(settings.schedule_hours);
        let pending = self.session.submissions()?.len();
        match settings.status {
            SessionStatus::Idle => info!("starting idle"),
            status => info!(
                status = status.as_str(),
                submissions = pending,
                "resuming persisted window"
            ),
        }
        Ok(())
    }

    pub fn is_admin(&self, sender: &Sender) -> bool {
        if sender.platform_admin || self.super_admin.as_ref() == Some(&sender.key) {
            return true;
        }
        match self.store.setting(SETTING_ADMIN_ROLE) {
            Ok(Some(role)) => sender.roles.iter().any(|r| *r == role),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "admin role lookup failed");
                false
            }
        }
    }

    pub async fn handle(&mut self, event: InboundEvent) -> Vec<Notice> {
        let mut notices = self.expire_registrations();
        match event {
            InboundEvent::Message {
                sender,
                channel_id,
                text,
            } => notices.extend(self.on_message(&sender, &channel_id, &text).await),
            InboundEvent::Command { sender, command } => {
                notices.extend(self.on_command(&sender, command).await)
            }
        }
        notices
    }

    fn expire_registrations(&mut self) -> Vec<Notice> {
        self.session
            .expire_pending(Instant::now())
            .into_iter()
            .map(|key| Notice::Reply(format!("<@{key}> ⏳ Registration timed out.")))
            .collect()
    }

    async fn on_message(&mut self, sender: &Sender, channel_id: &str, text: &str) -> Vec<Notice> {
        let configured = match self.store.setting(SETTING_CHANNEL) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "channel lookup failed");
                return Vec::new();
            }
        };
        if configured.as_deref() != Some(channel_id) {
            return Vec::new();
        }
        let Some(post_id) = extract_post_id(text) else {
            return Vec::new();
        };

        let is_admin = self.is_admin(sender);
        match self.session.submit(&sender.key, post_id.clone(), is_admin).await {
            Ok(_) => vec![Notice::Ack(post_id.0)],
            Err(e) => {
                debug!(sender = %sender.key, post_id = %post_id, error = %e, "submission rejected");
                vec![Notice::ephemeral(&sender.key, e)]
            }
        }
    }

    async fn on_command(&mut self, sender: &Sender, command: Command) -> Vec<Notice> {
        let is_admin = self.is_admin(sender);
        if command.admin_only() && !is_admin {
            debug!(sender = %sender.key, ?command, "ignoring admin command from non-admin");
            return Vec::new();
        }

        let result = match command {
            Command::Open => self.open_window(),
            Command::Close => self.lock_window(),
            Command::ReportNow => self.report_now(),
            Command::Register { target, handle } => {
                let target = target.unwrap_or_else(|| sender.key.clone());
                self.session
                    .begin_registration(&sender.key, &target, &handle, is_admin, Instant::now())
                    .await
                    .map(|pending| {
                        let p = &pending.participant;
                        vec![Notice::Reply(format!(
                            "⚠️ CONFIRM REGISTRATION\nAccount: <@{}>\nHandle: @{} (ID: {})\nSend `confirm` within 30s. Once confirmed this cannot be changed.",
                            p.key, p.handle, p.stable_id
                        ))]
                    })
            }
            Command::Confirm => self
                .session
                .confirm_registration(&sender.key, Instant::now())
                .map(|p| {
                    vec![Notice::Reply(format!(
                        "✅ Registered! <@{}> is permanently linked to @{}.",
                        p.key, p.handle
                    ))]
                }),
            Command::Cancel => Ok(if self.session.cancel_registration(&sender.key) {
                vec![Notice::Reply("🚫 Registration cancelled.".to_string())]
            } else {
                Vec::new()
            }),
            Command::SetChannel(channel) => self
                .store
                .set_setting(SETTING_CHANNEL, channel.trim())
                .map(|_| vec![Notice::Reply(format!("✅ Raid channel set to #{}", channel.trim()))])
                .map_err(Into::into),
            Command::SetRole(role) => self
                .store
                .set_setting(SETTING_ADMIN_ROLE, role.trim())
                .map(|_| vec![Notice::Reply(format!("✅ Admin role set to {}", role.trim()))])
                .map_err(Into::into),
            Command::SetSchedule(hours) => self.set_schedule(hours),
            Command::Diagnose(handle) => Ok(self.diagnose(&handle)),
            Command::Config => self.describe_config(),
            Command::Version => Ok(vec![Notice::Reply(format!("🤖 Bot version: {VERSION}"))]),
        };

        result.unwrap_or_else(|e| vec![Notice::ephemeral(&sender.key, e)])
    }

    /// A locked window that was never reported gets its report started first;
    /// the report works on a snapshot, so the fresh window cannot clobber it.
    fn open_window(&mut self) -> Result<Vec<Notice>, SessionError> {
        let mut notices = Vec::new();
        if self.session.status()? == SessionStatus::Locked && !self.report_running {
            warn!("opening over an unreported window; reporting it first");
            notices.extend(self.start_report()?);
        }
        self.session.open()?;
        notices.push(Notice::Channel(
            "🟢 RAID SESSION OPEN\nPost your link (only 1 per person)!\nReply to everyone else!\nUnregistered users cannot post."
                .to_string(),
        ));
        Ok(notices)
    }

    fn lock_window(&mut self) -> Result<Vec<Notice>, SessionError> {
        let count = self.session.close()?;
        Ok(vec![Notice::Channel(format!(
            "🔒 SESSION LOCKED\n{count} links collected. Finish your replies; the report follows."
        ))])
    }

    fn report_now(&mut self) -> Result<Vec<Notice>, SessionError> {
        let mut notices = Vec::new();
        if self.session.status()? == SessionStatus::Open {
            notices.extend(self.lock_window()?);
        }
        notices.extend(self.start_report()?);
        Ok(notices)
    }

    /// Snapshot the window and verify it in the background.
    fn start_report(&mut self) -> Result<Vec<Notice>, SessionError> {
        if self.report_running {
            return Ok(vec![Notice::Reply("⏳ A report is already running.".to_string())]);
        }
        let settings = self.settings()?;
        if settings.channel_id.is_none() {
            return Err(SessionError::NoChannel);
        }
        let submissions = self.session.submissions()?;
        if submissions.is_empty() {
            self.session.finish_report()?;
            return Ok(vec![Notice::Channel(
                "🔴 Session ended. No links posted.".to_string(),
            )]);
        }

        let participants = {
            let mut seen = Vec::new();
            for s in &submissions {
                if !seen.contains(&&s.participant) {
                    seen.push(&s.participant);
                }
            }
            seen.len()
        };

        let store = self.store.clone();
        let verifier = self.verifier.clone();
        let tx = self.report_tx.clone();
        let pace = self.pace;
        self.report_running = true;
        tokio::spawn(async move {
            let report = generate_report(&submissions, store.as_ref(), &verifier, pace).await;
            if tx.send(report).await.is_err() {
                warn!("report finished after shutdown");
            }
        });

        info!(participants, "report run spawned");
        Ok(vec![Notice::Channel(format!(
            "⏳ Checking replies for {participants} participants..."
        ))])
    }

    pub fn on_report_finished(&mut self, report: Report) -> Vec<Notice> {
        self.report_running = false;
        if let Err(e) = self.session.finish_report() {
            warn!(error = %e, "could not mark window reported");
        }
        let mut notices = vec![Notice::Channel(format!(
            "🔴 SESSION CLOSED\nChecked {} participants.",
            report.entries.len()
        ))];
        notices.extend(report.render().into_iter().map(Notice::Channel));
        notices
    }

    fn set_schedule(&mut self, hours: [u8; 3]) -> Result<Vec<Notice>, SessionError> {
        if let Err(e) = validate_schedule(hours, self.scheduler.report_delay_hours()) {
            return Ok(vec![Notice::Reply(format!("❌ {e}"))]);
        }
        save_schedule_hours(self.store.as_ref(), hours)?;
        let installed = self.scheduler.replace(hours).len();
        Ok(vec![Notice::Reply(format!(
            "✅ Schedule set to {:02}:00, {:02}:00, {:02}:00 UTC ({installed} timers).",
            hours[0], hours[1], hours[2]
        ))])
    }

    /// Runs in the background; its findings arrive on the notice channel.
    fn diagnose(&self, raw_handle: &str) -> Vec<Notice> {
        let handle = match normalize_handle(raw_handle) {
            Ok(h) => h,
            Err(e) => return vec![Notice::Reply(format!("❌ {e}"))],
        };
        let started = Notice::Reply(format!("🕵️ Running diagnosis for @{handle}..."));

        let lookup = self.session.lookup().clone();
        let verifier = self.verifier.clone();
        let tx = self.notice_tx.clone();
        tokio::spawn(async move {
            let notices = run_diagnosis(&lookup, &verifier, &handle).await;
            if tx.send(notices).await.is_err() {
                warn!(handle = %handle, "diagnosis finished after shutdown");
            }
        });
        vec![started]
    }

    fn describe_config(&self) -> Result<Vec<Notice>, SessionError> {
        let s = self.settings()?;
        let channel = s
            .channel_id
            .map(|c| format!("#{c}"))
            .unwrap_or_else(|| "Not set".to_string());
        let role = s.admin_role_id.unwrap_or_else(|| "Not set".to_string());
        let admin = self
            .super_admin
            .as_ref()
            .map(|k| format!("<@{k}>"))
            .unwrap_or_else(|| "Not set".to_string());
        Ok(vec![Notice::Reply(format!(
            "⚙️ Current config:\nRaid channel: {channel}\nAdmin role: {role}\nSchedule (UTC): {:02}:00, {:02}:00, {:02}:00\nSession: {}\nSuper admin: {admin}",
            s.schedule_hours[0],
            s.schedule_hours[1],
            s.schedule_hours[2],
            s.status.as_str()
        ))])
    }

    pub async fn on_trigger(&mut self, kind: TriggerKind) -> Vec<Notice> {
        info!(kind = kind.as_str(), "scheduled trigger fired");
        let status = match self.session.status() {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "status lookup failed");
                return Vec::new();
            }
        };
        let result = match kind {
            TriggerKind::Warning => match self.settings() {
                Ok(s) if s.channel_id.is_some() => Ok(vec![Notice::Channel(
                    "⏰ Raid session opens in 59 minutes. Get your link ready!".to_string(),
                )]),
                Ok(_) => Err(SessionError::NoChannel),
                Err(e) => Err(e),
            },
            TriggerKind::Open => self.open_window(),
            TriggerKind::Lock if status == SessionStatus::Open => self.lock_window(),
            TriggerKind::Report if status == SessionStatus::Locked => self.start_report(),
            TriggerKind::Lock | TriggerKind::Report => {
                debug!(kind = kind.as_str(), status = status.as_str(), "trigger not applicable");
                Ok(Vec::new())
            }
        };
        result.unwrap_or_else(|e| {
            warn!(kind = kind.as_str(), error = %e, "scheduled transition failed");
            Vec::new()
        })
    }
}

async fn run_diagnosis(
    lookup: &DirectoryLookup,
    verifier: &EngagementVerifier,
    handle: &str,
) -> Vec<Notice> {
    let Some(id) = lookup.resolve_handle_to_id(handle).await else {
        return vec![Notice::Reply("❌ ID lookup failed.".to_string())];
    };
    let verdict = match verifier.probe(&id).await {
        Ok((0, _)) => "⚠️ API returned valid JSON but no replies were found.".to_string(),
        Ok((found, has_more)) => format!(
            "✅ API healthy. Found {found} replies{}.",
            if has_more { " (more pages available)" } else { "" }
        ),
        Err(e) => format!("❌ API error: {e}"),
    };
    vec![
        Notice::Reply(format!("✅ Found ID: {id}. Checking replies...")),
        Notice::Reply(verdict),
    ]
}
