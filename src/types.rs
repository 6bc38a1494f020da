use std::fmt;

/// Internal chat-account identifier of a participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantKey(pub String);

impl ParticipantKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an external post (the trailing numeric segment of its URL).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PostId(pub String);

impl PostId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable numeric identity the external directory assigns to an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StableId(pub String);

impl StableId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a submission is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Participant {
    Registered(ParticipantKey),
    /// Known only by external handle (lower-cased), no linked account.
    Ghost(String),
}

impl Participant {
    pub fn ghost(handle: &str) -> Self {
        Self::Ghost(handle.trim().trim_start_matches('@').to_ascii_lowercase())
    }

    pub fn is_ghost(&self) -> bool {
        matches!(self, Self::Ghost(_))
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Registered(_) => "registered",
            Self::Ghost(_) => "ghost",
        }
    }

    pub fn reference(&self) -> &str {
        match self {
            Self::Registered(key) => key.as_str(),
            Self::Ghost(handle) => handle,
        }
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered(key) => write!(f, "<@{key}>"),
            Self::Ghost(handle) => write!(f, "ghost(@{handle})"),
        }
    }
}

/// A participant linked to an external account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredParticipant {
    pub key: ParticipantKey,
    pub handle: String,
    pub stable_id: StableId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub post_id: PostId,
    pub participant: Participant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionStatus {
    #[default]
    Idle,
    Open,
    Locked,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Open => "open",
            Self::Locked => "locked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "idle" => Some(Self::Idle),
            "open" => Some(Self::Open),
            "locked" => Some(Self::Locked),
            _ => None,
        }
    }
}

/// What a scheduled timer asks the bot to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Warning,
    Open,
    Lock,
    Report,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Open => "open",
            Self::Lock => "lock",
            Self::Report => "report",
        }
    }
}
