//! Upload session types and lifecycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use time::{OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

/// Identifier for an upload session.
///
/// Upload IDs are opaque to the engine but end up inside storage keys, so
/// caller-supplied values are restricted to `[A-Za-z0-9._-]`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UploadId(String);

impl UploadId {
    /// Generate a new random upload ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse and validate a caller-supplied upload ID.
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() {
            return Err(crate::Error::InvalidUploadId(
                "upload ID must not be empty".to_string(),
            ));
        }
        if s.len() > crate::MAX_UPLOAD_ID_LEN {
            return Err(crate::Error::InvalidUploadId(format!(
                "upload ID is {} bytes (max: {})",
                s.len(),
                crate::MAX_UPLOAD_ID_LEN
            )));
        }
        if s == "." || s == ".." {
            return Err(crate::Error::InvalidUploadId(format!(
                "reserved upload ID: {s}"
            )));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(crate::Error::InvalidUploadId(format!(
                "upload ID contains invalid character {c:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for UploadId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for UploadId {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<UploadId> for String {
    fn from(id: UploadId) -> Self {
        id.0
    }
}

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Upload session state.
///
/// Transitions are monotonic: `Open -> Merging -> Complete`, or `Failed`
/// from any non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Session is accepting chunks.
    Open,
    /// Every chunk arrived and a single caller is merging them.
    Merging,
    /// The merged artifact was produced.
    Complete,
    /// The session hit an unrecoverable error.
    Failed,
}

impl SessionState {
    /// Check if the session can still receive chunks.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Check if the session reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Merging)
                | (Self::Merging, Self::Complete)
                | (Self::Open, Self::Failed)
                | (Self::Merging, Self::Failed)
        )
    }

    /// Stable lowercase name, used for persistence and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Merging => "merging",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SessionState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "merging" => Ok(Self::Merging),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::InvalidState(other.to_string())),
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of recording a chunk arrival.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkReadiness {
    /// More chunks are still expected.
    StillOpen,
    /// This call completed the set and moved the session to `Merging`.
    /// Returned exactly once per session.
    ReadyToMerge,
}

/// An upload session tracking which chunks have arrived.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    /// Session identifier.
    pub id: UploadId,
    /// Number of chunks the upload consists of, fixed at creation.
    pub total_chunks: u32,
    /// Indices received so far.
    pub received: BTreeSet<u32>,
    /// Current session state.
    pub state: SessionState,
    /// File name of the merged artifact, fixed at creation.
    pub file_name: Option<String>,
    /// When the session was created.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// When the session was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// When an open session stops accepting chunks.
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// Why the session failed, if it did.
    pub failure_reason: Option<String>,
}

impl UploadSession {
    /// Create a new open session.
    pub fn new(
        id: UploadId,
        total_chunks: u32,
        file_name: Option<String>,
        expires_in: time::Duration,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id,
            total_chunks,
            received: BTreeSet::new(),
            state: SessionState::Open,
            file_name,
            created_at: now,
            updated_at: now,
            expires_at: now
                .checked_add(expires_in)
                .unwrap_or_else(|| PrimitiveDateTime::MAX.assume_utc()),
            failure_reason: None,
        }
    }

    /// Number of distinct chunk indices received.
    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Whether every chunk index has been received.
    pub fn is_ready(&self) -> bool {
        self.received_count() == self.total_chunks
    }

    /// Indices not yet received, ascending.
    pub fn missing_indices(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// Check if the session has expired as of `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// File name the merged artifact is written under.
    pub fn artifact_file_name(&self) -> String {
        artifact_file_name(&self.id, self.file_name.as_deref())
    }

    /// The session without its received set.
    pub fn header(&self) -> SessionHeader {
        SessionHeader {
            id: self.id.clone(),
            total_chunks: self.total_chunks,
            received_count: self.received_count(),
            state: self.state,
            file_name: self.file_name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            expires_at: self.expires_at,
            failure_reason: self.failure_reason.clone(),
        }
    }
}

/// Fixed-size view of a session, as read on every chunk.
///
/// Carries the arrival count instead of the received set, so loading it
/// costs the same regardless of how many chunks have arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionHeader {
    pub id: UploadId,
    pub total_chunks: u32,
    pub received_count: u32,
    pub state: SessionState,
    pub file_name: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub failure_reason: Option<String>,
}

impl SessionHeader {
    /// Check if the session has expired as of `now`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.expires_at
    }

    /// Check if the session has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// File name the merged artifact is written under.
    pub fn artifact_file_name(&self) -> String {
        artifact_file_name(&self.id, self.file_name.as_deref())
    }
}

fn artifact_file_name(id: &UploadId, file_name: Option<&str>) -> String {
    file_name
        .map(str::to_string)
        .unwrap_or_else(|| format!("{id}.bin"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_id_parse() {
        let id = UploadId::parse("u1").unwrap();
        assert_eq!(id.as_str(), "u1");
        assert_eq!(id.to_string(), "u1");

        assert!(UploadId::parse("").is_err());
        assert!(UploadId::parse("..").is_err());
        assert!(UploadId::parse("a/b").is_err());
        assert!(UploadId::parse("a b").is_err());
        assert!(UploadId::parse(&"x".repeat(crate::MAX_UPLOAD_ID_LEN + 1)).is_err());
        assert!(UploadId::parse("build-42_v1.2").is_ok());
    }

    #[test]
    fn test_generated_upload_id_is_valid() {
        let id = UploadId::new();
        assert_eq!(UploadId::parse(id.as_str()).unwrap(), id);
    }

    #[test]
    fn test_upload_id_serde_validates() {
        let id: UploadId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(id.as_str(), "abc");
        assert!(serde_json::from_str::<UploadId>("\"../etc\"").is_err());
    }

    #[test]
    fn test_session_state_transitions() {
        use SessionState::*;
        assert!(Open.can_transition_to(Merging));
        assert!(Merging.can_transition_to(Complete));
        assert!(Open.can_transition_to(Failed));
        assert!(Merging.can_transition_to(Failed));

        assert!(!Open.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Open));
        assert!(!Merging.can_transition_to(Open));

        assert!(Open.is_active());
        assert!(Complete.is_terminal() && Failed.is_terminal());
        assert!(!Merging.is_terminal());
    }

    #[test]
    fn test_session_state_str_roundtrip() {
        for state in [
            SessionState::Open,
            SessionState::Merging,
            SessionState::Complete,
            SessionState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<SessionState>().unwrap(), state);
        }
        assert!("committed".parse::<SessionState>().is_err());
    }

    #[test]
    fn test_session_missing_indices() {
        let mut session = UploadSession::new(
            UploadId::parse("u1").unwrap(),
            4,
            None,
            time::Duration::seconds(60),
        );
        session.received.extend([0, 2]);
        assert_eq!(session.missing_indices(), vec![1, 3]);
        assert!(!session.is_ready());

        session.received.extend([1, 3]);
        assert!(session.is_ready());
        assert_eq!(session.artifact_file_name(), "u1.bin");
    }

    #[test]
    fn test_session_header_counts_received() {
        let mut session = UploadSession::new(
            UploadId::parse("u1").unwrap(),
            3,
            Some("out.tar".to_string()),
            time::Duration::seconds(60),
        );
        session.received.extend([0, 2]);

        let header = session.header();
        assert_eq!(header.received_count, 2);
        assert_eq!(header.total_chunks, 3);
        assert_eq!(header.state, SessionState::Open);
        assert_eq!(header.artifact_file_name(), "out.tar");
        assert!(!header.is_expired());
    }

    #[test]
    fn test_session_expired() {
        let session = UploadSession::new(
            UploadId::new(),
            1,
            None,
            time::Duration::seconds(-1),
        );
        assert!(session.is_expired());
    }

    #[test]
    fn test_session_huge_ttl_saturates() {
        let session = UploadSession::new(
            UploadId::new(),
            1,
            None,
            time::Duration::seconds(i64::MAX),
        );
        assert!(!session.is_expired());
    }
}
