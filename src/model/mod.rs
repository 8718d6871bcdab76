//! Domain types for the Group Channel Subsystem.
//!
//! `GroupChannel` is the aggregate; `GroupMessage` is its append-only log
//! entry. Both are plain data — persistence lives in [`crate::store`],
//! transitions live in [`crate::membership`].

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A user identifier. Users themselves are externally managed; this crate
/// only ever sees their id and username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        UserId(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimal user summary embedded in DTOs — never includes a password hash or
/// other account-internal fields.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub username: String,
}

/// Append-only log entry produced by exactly one Membership Engine
/// transition (or a plain `TEXT` post, once that surface exists upstream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Invite,
    Join,
    Kick,
    Leave,
    Create,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "TEXT",
            MessageKind::Invite => "INVITE",
            MessageKind::Join => "JOIN",
            MessageKind::Kick => "KICK",
            MessageKind::Leave => "LEAVE",
            MessageKind::Create => "CREATE",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TEXT" => Ok(MessageKind::Text),
            "INVITE" => Ok(MessageKind::Invite),
            "JOIN" => Ok(MessageKind::Join),
            "KICK" => Ok(MessageKind::Kick),
            "LEAVE" => Ok(MessageKind::Leave),
            "CREATE" => Ok(MessageKind::Create),
            other => Err(format!("unknown message kind: {other}")),
        }
    }
}

/// Immutable message appended to a channel's log. `from_user` is `None` for
/// system events with no natural author (there are none today; the field
/// exists so a future `TEXT` post kind can reuse this type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMessage {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub from_user: Option<UserId>,
    pub kind: MessageKind,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl GroupMessage {
    fn system(
        channel_id: Uuid,
        from_user: Option<UserId>,
        kind: MessageKind,
        payload: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        GroupMessage {
            id: Uuid::now_v7(),
            channel_id,
            from_user,
            kind,
            payload,
            created_at,
        }
    }
}

/// The channel aggregate: membership, invitations, and its message log,
/// versioned for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChannel {
    pub id: Uuid,
    pub name: String,
    pub members: BTreeSet<UserId>,
    pub invited: BTreeSet<UserId>,
    pub messages: Vec<GroupMessage>,
    pub last_message: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl GroupChannel {
    /// Construct a brand-new channel with `creator` as its sole member. Does
    /// not append the CREATE message — that is the Membership Engine's job,
    /// so the aggregate stays the single source of truth for "every
    /// transition appends exactly one message".
    pub fn new(id: Uuid, name: String, creator: UserId, now: DateTime<Utc>) -> Self {
        let mut members = BTreeSet::new();
        members.insert(creator);
        GroupChannel {
            id,
            name,
            members,
            invited: BTreeSet::new(),
            messages: Vec::new(),
            last_message: None,
            updated_at: now,
            version: 0,
        }
    }

    /// True once membership has emptied out. The channel stays persisted,
    /// but is no longer surfaced by membership queries.
    pub fn is_empty_of_members(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn append(
        &mut self,
        from_user: Option<UserId>,
        kind: MessageKind,
        payload: String,
        now: DateTime<Utc>,
    ) -> &GroupMessage {
        let message = GroupMessage::system(self.id, from_user, kind, payload, now);
        self.last_message = Some(message.id);
        self.messages.push(message);
        self.updated_at = now;
        self.version += 1;
        self.messages.last().expect("just pushed")
    }

    /// The message referenced by `last_message`, if any.
    pub fn last_message(&self) -> Option<&GroupMessage> {
        let id = self.last_message?;
        self.messages.iter().rev().find(|m| m.id == id)
    }
}

// ============================================================================
// DTOs — what crosses the bus and what the service hands back to callers
// ============================================================================

/// Wire payload for `GroupMessage`, published to the bus and returned to
/// callers. `from` is `None` for pre-membership events that have no author
/// in `members` (there are none currently, but the shape must stay
/// `Option` so `from_user: None` round-trips).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMessageDto {
    pub id: Uuid,
    pub channel_id: Uuid,
    pub from: Option<UserSummary>,
    pub kind: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl GroupMessageDto {
    pub fn from_message(message: GroupMessage, from: Option<UserSummary>) -> Self {
        GroupMessageDto {
            id: message.id,
            channel_id: message.channel_id,
            from,
            kind: message.kind.as_str().to_owned(),
            payload: message.payload,
            created_at: message.created_at,
        }
    }
}

/// Profile returned by `getAllChannels` / `getChannelProfile`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupChannelProfile {
    pub id: Uuid,
    pub name: String,
    pub members: Vec<UserSummary>,
    pub invited: Vec<UserSummary>,
    pub last_message: Option<GroupMessageDto>,
    pub updated_at: DateTime<Utc>,
}

/// A page of results without a total count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slice<T> {
    pub current_page: u32,
    pub page_size: u32,
    pub has_next: bool,
    pub items: Vec<T>,
}

impl<T> Slice<T> {
    pub fn empty(current_page: u32, page_size: u32) -> Self {
        Slice {
            current_page,
            page_size,
            has_next: false,
            items: Vec::new(),
        }
    }
}

/// A page request validated at the service boundary: `page >= 0`,
/// `size >= 1`.
#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> UserId {
        UserId(Uuid::from_u128(n as u128))
    }

    #[test]
    fn new_channel_has_single_member_and_no_messages() {
        let now = Utc::now();
        let ch = GroupChannel::new(Uuid::now_v7(), "Room".into(), user(1), now);
        assert_eq!(ch.members.len(), 1);
        assert!(ch.members.contains(&user(1)));
        assert!(ch.invited.is_empty());
        assert!(ch.messages.is_empty());
        assert_eq!(ch.version, 0);
    }

    #[test]
    fn append_advances_version_and_updated_at_and_last_message() {
        let t0 = Utc::now();
        let mut ch = GroupChannel::new(Uuid::now_v7(), "Room".into(), user(1), t0);
        let t1 = t0 + chrono::Duration::seconds(5);
        ch.append(Some(user(1)), MessageKind::Create, "created".into(), t1);

        assert_eq!(ch.version, 1);
        assert_eq!(ch.updated_at, t1);
        assert_eq!(ch.messages.len(), 1);
        assert_eq!(ch.last_message().unwrap().kind, MessageKind::Create);
    }

    #[test]
    fn message_kind_round_trips_through_str() {
        for kind in [
            MessageKind::Text,
            MessageKind::Invite,
            MessageKind::Join,
            MessageKind::Kick,
            MessageKind::Leave,
            MessageKind::Create,
        ] {
            let s = kind.as_str();
            let parsed: MessageKind = s.parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn is_empty_of_members_after_last_leaves() {
        let mut ch = GroupChannel::new(Uuid::now_v7(), "Room".into(), user(1), Utc::now());
        assert!(!ch.is_empty_of_members());
        ch.members.remove(&user(1));
        assert!(ch.is_empty_of_members());
    }
}
