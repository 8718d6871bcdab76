//! Membership Engine: pure transitions over a loaded [`GroupChannel`]
//! aggregate. Free of persistence and transport concerns by design, so it
//! is unit-testable without a database, a bus, or a clock beyond what the
//! caller passes in.
//!
//! Every function here checks its preconditions, mutates the aggregate it
//! was handed, and appends exactly one [`GroupMessage`] — the "one message
//! per transition" invariant lives entirely in [`GroupChannel::append`]; this
//! module only decides *whether* a transition is allowed and what message it
//! produces.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{GroupChannel, MessageKind, UserId};

fn invalid(msg: impl Into<String>) -> AppError {
    AppError::InvalidOperation(msg.into())
}

/// Unlike the other operations this does not take an existing aggregate; it
/// produces one. Precondition (name valid) is enforced by the caller
/// ([`crate::service::ChannelService`]) before this is reached, since an
/// empty/oversized name is a `ValidationError`, not an `InvalidOperation`.
pub fn create(id: Uuid, name: String, creator: UserId, now: DateTime<Utc>) -> GroupChannel {
    let mut channel = GroupChannel::new(id, name, creator, now);
    channel.append(Some(creator), MessageKind::Create, creator.to_string(), now);
    channel
}

pub fn invite(
    channel: &mut GroupChannel,
    inviter: UserId,
    invitee: UserId,
    now: DateTime<Utc>,
) -> AppResult<()> {
    if !channel.members.contains(&inviter) {
        return Err(invalid("inviter is not a member of this channel"));
    }
    if inviter == invitee {
        return Err(invalid("a user cannot invite themselves"));
    }
    if channel.members.contains(&invitee) || channel.invited.contains(&invitee) {
        return Err(invalid("invitee is already a member or already invited"));
    }

    channel.invited.insert(invitee);
    channel.append(
        Some(inviter),
        MessageKind::Invite,
        invitee.to_string(),
        now,
    );
    Ok(())
}

pub fn accept(channel: &mut GroupChannel, invitee: UserId, now: DateTime<Utc>) -> AppResult<()> {
    if !channel.invited.contains(&invitee) {
        return Err(invalid("user has no pending invitation to this channel"));
    }

    channel.invited.remove(&invitee);
    channel.members.insert(invitee);
    channel.append(Some(invitee), MessageKind::Join, invitee.to_string(), now);
    Ok(())
}

pub fn kick(
    channel: &mut GroupChannel,
    actor: UserId,
    target: UserId,
    now: DateTime<Utc>,
) -> AppResult<()> {
    if !channel.members.contains(&actor) {
        return Err(invalid("actor is not a member of this channel"));
    }
    if actor == target {
        return Err(invalid("use leave to remove yourself, not kick"));
    }
    if !channel.members.contains(&target) {
        return Err(invalid("target is not a member of this channel"));
    }

    channel.members.remove(&target);
    channel.append(Some(actor), MessageKind::Kick, target.to_string(), now);
    Ok(())
}

pub fn leave(channel: &mut GroupChannel, user: UserId, now: DateTime<Utc>) -> AppResult<()> {
    if !channel.members.contains(&user) {
        return Err(invalid("user is not a member of this channel"));
    }

    channel.members.remove(&user);
    channel.append(Some(user), MessageKind::Leave, user.to_string(), now);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> UserId {
        UserId(Uuid::from_u128(n as u128))
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn create_appends_one_create_message() {
        let ch = create(Uuid::now_v7(), "Room A".into(), user(1), now());
        assert_eq!(ch.messages.len(), 1);
        assert_eq!(ch.messages[0].kind, MessageKind::Create);
        assert!(ch.members.contains(&user(1)));
    }

    #[test]
    fn invite_adds_to_invited_and_appends_invite_message() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        invite(&mut ch, user(1), user(2), now()).unwrap();

        assert!(ch.invited.contains(&user(2)));
        assert!(!ch.members.contains(&user(2)));
        assert_eq!(ch.messages.len(), 2);
        assert_eq!(ch.messages[1].kind, MessageKind::Invite);
        assert!(ch.members.is_disjoint(&ch.invited));
    }

    #[test]
    fn invite_rejects_non_member_inviter() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        let err = invite(&mut ch, user(2), user(3), now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[test]
    fn invite_rejects_self_invite() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        let err = invite(&mut ch, user(1), user(1), now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[test]
    fn invite_rejects_already_member_or_invited() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        invite(&mut ch, user(1), user(2), now()).unwrap();
        assert!(invite(&mut ch, user(1), user(2), now()).is_err());
        assert!(invite(&mut ch, user(1), user(1), now()).is_err());
    }

    #[test]
    fn accept_moves_invitee_from_invited_to_members() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        invite(&mut ch, user(1), user(2), now()).unwrap();
        accept(&mut ch, user(2), now()).unwrap();

        assert!(!ch.invited.contains(&user(2)));
        assert!(ch.members.contains(&user(2)));
        assert_eq!(ch.messages.last().unwrap().kind, MessageKind::Join);
    }

    #[test]
    fn accept_rejects_user_with_no_invitation() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        let err = accept(&mut ch, user(2), now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[test]
    fn kick_removes_target_from_members() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        invite(&mut ch, user(1), user(2), now()).unwrap();
        accept(&mut ch, user(2), now()).unwrap();

        kick(&mut ch, user(1), user(2), now()).unwrap();
        assert!(!ch.members.contains(&user(2)));
        assert_eq!(ch.messages.last().unwrap().kind, MessageKind::Kick);
    }

    #[test]
    fn kick_rejects_non_member_actor() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        invite(&mut ch, user(1), user(2), now()).unwrap();
        accept(&mut ch, user(2), now()).unwrap();

        let err = kick(&mut ch, user(3), user(2), now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[test]
    fn kick_rejects_self_kick() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        let err = kick(&mut ch, user(1), user(1), now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[test]
    fn kick_rejects_non_member_target() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        let err = kick(&mut ch, user(1), user(2), now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[test]
    fn leave_removes_user_and_can_empty_channel() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        leave(&mut ch, user(1), now()).unwrap();
        assert!(ch.is_empty_of_members());
        assert_eq!(ch.messages.last().unwrap().kind, MessageKind::Leave);
    }

    #[test]
    fn leave_rejects_non_member() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        let err = leave(&mut ch, user(2), now()).unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[test]
    fn every_successful_transition_appends_exactly_one_message() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        let mut count = ch.messages.len();

        invite(&mut ch, user(1), user(2), now()).unwrap();
        assert_eq!(ch.messages.len(), count + 1);
        count = ch.messages.len();

        accept(&mut ch, user(2), now()).unwrap();
        assert_eq!(ch.messages.len(), count + 1);
        count = ch.messages.len();

        kick(&mut ch, user(1), user(2), now()).unwrap();
        assert_eq!(ch.messages.len(), count + 1);
        count = ch.messages.len();

        leave(&mut ch, user(1), now()).unwrap();
        assert_eq!(ch.messages.len(), count + 1);
    }

    #[test]
    fn members_and_invited_stay_disjoint_across_a_sequence() {
        let mut ch = create(Uuid::now_v7(), "Room".into(), user(1), now());
        invite(&mut ch, user(1), user(2), now()).unwrap();
        invite(&mut ch, user(1), user(3), now()).unwrap();
        accept(&mut ch, user(2), now()).unwrap();
        kick(&mut ch, user(2), user(1), now()).unwrap();
        leave(&mut ch, user(2), now()).unwrap();

        assert!(ch.members.is_disjoint(&ch.invited));
    }
}
