//! Channel Service: the transactional orchestrator. Validates string
//! identifiers into UUIDs, loads aggregates, drives the Membership Engine,
//! persists through the optimistic-retry wrapper, publishes to the bus after
//! commit, and returns the DTOs callers see.
//!
//! Follows a validate -> load -> mutate -> persist -> respond shape, kept
//! transport-agnostic with no HTTP dependency of its own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::error::{AppError, AppResult};
use crate::membership;
use crate::model::{
    GroupChannel, GroupChannelProfile, GroupMessage, GroupMessageDto, PageRequest, Slice, UserId,
};
use crate::store::{ChannelStore, UserDirectory};
use crate::subject;

const MAX_CHANNEL_NAME_LEN: usize = 100;

fn parse_uuid(raw: &str, field: &str) -> AppResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| AppError::Validation(format!("{field} is not a valid UUID")))
}

fn validate_name(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation("channel name must not be empty".into()));
    }
    if trimmed.chars().count() > MAX_CHANNEL_NAME_LEN {
        return Err(AppError::Validation(format!(
            "channel name must be at most {MAX_CHANNEL_NAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_owned())
}

/// Generic wrapper around a transactional callable. `attempt` is expected
/// to load, mutate, and save on every call — each retry starts from a fresh
/// load, not a replay of a stale in-memory aggregate. Only
/// `OptimisticConflict` is retried; every other error returns immediately.
pub async fn with_optimistic_retry<F, Fut, T>(
    max_attempts: u32,
    backoff: Duration,
    mut attempt: F,
) -> AppResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    let mut attempts_made = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(AppError::OptimisticConflict) => {
                attempts_made += 1;
                if attempts_made >= max_attempts {
                    return Err(AppError::OptimisticConflict);
                }
                tokio::time::sleep(backoff).await;
            }
            Err(other) => return Err(other),
        }
    }
}

#[derive(Clone)]
pub struct ChannelService {
    store: Arc<dyn ChannelStore>,
    bus: Arc<dyn MessageBus>,
    users: Arc<dyn UserDirectory>,
    retry_max_attempts: u32,
    retry_backoff: Duration,
}

impl ChannelService {
    pub fn new(
        store: Arc<dyn ChannelStore>,
        bus: Arc<dyn MessageBus>,
        users: Arc<dyn UserDirectory>,
        retry_max_attempts: u32,
        retry_backoff: Duration,
    ) -> Self {
        ChannelService {
            store,
            bus,
            users,
            retry_max_attempts,
            retry_backoff,
        }
    }

    async fn resolve_summary(&self, id: UserId) -> AppResult<crate::model::UserSummary> {
        self.users
            .find_summary(id)
            .await?
            .ok_or_else(|| AppError::UserDoesNotExist(id.to_string()))
    }

    async fn load_channel(&self, id: Uuid) -> AppResult<GroupChannel> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::ChannelDoesNotExist(id.to_string()))
    }

    async fn build_message_dto(&self, message: &GroupMessage) -> AppResult<GroupMessageDto> {
        let from = match message.from_user {
            Some(uid) => Some(self.resolve_summary(uid).await?),
            None => None,
        };
        Ok(GroupMessageDto::from_message(message.clone(), from))
    }

    async fn build_profile(&self, channel: &GroupChannel) -> AppResult<GroupChannelProfile> {
        let mut members = Vec::with_capacity(channel.members.len());
        for m in &channel.members {
            members.push(self.resolve_summary(*m).await?);
        }
        let mut invited = Vec::with_capacity(channel.invited.len());
        for i in &channel.invited {
            invited.push(self.resolve_summary(*i).await?);
        }
        let last_message = match channel.last_message() {
            Some(m) => Some(self.build_message_dto(m).await?),
            None => None,
        };
        Ok(GroupChannelProfile {
            id: channel.id,
            name: channel.name.clone(),
            members,
            invited,
            last_message,
            updated_at: channel.updated_at,
        })
    }

    /// Publish-after-commit: called only once the triggering
    /// `store.save`/`insert_new` has already returned `Ok`. A failed publish
    /// is logged and never rolled back.
    async fn publish_to_members(&self, channel: &GroupChannel, dto: &GroupMessageDto) {
        let payload = match serde_json::to_string(dto) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outbound message; dropping publish");
                return;
            }
        };
        for member in &channel.members {
            let subject = subject::encode(*member);
            if let Err(e) = self.bus.publish(&subject, payload.clone()).await {
                tracing::warn!(
                    subject = %subject,
                    error = %e,
                    "bus publish failed after commit; message persisted but not delivered live"
                );
            }
        }
    }

    pub async fn create_channel(
        &self,
        from_user_id: &str,
        name: &str,
    ) -> AppResult<GroupChannelProfile> {
        let creator = UserId(parse_uuid(from_user_id, "fromUserId")?);
        self.resolve_summary(creator).await?;
        let name = validate_name(name)?;

        let channel = membership::create(Uuid::now_v7(), name, creator, Utc::now());
        self.store.insert_new(&channel).await?;

        if let Some(message) = channel.last_message() {
            let dto = self.build_message_dto(message).await?;
            self.publish_to_members(&channel, &dto).await;
        }

        self.build_profile(&channel).await
    }

    pub async fn invite_to_channel(
        &self,
        from_user_id: &str,
        to_user_id: &str,
        channel_id: &str,
    ) -> AppResult<GroupMessageDto> {
        let inviter = UserId(parse_uuid(from_user_id, "fromUserId")?);
        let invitee = UserId(parse_uuid(to_user_id, "toUserId")?);
        let cid = parse_uuid(channel_id, "channelId")?;
        self.resolve_summary(inviter).await?;
        self.resolve_summary(invitee).await?;

        let channel = with_optimistic_retry(self.retry_max_attempts, self.retry_backoff, || async {
            let mut channel = self.load_channel(cid).await?;
            let expected_version = channel.version;
            membership::invite(&mut channel, inviter, invitee, Utc::now())?;
            self.store.save(&channel, expected_version).await?;
            Ok(channel)
        })
        .await?;

        let message = channel.last_message().expect("invite appends a message");
        let dto = self.build_message_dto(message).await?;
        self.publish_to_members(&channel, &dto).await;
        Ok(dto)
    }

    pub async fn accept_invitation(
        &self,
        of_user_id: &str,
        channel_id: &str,
    ) -> AppResult<GroupMessageDto> {
        let invitee = UserId(parse_uuid(of_user_id, "ofUserId")?);
        let cid = parse_uuid(channel_id, "channelId")?;
        self.resolve_summary(invitee).await?;

        let channel = with_optimistic_retry(self.retry_max_attempts, self.retry_backoff, || async {
            let mut channel = self.load_channel(cid).await?;
            let expected_version = channel.version;
            membership::accept(&mut channel, invitee, Utc::now())?;
            self.store.save(&channel, expected_version).await?;
            Ok(channel)
        })
        .await?;

        let message = channel.last_message().expect("accept appends a message");
        let dto = self.build_message_dto(message).await?;
        self.publish_to_members(&channel, &dto).await;
        Ok(dto)
    }

    pub async fn remove_from_channel(
        &self,
        from_user_id: &str,
        target_user_id: &str,
        channel_id: &str,
    ) -> AppResult<GroupMessageDto> {
        let actor = UserId(parse_uuid(from_user_id, "fromUserId")?);
        let target = UserId(parse_uuid(target_user_id, "targetUserId")?);
        let cid = parse_uuid(channel_id, "channelId")?;
        self.resolve_summary(actor).await?;
        self.resolve_summary(target).await?;

        let channel = with_optimistic_retry(self.retry_max_attempts, self.retry_backoff, || async {
            let mut channel = self.load_channel(cid).await?;
            let expected_version = channel.version;
            membership::kick(&mut channel, actor, target, Utc::now())?;
            self.store.save(&channel, expected_version).await?;
            Ok(channel)
        })
        .await?;

        let message = channel.last_message().expect("kick appends a message");
        let dto = self.build_message_dto(message).await?;
        self.publish_to_members(&channel, &dto).await;
        Ok(dto)
    }

    pub async fn leave_channel(
        &self,
        of_user_id: &str,
        channel_id: &str,
    ) -> AppResult<GroupMessageDto> {
        let user = UserId(parse_uuid(of_user_id, "ofUserId")?);
        let cid = parse_uuid(channel_id, "channelId")?;
        self.resolve_summary(user).await?;

        let channel = with_optimistic_retry(self.retry_max_attempts, self.retry_backoff, || async {
            let mut channel = self.load_channel(cid).await?;
            let expected_version = channel.version;
            membership::leave(&mut channel, user, Utc::now())?;
            self.store.save(&channel, expected_version).await?;
            Ok(channel)
        })
        .await?;

        let message = channel.last_message().expect("leave appends a message");
        let dto = self.build_message_dto(message).await?;
        // channel.members no longer includes the departing user at this
        // point, so publish_to_members addresses only the members who stay.
        self.publish_to_members(&channel, &dto).await;
        Ok(dto)
    }

    pub async fn get_all_channels(
        &self,
        of_user_id: &str,
        since: DateTime<Utc>,
        page: u32,
        size: u32,
    ) -> AppResult<Slice<GroupChannelProfile>> {
        let user = UserId(parse_uuid(of_user_id, "ofUserId")?);
        if size < 1 {
            return Err(AppError::Validation("size must be >= 1".into()));
        }

        let slice = self
            .store
            .find_by_membership(user, since, PageRequest { page, size })
            .await?;

        let mut items = Vec::with_capacity(slice.items.len());
        for channel in &slice.items {
            items.push(self.build_profile(channel).await?);
        }

        Ok(Slice {
            current_page: slice.current_page,
            page_size: slice.page_size,
            has_next: slice.has_next,
            items,
        })
    }

    pub async fn get_channel_profile(
        &self,
        of_user_id: &str,
        channel_id: &str,
    ) -> AppResult<GroupChannelProfile> {
        let user = UserId(parse_uuid(of_user_id, "ofUserId")?);
        let cid = parse_uuid(channel_id, "channelId")?;

        let channel = self.load_channel(cid).await?;
        if !channel.members.contains(&user) {
            return Err(AppError::InvalidOperation(
                "user is not a member of this channel".into(),
            ));
        }
        self.build_profile(&channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::store::{InMemoryChannelStore, InMemoryUserDirectory};

    fn service() -> (ChannelService, InMemoryChannelStore, InMemoryUserDirectory) {
        let store = InMemoryChannelStore::new();
        let bus = Arc::new(LocalBus::new());
        let mut users = InMemoryUserDirectory::new();
        for n in 1..=5u8 {
            users.insert(UserId(Uuid::from_u128(n as u128)), format!("user-{n}"));
        }
        let users_arc: Arc<dyn UserDirectory> = Arc::new(users.clone());
        let svc = ChannelService::new(
            Arc::new(store.clone()),
            bus,
            users_arc,
            5,
            Duration::from_millis(1),
        );
        (svc, store, users)
    }

    fn uid(n: u8) -> String {
        Uuid::from_u128(n as u128).to_string()
    }

    #[tokio::test]
    async fn create_then_list() {
        let (svc, _store, _users) = service();
        let profile = svc.create_channel(&uid(1), "Room A").await.unwrap();
        assert_eq!(profile.members.len(), 1);
        assert_eq!(profile.members[0].username, "user-1");

        let t0 = Utc::now() - chrono::Duration::seconds(5);
        let slice = svc
            .get_all_channels(&uid(1), t0, 0, 10)
            .await
            .unwrap();
        assert_eq!(slice.items.len(), 1);
        assert_eq!(slice.items[0].name, "Room A");
        assert!(!slice.has_next);
    }

    #[tokio::test]
    async fn invite_then_accept() {
        let (svc, _store, _users) = service();
        let profile = svc.create_channel(&uid(1), "R").await.unwrap();

        let invite_dto = svc
            .invite_to_channel(&uid(1), &uid(2), &profile.id.to_string())
            .await
            .unwrap();
        assert_eq!(invite_dto.kind, "INVITE");
        assert_eq!(invite_dto.from.unwrap().username, "user-1");

        let join_dto = svc
            .accept_invitation(&uid(2), &profile.id.to_string())
            .await
            .unwrap();
        assert_eq!(join_dto.kind, "JOIN");

        let refreshed = svc
            .get_channel_profile(&uid(2), &profile.id.to_string())
            .await
            .unwrap();
        let mut usernames: Vec<_> = refreshed.members.iter().map(|u| u.username.clone()).collect();
        usernames.sort();
        assert_eq!(usernames, vec!["user-1", "user-2"]);
    }

    #[tokio::test]
    async fn kick_forbidden_paths() {
        let (svc, _store, _users) = service();
        let profile = svc.create_channel(&uid(1), "R").await.unwrap();
        let cid = profile.id.to_string();

        let err = svc
            .remove_from_channel(&uid(2), &uid(1), &cid)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));

        let err = svc
            .remove_from_channel(&uid(1), &uid(1), &cid)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn leave_last_member_drops_from_listing() {
        let (svc, _store, _users) = service();
        let profile = svc.create_channel(&uid(1), "R").await.unwrap();
        let cid = profile.id.to_string();

        let dto = svc.leave_channel(&uid(1), &cid).await.unwrap();
        assert_eq!(dto.kind, "LEAVE");

        let t0 = Utc::now() - chrono::Duration::seconds(5);
        let slice = svc.get_all_channels(&uid(1), t0, 0, 10).await.unwrap();
        assert!(slice.items.is_empty());
    }

    #[tokio::test]
    async fn retry_recovers_from_a_single_injected_conflict() {
        let (svc, store, _users) = service();
        let profile = svc.create_channel(&uid(1), "R").await.unwrap();

        store.inject_conflict_once(profile.id).await;

        let dto = svc
            .invite_to_channel(&uid(1), &uid(2), &profile.id.to_string())
            .await
            .unwrap();
        assert_eq!(dto.kind, "INVITE");

        let refreshed = svc
            .get_channel_profile(&uid(1), &profile.id.to_string())
            .await
            .unwrap();
        assert_eq!(refreshed.invited.len(), 1);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected_before_any_membership_mutation() {
        let (svc, _store, _users) = service();
        let missing = Uuid::from_u128(99).to_string();
        let err = svc.create_channel(&missing, "R").await.unwrap_err();
        assert!(matches!(err, AppError::UserDoesNotExist(_)));
    }

    #[tokio::test]
    async fn malformed_identifier_is_a_validation_error() {
        let (svc, _store, _users) = service();
        let err = svc
            .create_channel("not-a-uuid", "R")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn blank_name_is_a_validation_error() {
        let (svc, _store, _users) = service();
        let err = svc.create_channel(&uid(1), "   ").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
