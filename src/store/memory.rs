use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{GroupChannel, PageRequest, Slice, UserId};

use super::ChannelStore;

/// In-process `ChannelStore`, used by unit tests for the Membership Engine
/// and Channel Service, and by the retry test that injects a single
/// optimistic conflict and checks the operation still succeeds exactly once.
#[derive(Clone, Default)]
pub struct InMemoryChannelStore {
    channels: Arc<RwLock<HashMap<Uuid, GroupChannel>>>,
    /// When set, the *next* `save` for this channel id fails with
    /// `OptimisticConflict` regardless of the version passed in, then clears
    /// itself. Test-only hook — there is no equivalent on `PgChannelStore`.
    inject_conflict_once: Arc<RwLock<Option<Uuid>>>,
}

impl InMemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next `save(channel)` where `channel.id == id` to fail
    /// with a single injected `OptimisticConflict`.
    pub async fn inject_conflict_once(&self, id: Uuid) {
        *self.inject_conflict_once.write().await = Some(id);
    }
}

#[async_trait]
impl ChannelStore for InMemoryChannelStore {
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<GroupChannel>> {
        Ok(self.channels.read().await.get(&id).cloned())
    }

    async fn save(&self, channel: &GroupChannel, expected_version: i64) -> AppResult<()> {
        let mut injected = self.inject_conflict_once.write().await;
        if *injected == Some(channel.id) {
            *injected = None;
            return Err(AppError::OptimisticConflict);
        }
        drop(injected);

        let mut channels = self.channels.write().await;
        let stored_version = channels.get(&channel.id).map(|c| c.version).unwrap_or(0);
        if stored_version != expected_version {
            return Err(AppError::OptimisticConflict);
        }
        channels.insert(channel.id, channel.clone());
        Ok(())
    }

    async fn insert_new(&self, channel: &GroupChannel) -> AppResult<()> {
        let mut channels = self.channels.write().await;
        channels.insert(channel.id, channel.clone());
        Ok(())
    }

    async fn find_by_membership(
        &self,
        user: UserId,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> AppResult<Slice<GroupChannel>> {
        let channels = self.channels.read().await;
        let mut matching: Vec<GroupChannel> = channels
            .values()
            .filter(|c| {
                c.members.contains(&user) && c.updated_at >= since && !c.is_empty_of_members()
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        let start = (page.page as usize) * (page.size as usize);
        let end = (start + page.size as usize).min(matching.len());
        let items = if start >= matching.len() {
            Vec::new()
        } else {
            matching[start..end].to_vec()
        };
        let has_next = end < matching.len();

        Ok(Slice {
            current_page: page.page,
            page_size: page.size,
            has_next,
            items,
        })
    }
}
