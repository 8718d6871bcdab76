//! Read-only lookup of externally-managed users. The Channel Service needs
//! this only to resolve a `UserId` into the `{id, username}` pair embedded
//! in outbound DTOs and to check referential integrity before running the
//! Membership Engine; it is not part of the Group Channel Subsystem's own
//! aggregate.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::AppResult;
use crate::model::{UserId, UserSummary};

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_summary(&self, id: UserId) -> AppResult<Option<UserSummary>>;
}

pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        PgUserDirectory { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_summary(&self, id: UserId) -> AppResult<Option<UserSummary>> {
        let row = sqlx::query_as::<_, UserSummary>(
            "SELECT id, username FROM users WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

/// Fixed-table lookup used by Channel Service unit tests, mirroring
/// [`super::InMemoryChannelStore`]'s role for `ChannelStore`.
#[derive(Clone, Default)]
pub struct InMemoryUserDirectory {
    users: std::collections::HashMap<uuid::Uuid, UserSummary>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: UserId, username: impl Into<String>) {
        self.users.insert(
            id.0,
            UserSummary {
                id: id.0,
                username: username.into(),
            },
        );
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_summary(&self, id: UserId) -> AppResult<Option<UserSummary>> {
        Ok(self.users.get(&id.0).cloned())
    }
}
