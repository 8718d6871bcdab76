//! Channel Store: durable repository of channels, members, and messages,
//! with optimistic-concurrency `save` and a membership-filtered, time-sliced
//! query.
//!
//! [`ChannelStore`] is a trait so the Membership Engine and Channel Service
//! stay testable without Postgres. [`InMemoryChannelStore`] is the reference
//! implementation used by tests, including the optimistic-conflict retry
//! test, which needs a conflict it can inject deterministically.
//! [`PgChannelStore`] is the production implementation.

mod memory;
mod postgres;
mod users;

pub use memory::InMemoryChannelStore;
pub use postgres::PgChannelStore;
pub use users::{InMemoryUserDirectory, PgUserDirectory, UserDirectory};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::model::{GroupChannel, PageRequest, Slice};

/// Repository over [`GroupChannel`] aggregates.
///
/// `save` must be all-or-nothing: the membership sets and the
/// messages appended since load commit together or not at all, and must
/// fail with [`crate::error::AppError::OptimisticConflict`] when `version`
/// has advanced since the caller's copy was loaded.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<GroupChannel>>;

    /// Persist `channel`, which must be a mutation of a value previously
    /// returned by `find_by_id` (or `create`, for a brand-new aggregate).
    /// `expected_version` is the version the caller loaded at — if the
    /// stored version has since advanced, this returns
    /// `Err(AppError::OptimisticConflict)` and `channel` is not persisted.
    async fn save(&self, channel: &GroupChannel, expected_version: i64) -> AppResult<()>;

    /// Persist a channel that does not yet exist in the store. Distinct from
    /// `save` because there is no prior version to compare against.
    async fn insert_new(&self, channel: &GroupChannel) -> AppResult<()>;

    /// Channels where `user ∈ members` and `updated_at >= since`, newest
    /// first, paged. Channels that became empty of members are excluded from
    /// this listing even though they remain in the store.
    async fn find_by_membership(
        &self,
        user: crate::model::UserId,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> AppResult<Slice<GroupChannel>>;
}
