use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::model::{GroupChannel, GroupMessage, MessageKind, PageRequest, Slice, UserId};

use super::ChannelStore;

/// Postgres-backed `ChannelStore`.
///
/// Table shape (created by migrations not included in this crate; `db`
/// assumes `sqlx::migrate!` has already run against the target database):
///
/// ```sql
/// CREATE TABLE group_channels (
///     id UUID PRIMARY KEY,
///     name TEXT NOT NULL,
///     last_message_id UUID,
///     updated_at TIMESTAMPTZ NOT NULL,
///     version BIGINT NOT NULL
/// );
/// CREATE TABLE group_channel_members (
///     channel_id UUID NOT NULL REFERENCES group_channels(id),
///     user_id UUID NOT NULL,
///     invited BOOLEAN NOT NULL,
///     PRIMARY KEY (channel_id, user_id)
/// );
/// CREATE TABLE group_messages (
///     id UUID PRIMARY KEY,
///     channel_id UUID NOT NULL REFERENCES group_channels(id),
///     from_user UUID,
///     kind TEXT NOT NULL,
///     payload TEXT NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL
/// );
/// CREATE INDEX group_channel_members_user_idx ON group_channel_members(user_id);
/// CREATE INDEX group_channels_updated_at_idx ON group_channels(updated_at);
/// ```
pub struct PgChannelStore {
    pool: PgPool,
}

impl PgChannelStore {
    pub fn new(pool: PgPool) -> Self {
        PgChannelStore { pool }
    }
}

#[derive(FromRow)]
struct ChannelRow {
    id: Uuid,
    name: String,
    last_message_id: Option<Uuid>,
    updated_at: DateTime<Utc>,
    version: i64,
}

#[derive(FromRow)]
struct MemberRow {
    user_id: Uuid,
    invited: bool,
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    channel_id: Uuid,
    from_user: Option<Uuid>,
    kind: String,
    payload: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for GroupMessage {
    type Error = AppError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let kind: MessageKind = row
            .kind
            .parse()
            .map_err(|e| AppError::Internal.context(e))?;
        Ok(GroupMessage {
            id: row.id,
            channel_id: row.channel_id,
            from_user: row.from_user.map(UserId),
            kind,
            payload: row.payload,
            created_at: row.created_at,
        })
    }
}

// Small helper so a parse failure still logs context without growing the
// error enum for what is, in practice, unreachable (the `kind` column is
// only ever written by this crate with `MessageKind::as_str()` values).
trait ContextExt {
    fn context(self, e: impl std::fmt::Display) -> Self;
}

impl ContextExt for AppError {
    fn context(self, e: impl std::fmt::Display) -> Self {
        tracing::error!(error = %e, "corrupt message kind in store");
        self
    }
}

async fn assemble(
    pool: &PgPool,
    row: ChannelRow,
) -> AppResult<GroupChannel> {
    let member_rows = sqlx::query_as::<_, MemberRow>(
        "SELECT user_id, invited FROM group_channel_members WHERE channel_id = $1",
    )
    .bind(row.id)
    .fetch_all(pool)
    .await?;

    let mut members = BTreeSet::new();
    let mut invited = BTreeSet::new();
    for m in member_rows {
        if m.invited {
            invited.insert(UserId(m.user_id));
        } else {
            members.insert(UserId(m.user_id));
        }
    }

    let message_rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, channel_id, from_user, kind, payload, created_at
         FROM group_messages WHERE channel_id = $1 ORDER BY created_at ASC",
    )
    .bind(row.id)
    .fetch_all(pool)
    .await?;

    let mut messages = Vec::with_capacity(message_rows.len());
    for m in message_rows {
        messages.push(GroupMessage::try_from(m)?);
    }

    Ok(GroupChannel {
        id: row.id,
        name: row.name,
        members,
        invited,
        messages,
        last_message: row.last_message_id,
        updated_at: row.updated_at,
        version: row.version,
    })
}

#[async_trait]
impl ChannelStore for PgChannelStore {
    async fn find_by_id(&self, id: Uuid) -> AppResult<Option<GroupChannel>> {
        let row = sqlx::query_as::<_, ChannelRow>(
            "SELECT id, name, last_message_id, updated_at, version
             FROM group_channels WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(assemble(&self.pool, row).await?)),
            None => Ok(None),
        }
    }

    async fn insert_new(&self, channel: &GroupChannel) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO group_channels (id, name, last_message_id, updated_at, version)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(channel.id)
        .bind(&channel.name)
        .bind(channel.last_message)
        .bind(channel.updated_at)
        .bind(channel.version)
        .execute(&mut *tx)
        .await?;

        write_members_and_messages(&mut tx, channel).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn save(&self, channel: &GroupChannel, expected_version: i64) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE group_channels
             SET name = $1, last_message_id = $2, updated_at = $3, version = $4
             WHERE id = $5 AND version = $6",
        )
        .bind(&channel.name)
        .bind(channel.last_message)
        .bind(channel.updated_at)
        .bind(channel.version)
        .bind(channel.id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            // Either the row doesn't exist, or (far more likely) its version
            // has moved since this caller loaded it.
            return Err(AppError::OptimisticConflict);
        }

        sqlx::query("DELETE FROM group_channel_members WHERE channel_id = $1")
            .bind(channel.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_messages WHERE channel_id = $1")
            .bind(channel.id)
            .execute(&mut *tx)
            .await?;

        write_members_and_messages(&mut tx, channel).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_membership(
        &self,
        user: UserId,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> AppResult<Slice<GroupChannel>> {
        let offset = (page.page as i64) * (page.size as i64);
        // Fetch one extra row to learn has_next without a second COUNT query.
        let rows = sqlx::query_as::<_, ChannelRow>(
            "SELECT c.id, c.name, c.last_message_id, c.updated_at, c.version
             FROM group_channels c
             JOIN group_channel_members m ON m.channel_id = c.id AND m.invited = FALSE
             WHERE m.user_id = $1 AND c.updated_at >= $2
             ORDER BY c.updated_at DESC
             LIMIT $3 OFFSET $4",
        )
        .bind(user.0)
        .bind(since)
        .bind(page.size as i64 + 1)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let has_next = rows.len() as i64 > page.size as i64;
        let mut rows = rows;
        rows.truncate(page.size as usize);

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let channel = assemble(&self.pool, row).await?;
            if !channel.is_empty_of_members() {
                items.push(channel);
            }
        }

        Ok(Slice {
            current_page: page.page,
            page_size: page.size,
            has_next,
            items,
        })
    }
}

async fn write_members_and_messages(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    channel: &GroupChannel,
) -> AppResult<()> {
    for member in &channel.members {
        sqlx::query(
            "INSERT INTO group_channel_members (channel_id, user_id, invited)
             VALUES ($1, $2, FALSE)",
        )
        .bind(channel.id)
        .bind(member.0)
        .execute(&mut **tx)
        .await?;
    }
    for invitee in &channel.invited {
        sqlx::query(
            "INSERT INTO group_channel_members (channel_id, user_id, invited)
             VALUES ($1, $2, TRUE)",
        )
        .bind(channel.id)
        .bind(invitee.0)
        .execute(&mut **tx)
        .await?;
    }
    for message in &channel.messages {
        sqlx::query(
            "INSERT INTO group_messages (id, channel_id, from_user, kind, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(message.id)
        .bind(message.channel_id)
        .bind(message.from_user.map(|u| u.0))
        .bind(message.kind.as_str())
        .bind(&message.payload)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
