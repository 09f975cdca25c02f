//! Mailbox directory: the registry of active disposable addresses.

use crate::error::{Error, Result};
use anyhow::Context as _;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// A disposable inbound address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub id: String,
    /// Globally unique, stored and compared case-insensitively.
    pub address: String,
    pub domain: String,
    /// Absent for anonymous mailboxes.
    pub owner: Option<String>,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Mailbox {
    /// A mailbox past its expiry is logically dead even before the sweeper
    /// physically removes it.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Parameters for registering a mailbox.
#[derive(Debug, Clone)]
pub struct NewMailbox {
    pub address: String,
    pub domain: String,
    pub owner: Option<String>,
    pub retention_days: u32,
}

/// CRUD over mailboxes plus the delivery-time lookup used by ingestion.
pub struct MailboxDirectory {
    pool: SqlitePool,
}

impl std::fmt::Debug for MailboxDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxDirectory")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl MailboxDirectory {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Register a mailbox.
    ///
    /// Idempotent for a still-live address (returns the existing record,
    /// so "ensure mailbox exists" calls from reconnecting clients are
    /// cheap). An expired-but-unswept address is a [`Error::Conflict`]
    /// until the retention sweep frees it. Ingestion never calls this;
    /// delivery is lookup-only.
    pub async fn create(&self, new: NewMailbox) -> Result<Mailbox> {
        self.create_at(new, Utc::now()).await
    }

    pub async fn create_at(&self, new: NewMailbox, now: DateTime<Utc>) -> Result<Mailbox> {
        let address = normalize_address(&new.address);

        if let Some(existing) = self.find_by_address(&address).await? {
            if existing.is_live(now) {
                return Ok(existing);
            }
            return Err(Error::Conflict(address));
        }

        let mailbox = Mailbox {
            id: uuid::Uuid::new_v4().to_string(),
            address,
            domain: new.domain.trim().to_ascii_lowercase(),
            is_public: new.owner.is_none(),
            owner: new.owner,
            created_at: now,
            expires_at: now + Duration::days(i64::from(new.retention_days)),
        };

        sqlx::query(
            r#"
            INSERT INTO mailboxes (id, address, domain, owner, is_public, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&mailbox.id)
        .bind(&mailbox.address)
        .bind(&mailbox.domain)
        .bind(mailbox.owner.as_deref())
        .bind(mailbox.is_public)
        .bind(mailbox.created_at)
        .bind(mailbox.expires_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to create mailbox {}", mailbox.address))?;

        tracing::info!(address = %mailbox.address, expires_at = %mailbox.expires_at, "mailbox created");
        Ok(mailbox)
    }

    /// Look up a mailbox regardless of expiry state.
    pub async fn find_by_address(&self, address: &str) -> Result<Option<Mailbox>> {
        let row = sqlx::query(
            r#"
            SELECT id, address, domain, owner, is_public, created_at, expires_at
            FROM mailboxes
            WHERE address = ?
            "#,
        )
        .bind(normalize_address(address))
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to look up mailbox {address}"))?;

        Ok(row.map(|row| row_to_mailbox(&row)))
    }

    /// Delivery-time lookup: case-insensitive exact match, expired
    /// mailboxes treated as non-existent even before they are swept.
    pub async fn find_for_delivery(&self, address: &str) -> Result<Option<Mailbox>> {
        let row = sqlx::query(
            r#"
            SELECT id, address, domain, owner, is_public, created_at, expires_at
            FROM mailboxes
            WHERE address = ? AND expires_at > ?
            "#,
        )
        .bind(normalize_address(address))
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed delivery lookup for {address}"))?;

        Ok(row.map(|row| row_to_mailbox(&row)))
    }

    /// Logically kill a mailbox now; the sweeper removes it later.
    pub async fn expire(&self, address: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE mailboxes SET expires_at = ? WHERE address = ?")
            .bind(Utc::now())
            .bind(normalize_address(address))
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to expire mailbox {address}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a mailbox and all of its messages in one transaction, so a
    /// concurrent reader never observes one without the other.
    pub async fn delete_cascade(&self, mailbox_id: &str) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin cascade delete")?;

        sqlx::query("DELETE FROM messages WHERE mailbox_id = ?")
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete messages of mailbox {mailbox_id}"))?;

        let result = sqlx::query("DELETE FROM mailboxes WHERE id = ?")
            .bind(mailbox_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete mailbox {mailbox_id}"))?;

        tx.commit().await.context("failed to commit cascade delete")?;

        Ok(result.rows_affected() > 0)
    }

    /// All mailboxes whose expiry has passed; input for the retention sweep.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Mailbox>> {
        let rows = sqlx::query(
            r#"
            SELECT id, address, domain, owner, is_public, created_at, expires_at
            FROM mailboxes
            WHERE expires_at <= ?
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("failed to list expired mailboxes")?;

        Ok(rows.iter().map(row_to_mailbox).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM mailboxes")
            .fetch_one(&self.pool)
            .await
            .context("failed to count mailboxes")?;
        Ok(count)
    }
}

/// Canonical form used everywhere: trimmed and lower-cased.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

fn row_to_mailbox(row: &sqlx::sqlite::SqliteRow) -> Mailbox {
    Mailbox {
        id: row.try_get("id").unwrap_or_default(),
        address: row.try_get("address").unwrap_or_default(),
        domain: row.try_get("domain").unwrap_or_default(),
        owner: row.try_get("owner").ok().flatten(),
        is_public: row.try_get("is_public").unwrap_or(true),
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        expires_at: row.try_get("expires_at").unwrap_or_else(|_| Utc::now()),
    }
}
