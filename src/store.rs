//! SQLite persistence: mailbox directory and message store.

pub mod mailboxes;
pub mod messages;

pub use mailboxes::{Mailbox, MailboxDirectory, NewMailbox};
pub use messages::{MessageStore, StoredMessage};

use crate::error::Result;
use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr as _;

/// Open (or create) the SQLite database behind both stores.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url '{database_url}'"))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database '{database_url}'"))?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Non-persistent backend for development and tests.
///
/// Same interface, same schema, gone on process exit. Never substituted
/// for the configured database implicitly; callers opt in explicitly.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    // One connection only, never reaped: each in-memory SQLite connection
    // is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory database")?;

    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<()> {
    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS mailboxes (
            id TEXT PRIMARY KEY,
            address TEXT NOT NULL COLLATE NOCASE,
            domain TEXT NOT NULL,
            owner TEXT,
            is_public INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )
        "#,
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_mailboxes_address ON mailboxes(address)",
        "CREATE INDEX IF NOT EXISTS idx_mailboxes_expires ON mailboxes(expires_at)",
        r#"
        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            mailbox_id TEXT NOT NULL,
            mailbox_address TEXT NOT NULL COLLATE NOCASE,
            from_address TEXT NOT NULL,
            from_name TEXT,
            recipient TEXT NOT NULL,
            subject TEXT NOT NULL,
            text_body TEXT,
            html_body TEXT,
            attachments TEXT NOT NULL DEFAULT '[]',
            is_read INTEGER NOT NULL DEFAULT 0,
            received_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_messages_mailbox ON messages(mailbox_id)",
        "CREATE INDEX IF NOT EXISTS idx_messages_address ON messages(mailbox_address)",
        "CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to initialize database schema")?;
    }

    Ok(())
}
