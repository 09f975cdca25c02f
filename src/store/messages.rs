//! Message store: persisted copies of delivered emails.

use crate::error::Result;
use crate::parser::{AttachmentInfo, ParsedEmail};
use crate::store::mailboxes::{normalize_address, Mailbox};
use anyhow::Context as _;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// Hard cap on a single inbox listing, protecting the read path from
/// unbounded inboxes.
pub const MESSAGE_LIST_CAP: i64 = 50;

/// One delivered email, bound to exactly one mailbox at persistence time.
///
/// Both the owning mailbox id and its address string are denormalized onto
/// the row, so the row survives renames but not mailbox deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub mailbox_id: String,
    pub mailbox_address: String,
    pub from_address: String,
    pub from_name: Option<String>,
    /// The matched mailbox address, not the full original To list.
    pub recipient: String,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
    /// Flips true only via explicit user action, never on fetch.
    pub is_read: bool,
    /// From the message's own Date header, falling back to ingestion time.
    pub received_at: DateTime<Utc>,
    /// Ingestion time; age-based pruning keys off this.
    pub created_at: DateTime<Utc>,
}

pub struct MessageStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl MessageStore {
    pub fn new(pool: SqlitePool) -> Arc<Self> {
        Arc::new(Self { pool })
    }

    /// Persist one delivered copy of a parsed email against a mailbox.
    ///
    /// Never rejects duplicate content; duplicates across cycles are
    /// prevented upstream by the seen flag, not here.
    pub async fn append(
        &self,
        mailbox: &Mailbox,
        recipient: &str,
        email: &ParsedEmail,
    ) -> Result<StoredMessage> {
        self.append_at(mailbox, recipient, email, Utc::now()).await
    }

    pub async fn append_at(
        &self,
        mailbox: &Mailbox,
        recipient: &str,
        email: &ParsedEmail,
        now: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        let message = StoredMessage {
            id: uuid::Uuid::new_v4().to_string(),
            mailbox_id: mailbox.id.clone(),
            mailbox_address: mailbox.address.clone(),
            from_address: email.from_address.clone(),
            from_name: email.from_name.clone(),
            recipient: normalize_address(recipient),
            subject: email.subject.clone(),
            text_body: email.text_body.clone(),
            html_body: email.html_body.clone(),
            attachments: email.attachments.clone(),
            is_read: false,
            received_at: email.date.unwrap_or(now),
            created_at: now,
        };

        let attachments_json = serde_json::to_string(&message.attachments)
            .context("failed to serialize attachment metadata")?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, mailbox_id, mailbox_address, from_address, from_name,
                                  recipient, subject, text_body, html_body, attachments,
                                  is_read, received_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.mailbox_id)
        .bind(&message.mailbox_address)
        .bind(&message.from_address)
        .bind(message.from_name.as_deref())
        .bind(&message.recipient)
        .bind(&message.subject)
        .bind(message.text_body.as_deref())
        .bind(message.html_body.as_deref())
        .bind(&attachments_json)
        .bind(message.is_read)
        .bind(message.received_at)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to append message for {}", message.mailbox_address))?;

        Ok(message)
    }

    /// Inbox listing: newest received-first, ties broken by creation order.
    /// The limit is clamped to [`MESSAGE_LIST_CAP`].
    pub async fn list_by_mailbox(&self, address: &str, limit: i64) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mailbox_id, mailbox_address, from_address, from_name, recipient,
                   subject, text_body, html_body, attachments, is_read, received_at, created_at
            FROM messages
            WHERE mailbox_address = ?
            ORDER BY received_at DESC, created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(normalize_address(address))
        .bind(limit.clamp(1, MESSAGE_LIST_CAP))
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list messages for {address}"))?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    /// Flip the read flag. Explicit user action only.
    pub async fn mark_read(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE messages SET is_read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to mark message {id} read"))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete message {id}"))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_mailbox(&self, mailbox_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE mailbox_id = ?")
            .bind(mailbox_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete messages of mailbox {mailbox_id}"))?;

        Ok(result.rows_affected())
    }

    /// Age-based pruning: delete everything ingested before the cutoff,
    /// regardless of whether the owning mailbox is still live.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to prune aged messages")?;

        Ok(result.rows_affected())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .context("failed to count messages")?;
        Ok(count)
    }

    /// Messages still referencing a mailbox id; used to verify cascade
    /// deletes leave nothing orphaned.
    pub async fn count_by_mailbox(&self, mailbox_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE mailbox_id = ?")
            .bind(mailbox_id)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count messages of mailbox {mailbox_id}"))?;
        Ok(count)
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    let attachments_json: String = row.try_get("attachments").unwrap_or_default();
    let attachments: Vec<AttachmentInfo> =
        serde_json::from_str(&attachments_json).unwrap_or_default();

    StoredMessage {
        id: row.try_get("id").unwrap_or_default(),
        mailbox_id: row.try_get("mailbox_id").unwrap_or_default(),
        mailbox_address: row.try_get("mailbox_address").unwrap_or_default(),
        from_address: row.try_get("from_address").unwrap_or_default(),
        from_name: row.try_get("from_name").ok().flatten(),
        recipient: row.try_get("recipient").unwrap_or_default(),
        subject: row.try_get("subject").unwrap_or_default(),
        text_body: row.try_get("text_body").ok().flatten(),
        html_body: row.try_get("html_body").ok().flatten(),
        attachments,
        is_read: row.try_get("is_read").unwrap_or(false),
        received_at: row.try_get("received_at").unwrap_or_else(|_| Utc::now()),
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::ParsedEmail;
    use crate::store::mailboxes::{MailboxDirectory, NewMailbox};
    use chrono::Duration;

    async fn fixtures() -> (Arc<MailboxDirectory>, Arc<MessageStore>, Mailbox) {
        let pool = crate::store::connect_in_memory().await.unwrap();
        let directory = MailboxDirectory::new(pool.clone());
        let messages = MessageStore::new(pool);
        let mailbox = directory
            .create(NewMailbox {
                address: "abc123@tempmail.io".to_string(),
                domain: "tempmail.io".to_string(),
                owner: None,
                retention_days: 5,
            })
            .await
            .unwrap();
        (directory, messages, mailbox)
    }

    fn email(subject: &str) -> ParsedEmail {
        ParsedEmail {
            from_address: "alice@example.com".to_string(),
            from_name: Some("Alice".to_string()),
            recipients: vec!["abc123@tempmail.io".to_string()],
            subject: subject.to_string(),
            text_body: Some("hello body".to_string()),
            html_body: Some("<p>hello body</p>".to_string()),
            date: None,
            attachments: vec![AttachmentInfo {
                filename: "report.pdf".to_string(),
                content_type: "application/pdf".to_string(),
                size_bytes: 16,
            }],
        }
    }

    #[tokio::test]
    async fn append_then_list_round_trips_content() {
        let (_directory, messages, mailbox) = fixtures().await;

        let appended = messages
            .append(&mailbox, "abc123@tempmail.io", &email("round trip"))
            .await
            .unwrap();
        let listed = messages
            .list_by_mailbox("abc123@tempmail.io", 10)
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, appended.id);
        assert_eq!(listed[0].from_address, "alice@example.com");
        assert_eq!(listed[0].from_name.as_deref(), Some("Alice"));
        assert_eq!(listed[0].subject, "round trip");
        assert_eq!(listed[0].text_body.as_deref(), Some("hello body"));
        assert_eq!(listed[0].html_body.as_deref(), Some("<p>hello body</p>"));
        assert_eq!(listed[0].attachments, appended.attachments);
        assert!(!listed[0].is_read);
    }

    #[tokio::test]
    async fn listing_orders_newest_received_first() {
        let (_directory, messages, mailbox) = fixtures().await;
        let base = Utc::now();

        for (subject, offset) in [("oldest", 0), ("newest", 120), ("middle", 60)] {
            let mut parsed = email(subject);
            parsed.date = Some(base + Duration::seconds(offset));
            messages
                .append_at(&mailbox, &mailbox.address, &parsed, base)
                .await
                .unwrap();
        }

        let listed = messages.list_by_mailbox(&mailbox.address, 10).await.unwrap();
        let subjects: Vec<&str> = listed.iter().map(|m| m.subject.as_str()).collect();
        assert_eq!(subjects, vec!["newest", "middle", "oldest"]);
    }

    #[tokio::test]
    async fn listing_is_capped() {
        let (_directory, messages, mailbox) = fixtures().await;

        for index in 0..60 {
            messages
                .append(&mailbox, &mailbox.address, &email(&format!("m{index}")))
                .await
                .unwrap();
        }

        let listed = messages
            .list_by_mailbox(&mailbox.address, 1000)
            .await
            .unwrap();
        assert_eq!(listed.len() as i64, MESSAGE_LIST_CAP);
    }

    #[tokio::test]
    async fn mark_read_flips_only_on_explicit_call() {
        let (_directory, messages, mailbox) = fixtures().await;

        let appended = messages
            .append(&mailbox, &mailbox.address, &email("unread"))
            .await
            .unwrap();

        // A listing alone never flips the flag.
        let listed = messages.list_by_mailbox(&mailbox.address, 10).await.unwrap();
        assert!(!listed[0].is_read);

        assert!(messages.mark_read(&appended.id).await.unwrap());
        let listed = messages.list_by_mailbox(&mailbox.address, 10).await.unwrap();
        assert!(listed[0].is_read);
    }

    #[tokio::test]
    async fn cascade_delete_leaves_no_orphans() {
        let (directory, messages, mailbox) = fixtures().await;

        for _ in 0..3 {
            messages
                .append(&mailbox, &mailbox.address, &email("doomed"))
                .await
                .unwrap();
        }

        assert!(directory.delete_cascade(&mailbox.id).await.unwrap());
        assert!(messages
            .list_by_mailbox(&mailbox.address, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(messages.count_by_mailbox(&mailbox.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn age_pruning_ignores_mailbox_liveness() {
        let (directory, messages, mailbox) = fixtures().await;
        let now = Utc::now();

        // Mailbox is live, but this message was ingested 8 days ago.
        messages
            .append_at(&mailbox, &mailbox.address, &email("aged"), now - Duration::days(8))
            .await
            .unwrap();
        messages
            .append_at(&mailbox, &mailbox.address, &email("recent"), now)
            .await
            .unwrap();

        let pruned = messages
            .delete_older_than(now - Duration::days(7))
            .await
            .unwrap();

        assert_eq!(pruned, 1);
        assert!(directory
            .find_for_delivery(&mailbox.address)
            .await
            .unwrap()
            .is_some());
        let listed = messages.list_by_mailbox(&mailbox.address, 10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].subject, "recent");
    }
}
