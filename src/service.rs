//! Public mailbox API: the surface consumed by the user-facing web layer.

use crate::config::RetentionConfig;
use crate::error::{Error, Result};
use crate::store::{Mailbox, MailboxDirectory, MessageStore, NewMailbox, StoredMessage};
use rand::{distr::Alphanumeric, Rng as _};
use regex::Regex;
use sqlx::SqlitePool;
use std::sync::{Arc, OnceLock};

const GENERATED_LOCAL_LEN: usize = 10;

/// Aggregate read-only counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MailStats {
    pub mailboxes: i64,
    pub messages: i64,
}

/// Facade over the directory and message store, plus address generation.
pub struct MailCore {
    directory: Arc<MailboxDirectory>,
    messages: Arc<MessageStore>,
    retention: RetentionConfig,
}

impl std::fmt::Debug for MailCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailCore")
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl MailCore {
    pub fn new(pool: SqlitePool, retention: RetentionConfig) -> Arc<Self> {
        Arc::new(Self {
            directory: MailboxDirectory::new(pool.clone()),
            messages: MessageStore::new(pool),
            retention,
        })
    }

    pub fn directory(&self) -> Arc<MailboxDirectory> {
        Arc::clone(&self.directory)
    }

    pub fn messages(&self) -> Arc<MessageStore> {
        Arc::clone(&self.messages)
    }

    /// Register a mailbox with a custom or generated local part.
    ///
    /// Retention comes from the domain override or the global default.
    pub async fn create_mailbox(
        &self,
        local_part: Option<&str>,
        domain: &str,
        owner: Option<String>,
    ) -> Result<Mailbox> {
        let domain = domain.trim().to_ascii_lowercase();
        if domain.is_empty() {
            return Err(Error::InvalidAddress("domain must not be empty".into()));
        }

        let local = match local_part {
            Some(custom) => validate_local_part(custom)?,
            None => generate_local_part(),
        };

        self.directory
            .create(NewMailbox {
                address: format!("{local}@{domain}"),
                retention_days: self.retention.days_for_domain(&domain),
                domain,
                owner,
            })
            .await
    }

    /// Cascade-delete a mailbox by address.
    pub async fn delete_mailbox(&self, address: &str) -> Result<()> {
        let mailbox = self
            .directory
            .find_by_address(address)
            .await?
            .ok_or_else(|| Error::MailboxNotFound(address.to_string()))?;

        self.directory.delete_cascade(&mailbox.id).await?;
        Ok(())
    }

    /// Inbox listing, newest first, capped by configuration.
    pub async fn list_messages(&self, address: &str, limit: i64) -> Result<Vec<StoredMessage>> {
        self.messages
            .list_by_mailbox(address, limit.min(self.retention.message_list_cap))
            .await
    }

    pub async fn mark_message_read(&self, id: &str) -> Result<bool> {
        self.messages.mark_read(id).await
    }

    pub async fn delete_message(&self, id: &str) -> Result<bool> {
        self.messages.delete(id).await
    }

    pub async fn stats(&self) -> Result<MailStats> {
        Ok(MailStats {
            mailboxes: self.directory.count().await?,
            messages: self.messages.count().await?,
        })
    }
}

fn generate_local_part() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_LOCAL_LEN)
        .map(char::from)
        .collect::<String>()
        .to_ascii_lowercase()
}

fn validate_local_part(raw: &str) -> Result<String> {
    let local = raw.trim().to_ascii_lowercase();
    if !local_part_regex().is_match(&local) {
        return Err(Error::InvalidAddress(format!(
            "local part '{raw}' may only contain letters, digits, '.', '_' and '-'"
        )));
    }
    Ok(local)
}

fn local_part_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[a-z0-9][a-z0-9._-]{0,63}$").expect("valid local part regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    async fn mail_core() -> Arc<MailCore> {
        let pool = store::connect_in_memory().await.unwrap();
        MailCore::new(pool, RetentionConfig::default())
    }

    #[tokio::test]
    async fn generated_address_is_lowercase_alphanumeric() {
        let core = mail_core().await;

        let mailbox = core.create_mailbox(None, "tempmail.io", None).await.unwrap();
        let (local, domain) = mailbox.address.split_once('@').unwrap();

        assert_eq!(domain, "tempmail.io");
        assert_eq!(local.len(), GENERATED_LOCAL_LEN);
        assert!(local.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn custom_local_part_is_validated() {
        let core = mail_core().await;

        let mailbox = core
            .create_mailbox(Some("My.Custom-Name"), "tempmail.io", None)
            .await
            .unwrap();
        assert_eq!(mailbox.address, "my.custom-name@tempmail.io");

        let error = core
            .create_mailbox(Some("no spaces!"), "tempmail.io", None)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn delete_mailbox_requires_an_existing_address() {
        let core = mail_core().await;

        let error = core.delete_mailbox("ghost@tempmail.io").await.unwrap_err();
        assert!(matches!(error, Error::MailboxNotFound(_)));
    }

    #[tokio::test]
    async fn stats_count_mailboxes_and_messages() {
        let core = mail_core().await;

        core.create_mailbox(Some("one"), "tempmail.io", None).await.unwrap();
        core.create_mailbox(Some("two"), "tempmail.io", None).await.unwrap();

        let stats = core.stats().await.unwrap();
        assert_eq!(
            stats,
            MailStats {
                mailboxes: 2,
                messages: 0
            }
        );
    }

    #[tokio::test]
    async fn owned_mailboxes_are_not_public() {
        let core = mail_core().await;

        let mailbox = core
            .create_mailbox(Some("owned"), "tempmail.io", Some("user-1".to_string()))
            .await
            .unwrap();

        assert!(!mailbox.is_public);
        assert_eq!(mailbox.owner.as_deref(), Some("user-1"));
    }
}
