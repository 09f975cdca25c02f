//! Disposable-email mail core: mailbox lifecycle and inbound ingestion.
//!
//! A single shared IMAP account is polled for unseen mail; each message is
//! parsed, fanned out to every matching registered mailbox, and persisted
//! with a retention window. Expired mailboxes and aged messages are swept
//! on independent schedules.

pub mod config;
pub mod error;
pub mod ingest;
pub mod parser;
pub mod service;
pub mod store;
pub mod sweep;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result, TransportError};
pub use service::{MailCore, MailStats};
