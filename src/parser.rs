//! MIME parser adapter over `mailparse`.
//!
//! Converts one raw RFC 822 message into a structured record: envelope
//! addresses, subject, text and HTML bodies, and attachment metadata.
//! Stateless; a parse failure on one message never aborts the batch —
//! callers catch per-message, log, and move on.

use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone as _, Utc};
use mailparse::{DispositionType, MailAddr, MailHeaderMap};

const DEFAULT_SUBJECT: &str = "(No Subject)";
const DEFAULT_ATTACHMENT_NAME: &str = "attachment";

/// Metadata for one attachment part. Binary payloads are not retained;
/// only name, type, and size survive into storage.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AttachmentInfo {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: usize,
}

/// One parsed inbound email, ready for recipient resolution.
#[derive(Debug, Clone)]
pub struct ParsedEmail {
    pub from_address: String,
    pub from_name: Option<String>,
    /// To + Cc addresses, lower-cased and deduplicated, in header order.
    pub recipients: Vec<String>,
    pub subject: String,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    /// From the message's own Date header; ingestion substitutes the
    /// current time when absent.
    pub date: Option<DateTime<Utc>>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Parse a raw message byte stream into a [`ParsedEmail`].
pub fn parse_message(raw: &[u8]) -> Result<ParsedEmail> {
    let parsed =
        mailparse::parse_mail(raw).map_err(|error| Error::Parse(error.to_string()))?;
    let headers = parsed.headers.as_slice();

    let from_header = headers.get_first_value("From").unwrap_or_default();
    let (from_address, from_name) = parse_primary_mailbox(&from_header)
        .ok_or_else(|| Error::Parse(format!("missing or unparseable From header '{from_header}'")))?;

    let mut recipients = Vec::new();
    for header in ["To", "Cc"] {
        if let Some(value) = headers.get_first_value(header) {
            collect_addresses(&value, &mut recipients);
        }
    }

    let subject = headers
        .get_first_value("Subject")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

    let date = headers
        .get_first_value("Date")
        .and_then(|value| mailparse::dateparse(&value).ok())
        .and_then(|timestamp| Utc.timestamp_opt(timestamp, 0).single());

    let mut text_parts = Vec::new();
    let mut html_parts = Vec::new();
    let mut attachments = Vec::new();
    collect_parts(&parsed, &mut text_parts, &mut html_parts, &mut attachments);

    Ok(ParsedEmail {
        from_address,
        from_name,
        recipients,
        subject,
        text_body: join_parts(text_parts),
        html_body: join_parts(html_parts),
        date,
        attachments,
    })
}

fn join_parts(parts: Vec<String>) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Extract the first mailbox from an address header value.
fn parse_primary_mailbox(value: &str) -> Option<(String, Option<String>)> {
    let addresses = mailparse::addrparse(value).ok()?.into_inner();
    for address in addresses {
        match address {
            MailAddr::Single(single) => {
                return Some((single.addr, single.display_name));
            }
            MailAddr::Group(group) => {
                if let Some(single) = group.addrs.into_iter().next() {
                    return Some((single.addr, single.display_name));
                }
            }
        }
    }
    None
}

/// Flatten every address in a To/Cc header value, lower-cased, skipping
/// duplicates already collected.
fn collect_addresses(value: &str, recipients: &mut Vec<String>) {
    let Ok(addresses) = mailparse::addrparse(value) else {
        return;
    };

    for address in addresses.into_inner() {
        match address {
            MailAddr::Single(single) => push_recipient(recipients, &single.addr),
            MailAddr::Group(group) => {
                for single in group.addrs {
                    push_recipient(recipients, &single.addr);
                }
            }
        }
    }
}

fn push_recipient(recipients: &mut Vec<String>, address: &str) {
    let normalized = address.trim().to_ascii_lowercase();
    if !normalized.is_empty() && !recipients.contains(&normalized) {
        recipients.push(normalized);
    }
}

fn collect_parts(
    part: &mailparse::ParsedMail<'_>,
    text_parts: &mut Vec<String>,
    html_parts: &mut Vec<String>,
    attachments: &mut Vec<AttachmentInfo>,
) {
    if part.subparts.is_empty() {
        let disposition = part.get_content_disposition();
        let filename = disposition
            .params
            .get("filename")
            .cloned()
            .or_else(|| part.ctype.params.get("name").cloned());
        let is_attachment =
            matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some();

        if is_attachment {
            let size_bytes = part.get_body_raw().map(|body| body.len()).unwrap_or(0);
            attachments.push(AttachmentInfo {
                filename: filename
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_ATTACHMENT_NAME.to_string()),
                content_type: part.ctype.mimetype.clone(),
                size_bytes,
            });
            return;
        }

        let mime_type = part.ctype.mimetype.to_ascii_lowercase();
        if mime_type.starts_with("text/plain") {
            if let Ok(body) = part.get_body() {
                if !body.trim().is_empty() {
                    text_parts.push(body);
                }
            }
        } else if mime_type.starts_with("text/html") {
            if let Ok(body) = part.get_body() {
                if !body.trim().is_empty() {
                    html_parts.push(body);
                }
            }
        }
        return;
    }

    for subpart in &part.subparts {
        collect_parts(subpart, text_parts, html_parts, attachments);
    }
}
