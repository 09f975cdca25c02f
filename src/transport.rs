//! IMAP transport client for the shared retrieval account.
//!
//! Sessions are opened per cycle and closed when the cycle ends; nothing is
//! held between polls. The blocking `imap` crate is used, so callers drive
//! these from `tokio::task::spawn_blocking`.

use crate::config::ImapSettings;
use crate::error::TransportError;
use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs as _};
use std::time::Duration;

/// TCP connect budget; a dead server must not stall the scheduler.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read/write budget for any single IMAP exchange.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(45);

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

/// One raw message pulled from the server, not yet parsed.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub body: Vec<u8>,
}

/// A live, authenticated session against the retrieval account.
#[derive(Debug)]
pub struct MailSession {
    session: ImapSession,
}

impl MailSession {
    /// Open a fresh session: resolve, connect with timeouts, TLS (direct or
    /// STARTTLS upgrade), authenticate.
    pub fn open(settings: &ImapSettings) -> Result<Self, TransportError> {
        let address = (settings.host.as_str(), settings.port)
            .to_socket_addrs()
            .map_err(|error| connect_error(settings, &error.to_string()))?
            .next()
            .ok_or_else(|| connect_error(settings, "no resolvable address"))?;

        let tcp = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT).map_err(|error| {
            if error.kind() == ErrorKind::TimedOut {
                TransportError::Timeout(format!(
                    "connect to {}:{} timed out",
                    settings.host, settings.port
                ))
            } else {
                connect_error(settings, &error.to_string())
            }
        })?;
        tcp.set_read_timeout(Some(SOCKET_TIMEOUT))
            .map_err(|error| connect_error(settings, &error.to_string()))?;
        tcp.set_write_timeout(Some(SOCKET_TIMEOUT))
            .map_err(|error| connect_error(settings, &error.to_string()))?;

        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|error| connect_error(settings, &error.to_string()))?;

        let client = if settings.use_tls {
            let stream = tls
                .connect(settings.host.as_str(), tcp)
                .map_err(|error| connect_error(settings, &error.to_string()))?;
            let mut client = imap::Client::new(stream);
            client.read_greeting().map_err(classify)?;
            client
        } else {
            let mut client = imap::Client::new(tcp);
            client.read_greeting().map_err(classify)?;
            client
                .secure(settings.host.as_str(), &tls)
                .map_err(classify)?
        };

        let session = client
            .login(settings.username.as_str(), settings.password.as_str())
            .map_err(|(error, _client)| TransportError::Auth(error.to_string()))?;

        Ok(Self { session })
    }

    pub fn select_inbox(&mut self) -> Result<(), TransportError> {
        self.session.select("INBOX").map_err(classify)?;
        Ok(())
    }

    /// UIDs of unseen messages in the selected folder, ascending.
    pub fn list_unseen(&mut self) -> Result<Vec<u32>, TransportError> {
        let mut uids: Vec<u32> = self
            .session
            .uid_search("UNSEEN")
            .map_err(classify)?
            .into_iter()
            .collect();
        uids.sort_unstable();
        Ok(uids)
    }

    /// Fetch the full RFC 822 body for one UID. `None` when the server
    /// returned a fetch item without a body.
    pub fn fetch_raw(&mut self, uid: u32) -> Result<Option<RawMessage>, TransportError> {
        let fetches = self
            .session
            .uid_fetch(uid.to_string(), "(UID RFC822)")
            .map_err(classify)?;

        for fetch in fetches.iter() {
            if let Some(body) = fetch.body() {
                return Ok(Some(RawMessage {
                    uid: fetch.uid.unwrap_or(uid),
                    body: body.to_vec(),
                }));
            }
        }

        Ok(None)
    }

    /// Flag the given UIDs as seen in one round trip.
    pub fn mark_seen(&mut self, uids: &[u32]) -> Result<(), TransportError> {
        if uids.is_empty() {
            return Ok(());
        }

        self.session
            .uid_store(uid_sequence(uids), "+FLAGS (\\Seen)")
            .map_err(classify)?;
        Ok(())
    }

    /// Best-effort logout; a failure here is not worth surfacing.
    pub fn logout(mut self) {
        if let Err(error) = self.session.logout() {
            tracing::debug!(%error, "IMAP logout failed");
        }
    }
}

/// Admin-facing connectivity check: open a throwaway session, confirm
/// auth and folder access, close. Shares no state with polling.
pub fn test_connection(settings: &ImapSettings) -> Result<(), TransportError> {
    let mut session = MailSession::open(settings)?;
    session.select_inbox()?;
    session.logout();
    Ok(())
}

fn connect_error(settings: &ImapSettings, message: &str) -> TransportError {
    TransportError::Connect {
        host: settings.host.clone(),
        port: settings.port,
        message: message.to_string(),
    }
}

fn classify(error: imap::Error) -> TransportError {
    match error {
        imap::Error::Io(io_error)
            if matches!(io_error.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) =>
        {
            TransportError::Timeout(io_error.to_string())
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

fn uid_sequence(uids: &[u32]) -> String {
    uids.iter()
        .map(|uid| uid.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uid_sequence_joins_with_commas() {
        assert_eq!(uid_sequence(&[3, 7, 12]), "3,7,12");
        assert_eq!(uid_sequence(&[42]), "42");
    }

    #[test]
    fn io_timeout_classifies_as_timeout() {
        let error = imap::Error::Io(std::io::Error::new(ErrorKind::TimedOut, "read timed out"));
        assert!(matches!(classify(error), TransportError::Timeout(_)));
    }

    #[test]
    fn protocol_errors_keep_server_detail() {
        let error = imap::Error::Io(std::io::Error::new(ErrorKind::BrokenPipe, "pipe"));
        assert!(matches!(classify(error), TransportError::Protocol(_)));
    }

    #[test]
    fn unroutable_host_fails_as_connect_error() {
        let settings = ImapSettings {
            host: "host.invalid".into(),
            port: 993,
            username: "user".into(),
            password: "pass".into(),
            use_tls: true,
            poll_interval_secs: 30,
        };

        let error = MailSession::open(&settings).unwrap_err();
        assert!(matches!(
            error,
            TransportError::Connect { .. } | TransportError::Timeout(_)
        ));
    }
}
