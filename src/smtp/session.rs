//! SMTP dialogue for one client connection.
//!
//! # Responsibilities
//! - Drive the command/reply exchange over any byte stream
//! - Authenticate with AUTH PLAIN or AUTH LOGIN before accepting mail
//! - Enforce recipient, message size and idle limits
//! - Answer `421` and close when shutdown is requested
//!
//! # Design Decisions
//! - Transaction callbacks live behind [`Backend`] and [`Session`]
//! - A message body in flight is read to completion even during shutdown;
//!   cancellation is only observed while waiting for a command

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::config::SmtpConfig;
use crate::smtp::backend::{Backend, Session, SmtpError};
use crate::smtp::protocol::{Command, Reply};

const COMMAND_LINE_LIMIT: u64 = 4096;
const DATA_CHUNK_LIMIT: u64 = 64 * 1024;

/// Base64 of `Username:` and `Password:`.
const USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
const PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

/// Per-connection protocol limits.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub domain: String,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
    pub idle_timeout: Duration,
}

impl From<&SmtpConfig> for SessionSettings {
    fn from(config: &SmtpConfig) -> Self {
        Self {
            domain: config.domain.clone(),
            max_message_bytes: config.max_message_bytes,
            max_recipients: config.max_recipients,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        }
    }
}

impl From<SmtpError> for Reply {
    fn from(e: SmtpError) -> Self {
        Reply::enhanced(e.code, e.enhanced, e.message)
    }
}

/// Serve one client until it quits, disconnects, idles out or `token` fires.
pub async fn serve<S>(
    stream: S,
    backend: &dyn Backend,
    settings: &SessionSettings,
    token: CancellationToken,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conversation = Conversation {
        stream: BufReader::new(stream),
        backend,
        settings,
        token,
        session: None,
        in_transaction: false,
        recipients: 0,
    };
    conversation.run().await
}

enum Flow {
    Continue,
    Close,
}

enum Body {
    Complete(Vec<u8>),
    TooLarge,
}

struct Conversation<'a, S> {
    stream: BufReader<S>,
    backend: &'a dyn Backend,
    settings: &'a SessionSettings,
    token: CancellationToken,
    session: Option<Box<dyn Session>>,
    in_transaction: bool,
    recipients: usize,
}

impl<S> Conversation<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run(&mut self) -> io::Result<()> {
        let greeting = format!("{} ESMTP ready", self.settings.domain);
        self.reply(Reply::new(220, greeting)).await?;

        loop {
            let Some(line) = self.next_line(COMMAND_LINE_LIMIT, true).await? else {
                return Ok(());
            };
            if !line.ends_with(b"\n") && line.len() as u64 >= COMMAND_LINE_LIMIT {
                self.reply(Reply::enhanced(500, "5.5.6", "line too long"))
                    .await?;
                return Ok(());
            }

            let command = Command::parse(&String::from_utf8_lossy(&line));
            if let Flow::Close = self.handle(command).await? {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: Command) -> io::Result<Flow> {
        let reply = match command {
            Command::Helo(_) => {
                self.reset_transaction();
                Reply::new(250, self.settings.domain.clone())
            }
            Command::Ehlo(client) => {
                self.reset_transaction();
                Reply::multiline(
                    250,
                    vec![
                        format!("{} Hello {}", self.settings.domain, client),
                        "AUTH PLAIN LOGIN".to_string(),
                        format!("SIZE {}", self.settings.max_message_bytes),
                        "8BITMIME".to_string(),
                    ],
                )
            }
            Command::Auth { mechanism, initial } => {
                match self.authenticate(&mechanism, initial).await? {
                    Some(reply) => reply,
                    None => return Ok(Flow::Close),
                }
            }
            Command::Mail(from) => self.mail(&from),
            Command::Rcpt(to) => self.rcpt(&to),
            Command::Data => return self.data().await,
            Command::Rset => {
                self.reset_transaction();
                Reply::enhanced(250, "2.0.0", "OK")
            }
            Command::Noop => Reply::enhanced(250, "2.0.0", "OK"),
            Command::Vrfy => {
                Reply::enhanced(252, "2.5.0", "cannot VRFY user, but will accept message")
            }
            Command::Quit => {
                self.reply(Reply::enhanced(221, "2.0.0", "bye")).await?;
                return Ok(Flow::Close);
            }
            Command::Invalid(reason) => Reply::enhanced(501, "5.5.4", reason),
            Command::Unknown(verb) => {
                tracing::debug!(verb = %verb, "Unrecognized command");
                Reply::enhanced(500, "5.5.2", "command not recognized")
            }
        };

        self.reply(reply).await?;
        Ok(Flow::Continue)
    }

    /// Returns `None` when the connection ended mid-exchange.
    async fn authenticate(
        &mut self,
        mechanism: &str,
        initial: Option<String>,
    ) -> io::Result<Option<Reply>> {
        if self.session.is_some() {
            return Ok(Some(Reply::enhanced(503, "5.5.1", "already authenticated")));
        }

        let credentials = match mechanism {
            "PLAIN" => {
                let response = match initial {
                    Some(response) => response,
                    None => match self.prompt("").await? {
                        Some(response) => response,
                        None => return Ok(None),
                    },
                };
                decode_plain(&response)
            }
            "LOGIN" => {
                let username = match initial {
                    Some(username) => username,
                    None => match self.prompt(USERNAME_CHALLENGE).await? {
                        Some(username) => username,
                        None => return Ok(None),
                    },
                };
                let username = match decode_base64(&username) {
                    Ok(username) => username,
                    Err(reply) => return Ok(Some(reply)),
                };
                match self.prompt(PASSWORD_CHALLENGE).await? {
                    Some(password) => decode_base64(&password).map(|p| (username, p)),
                    None => return Ok(None),
                }
            }
            _ => {
                return Ok(Some(Reply::enhanced(
                    504,
                    "5.5.4",
                    "unrecognized authentication mechanism",
                )))
            }
        };

        let (username, password) = match credentials {
            Ok(credentials) => credentials,
            Err(reply) => return Ok(Some(reply)),
        };

        Ok(Some(match self.backend.login(&username, &password) {
            Ok(session) => {
                self.session = Some(session);
                Reply::enhanced(235, "2.7.0", "authentication succeeded")
            }
            Err(e) => e.into(),
        }))
    }

    fn mail(&mut self, from: &str) -> Reply {
        let Some(session) = self.session.as_mut() else {
            return auth_required();
        };
        if self.in_transaction {
            return Reply::enhanced(503, "5.5.1", "nested MAIL command");
        }

        match session.mail(from) {
            Ok(()) => {
                self.in_transaction = true;
                self.recipients = 0;
                Reply::enhanced(250, "2.1.0", "sender OK")
            }
            Err(e) => e.into(),
        }
    }

    fn rcpt(&mut self, to: &str) -> Reply {
        let Some(session) = self.session.as_mut() else {
            return auth_required();
        };
        if !self.in_transaction {
            return Reply::enhanced(503, "5.5.1", "need MAIL command");
        }
        if self.recipients >= self.settings.max_recipients {
            return Reply::enhanced(452, "4.5.3", "too many recipients");
        }

        match session.rcpt(to) {
            Ok(()) => {
                self.recipients += 1;
                Reply::enhanced(250, "2.1.5", "recipient OK")
            }
            Err(e) => e.into(),
        }
    }

    async fn data(&mut self) -> io::Result<Flow> {
        let reply = if self.session.is_none() {
            Some(auth_required())
        } else if !self.in_transaction {
            Some(Reply::enhanced(503, "5.5.1", "need MAIL command"))
        } else if self.recipients == 0 {
            Some(Reply::enhanced(503, "5.5.1", "need RCPT command"))
        } else {
            None
        };
        if let Some(reply) = reply {
            self.reply(reply).await?;
            return Ok(Flow::Continue);
        }

        self.reply(Reply::new(354, "start mail input; end with <CRLF>.<CRLF>"))
            .await?;
        let Some(body) = self.read_body().await? else {
            return Ok(Flow::Close);
        };

        let reply = match body {
            Body::TooLarge => Reply::enhanced(552, "5.3.4", "message exceeds fixed maximum message size"),
            Body::Complete(bytes) => match self.session.as_mut() {
                Some(session) => match session.data(bytes).await {
                    Ok(()) => Reply::enhanced(250, "2.0.0", "message queued"),
                    Err(e) => e.into(),
                },
                None => auth_required(),
            },
        };
        self.reset_transaction();
        self.reply(reply).await?;
        Ok(Flow::Continue)
    }

    /// Read the dot-terminated body, undoing dot-stuffing. The CRLF before
    /// the terminating dot is not part of the message.
    async fn read_body(&mut self) -> io::Result<Option<Body>> {
        let limit = self.settings.max_message_bytes;
        let mut body = Vec::new();
        let mut oversized = false;
        let mut line_start = true;

        loop {
            let Some(mut chunk) = self.next_line(DATA_CHUNK_LIMIT, false).await? else {
                return Ok(None);
            };
            if line_start && (chunk == b".\r\n" || chunk == b".\n") {
                break;
            }
            if line_start && chunk.first() == Some(&b'.') {
                chunk.remove(0);
            }
            line_start = chunk.ends_with(b"\n");

            if !oversized {
                body.extend_from_slice(&chunk);
                // Allow for the trailing CRLF stripped below.
                if body.len() > limit + 2 {
                    oversized = true;
                    body = Vec::new();
                }
            }
        }

        if body.ends_with(b"\r\n") {
            body.truncate(body.len() - 2);
        } else if body.ends_with(b"\n") {
            body.truncate(body.len() - 1);
        }

        if oversized || body.len() > limit {
            tracing::warn!(limit = limit, "Message rejected, too large");
            return Ok(Some(Body::TooLarge));
        }
        Ok(Some(Body::Complete(body)))
    }

    /// Send a `334` challenge and return the decoded-as-text response line.
    async fn prompt(&mut self, challenge: &str) -> io::Result<Option<String>> {
        self.reply(Reply::new(334, challenge)).await?;
        Ok(self
            .next_line(COMMAND_LINE_LIMIT, true)
            .await?
            .map(|line| {
                String::from_utf8_lossy(&line)
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            }))
    }

    /// Read up to `limit` bytes through the next newline.
    ///
    /// Returns `None` on EOF, idle timeout or (when `cancellable`) shutdown;
    /// the latter two are answered with `421` first.
    async fn next_line(&mut self, limit: u64, cancellable: bool) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let token = self.token.clone();
        let cancelled = async move {
            if cancellable {
                token.cancelled().await
            } else {
                std::future::pending().await
            }
        };

        let mut limited = (&mut self.stream).take(limit);
        let read = limited.read_until(b'\n', &mut line);

        let outcome = tokio::select! {
            _ = cancelled => None,
            result = tokio::time::timeout(self.settings.idle_timeout, read) => Some(result),
        };

        match outcome {
            Some(Ok(Ok(0))) => Ok(None),
            Some(Ok(Ok(_))) => Ok(Some(line)),
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_elapsed)) => {
                tracing::info!("Session idle, closing");
                let text = format!("{} idle timeout, closing connection", self.settings.domain);
                self.reply(Reply::enhanced(421, "4.4.2", text)).await?;
                Ok(None)
            }
            None => {
                let text = format!("{} service shutting down", self.settings.domain);
                self.reply(Reply::enhanced(421, "4.3.2", text)).await?;
                Ok(None)
            }
        }
    }

    async fn reply(&mut self, reply: Reply) -> io::Result<()> {
        let stream = self.stream.get_mut();
        stream.write_all(reply.to_string().as_bytes()).await?;
        stream.flush().await
    }

    fn reset_transaction(&mut self) {
        self.in_transaction = false;
        self.recipients = 0;
        if let Some(session) = self.session.as_mut() {
            session.reset();
        }
    }
}

fn auth_required() -> Reply {
    Reply::enhanced(530, "5.7.0", "authentication required")
}

fn decode_base64(input: &str) -> Result<String, Reply> {
    if input == "*" {
        return Err(Reply::enhanced(501, "5.0.0", "authentication cancelled"));
    }
    let invalid = || Reply::enhanced(501, "5.5.2", "invalid base64 data");
    let bytes = STANDARD.decode(input.trim()).map_err(|_| invalid())?;
    String::from_utf8(bytes).map_err(|_| invalid())
}

/// `[authzid] NUL authcid NUL passwd`
fn decode_plain(response: &str) -> Result<(String, String), Reply> {
    let decoded = decode_base64(response)?;
    let mut parts = decoded.split('\0');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_authzid), Some(username), Some(password), None) => {
            Ok((username.to_string(), password.to_string()))
        }
        _ => Err(Reply::enhanced(501, "5.5.2", "malformed PLAIN response")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::{Envelope, PublishError, Publisher};
    use crate::smtp::backend::QueueBackend;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    #[derive(Default)]
    struct Collector {
        sent: Mutex<Vec<Envelope>>,
        fail: bool,
    }

    #[async_trait]
    impl Publisher for Collector {
        async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::ConnectionClosed);
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    struct Client {
        stream: BufReader<DuplexStream>,
        server: JoinHandle<io::Result<()>>,
        token: CancellationToken,
    }

    impl Client {
        async fn send(&mut self, line: &str) {
            let stream = self.stream.get_mut();
            stream.write_all(line.as_bytes()).await.unwrap();
            stream.write_all(b"\r\n").await.unwrap();
        }

        /// Read one full (possibly multiline) reply.
        async fn reply(&mut self) -> String {
            let mut text = String::new();
            loop {
                let mut line = String::new();
                self.stream.read_line(&mut line).await.unwrap();
                assert!(line.len() >= 4, "short reply line: {line:?}");
                text.push_str(&line);
                if line.as_bytes()[3] == b' ' {
                    return text;
                }
            }
        }

        async fn code(&mut self) -> u16 {
            self.reply().await[..3].parse().unwrap()
        }

        async fn command(&mut self, line: &str) -> u16 {
            self.send(line).await;
            self.code().await
        }

        async fn login(&mut self) {
            assert_eq!(self.command("EHLO client").await, 250);
            // "\0user\0secret"
            assert_eq!(self.command("AUTH PLAIN AHVzZXIAc2VjcmV0").await, 235);
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            domain: "mx.test".into(),
            max_message_bytes: 64,
            max_recipients: 2,
            idle_timeout: Duration::from_secs(5),
        }
    }

    async fn connect_with(publisher: Arc<Collector>, settings: SessionSettings) -> Client {
        let (client, server) = tokio::io::duplex(8 * 1024);
        let token = CancellationToken::new();
        let backend = QueueBackend::new(publisher, "user", "secret");
        let server_token = token.clone();
        let server = tokio::spawn(async move {
            serve(server, &backend, &settings, server_token).await
        });

        let mut client = Client {
            stream: BufReader::new(client),
            server,
            token,
        };
        assert_eq!(client.code().await, 220);
        client
    }

    async fn connect(publisher: Arc<Collector>) -> Client {
        connect_with(publisher, settings()).await
    }

    #[tokio::test]
    async fn ehlo_advertises_extensions() {
        let mut client = connect(Arc::default()).await;
        client.send("EHLO client").await;
        let reply = client.reply().await;
        assert!(reply.starts_with("250-mx.test Hello client\r\n"));
        assert!(reply.contains("250-AUTH PLAIN LOGIN\r\n"));
        assert!(reply.contains("250-SIZE 64\r\n"));
        assert!(reply.ends_with("250 8BITMIME\r\n"));
    }

    #[tokio::test]
    async fn submission_publishes_per_recipient() {
        let publisher = Arc::new(Collector::default());
        let mut client = connect(publisher.clone()).await;
        client.login().await;

        assert_eq!(client.command("MAIL FROM:<a@x>").await, 250);
        assert_eq!(client.command("RCPT TO:<b@y>").await, 250);
        assert_eq!(client.command("RCPT TO:<c@z>").await, 250);
        assert_eq!(client.command("DATA").await, 354);
        client.send("hi").await;
        assert_eq!(client.command(".").await, 250);
        assert_eq!(client.command("QUIT").await, 221);
        client.server.await.unwrap().unwrap();

        let sent = publisher.sent.lock().unwrap();
        let wire: Vec<String> = sent
            .iter()
            .map(|e| String::from_utf8(e.to_wire().unwrap()).unwrap())
            .collect();
        assert_eq!(
            wire,
            vec![
                r#"{"envelope":"a@x","recipient":"b@y","body":"hi"}"#,
                r#"{"envelope":"a@x","recipient":"c@z","body":"hi"}"#,
            ]
        );
    }

    #[tokio::test]
    async fn auth_login_exchange() {
        let mut client = connect(Arc::default()).await;
        client.send("AUTH LOGIN").await;
        assert_eq!(client.reply().await, "334 VXNlcm5hbWU6\r\n");
        client.send("dXNlcg==").await;
        assert_eq!(client.reply().await, "334 UGFzc3dvcmQ6\r\n");
        assert_eq!(client.command("c2VjcmV0").await, 235);
        assert_eq!(client.command("AUTH LOGIN").await, 503);
    }

    #[tokio::test]
    async fn auth_plain_with_continuation() {
        let mut client = connect(Arc::default()).await;
        assert_eq!(client.command("AUTH PLAIN").await, 334);
        assert_eq!(client.command("AHVzZXIAc2VjcmV0").await, 235);
    }

    #[tokio::test]
    async fn bad_credentials_get_535_and_no_session() {
        let mut client = connect(Arc::default()).await;
        // "\0user\0nope"
        assert_eq!(client.command("AUTH PLAIN AHVzZXIAbm9wZQ==").await, 535);
        assert_eq!(client.command("MAIL FROM:<a@x>").await, 530);
    }

    #[tokio::test]
    async fn auth_errors() {
        let mut client = connect(Arc::default()).await;
        assert_eq!(client.command("AUTH CRAM-MD5").await, 504);
        assert_eq!(client.command("AUTH PLAIN !!!").await, 501);
        assert_eq!(client.command("AUTH PLAIN").await, 334);
        assert_eq!(client.command("*").await, 501);
    }

    #[tokio::test]
    async fn mail_commands_require_authentication() {
        let mut client = connect(Arc::default()).await;
        assert_eq!(client.command("MAIL FROM:<a@x>").await, 530);
        assert_eq!(client.command("RCPT TO:<b@y>").await, 530);
        assert_eq!(client.command("DATA").await, 530);
    }

    #[tokio::test]
    async fn sequence_errors() {
        let mut client = connect(Arc::default()).await;
        client.login().await;
        assert_eq!(client.command("RCPT TO:<b@y>").await, 503);
        assert_eq!(client.command("DATA").await, 503);
        assert_eq!(client.command("MAIL FROM:<a@x>").await, 250);
        assert_eq!(client.command("MAIL FROM:<a@x>").await, 503);
        assert_eq!(client.command("DATA").await, 503);
        assert_eq!(client.command("RSET").await, 250);
        assert_eq!(client.command("MAIL FROM:<a@x>").await, 250);
    }

    #[tokio::test]
    async fn recipient_limit() {
        let mut client = connect(Arc::default()).await;
        client.login().await;
        assert_eq!(client.command("MAIL FROM:<a@x>").await, 250);
        assert_eq!(client.command("RCPT TO:<1@y>").await, 250);
        assert_eq!(client.command("RCPT TO:<2@y>").await, 250);
        assert_eq!(client.command("RCPT TO:<3@y>").await, 452);
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let publisher = Arc::new(Collector::default());
        let mut client = connect(publisher.clone()).await;
        client.login().await;
        client.command("MAIL FROM:<a@x>").await;
        client.command("RCPT TO:<b@y>").await;
        assert_eq!(client.command("DATA").await, 354);
        for _ in 0..4 {
            client.send(&"x".repeat(30)).await;
        }
        assert_eq!(client.command(".").await, 552);
        assert!(publisher.sent.lock().unwrap().is_empty());

        // The session stays usable.
        assert_eq!(client.command("NOOP").await, 250);
    }

    #[tokio::test]
    async fn dot_stuffing_is_undone() {
        let publisher = Arc::new(Collector::default());
        let mut client = connect(publisher.clone()).await;
        client.login().await;
        client.command("MAIL FROM:<a@x>").await;
        client.command("RCPT TO:<b@y>").await;
        client.command("DATA").await;
        client.send("line one").await;
        client.send("..leading dot").await;
        assert_eq!(client.command(".").await, 250);

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent[0].body(), b"line one\r\n.leading dot");
    }

    #[tokio::test]
    async fn publish_failure_is_transient() {
        let publisher = Arc::new(Collector {
            fail: true,
            ..Default::default()
        });
        let mut client = connect(publisher).await;
        client.login().await;
        client.command("MAIL FROM:<a@x>").await;
        client.command("RCPT TO:<b@y>").await;
        client.command("DATA").await;
        client.send("hi").await;
        client.send(".").await;
        assert!(client.reply().await.starts_with("451 4.3.0 "));
    }

    #[tokio::test]
    async fn misc_commands() {
        let mut client = connect(Arc::default()).await;
        assert_eq!(client.command("NOOP").await, 250);
        assert_eq!(client.command("VRFY someone").await, 252);
        assert_eq!(client.command("HELO client").await, 250);
        assert_eq!(client.command("STARTTLS").await, 500);
        assert_eq!(client.command("MAIL").await, 501);
    }

    #[tokio::test]
    async fn cancellation_answers_421_and_closes() {
        let mut client = connect(Arc::default()).await;
        client.token.cancel();
        assert!(client.reply().await.starts_with("421 4.3.2 "));
        client.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn idle_client_is_disconnected() {
        let mut client = connect_with(
            Arc::default(),
            SessionSettings {
                idle_timeout: Duration::from_millis(50),
                ..settings()
            },
        )
        .await;
        assert!(client.reply().await.starts_with("421 4.4.2 "));
        client.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn client_disconnect_ends_session() {
        let client = connect(Arc::default()).await;
        let Client { stream, server, .. } = client;
        drop(stream);
        server.await.unwrap().unwrap();
    }
}
