//! Session callbacks connecting the protocol engine to the queue.
//!
//! # Responsibilities
//! - Authenticate clients against the configured credentials
//! - Collect the sender and recipients of the current transaction
//! - Publish one envelope per recipient when the body arrives
//!
//! # Design Decisions
//! - A successful login is the only way to obtain a [`Session`]
//! - Publishing stops at the first failure; earlier recipients stay published

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::amqp::{Envelope, Publisher};
use crate::observability::metrics;

/// A negative protocol reply raised by a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpError {
    pub code: u16,
    pub enhanced: &'static str,
    pub message: String,
}

impl SmtpError {
    /// Build a reply-worthy error.
    pub fn new(code: u16, enhanced: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            enhanced,
            message: message.into(),
        }
    }

    /// `535 5.7.8`: login or password mismatch.
    pub fn invalid_credentials() -> Self {
        Self::new(535, "5.7.8", "authentication credentials invalid")
    }

    /// `451 4.3.0`: the broker did not take the message.
    pub fn publish_failed(reason: impl fmt::Display) -> Self {
        Self::new(451, "4.3.0", format!("message not queued: {}", reason))
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.code, self.enhanced, self.message)
    }
}

impl std::error::Error for SmtpError {}

/// Creates sessions for authenticated clients.
pub trait Backend: Send + Sync {
    fn login(&self, username: &str, password: &str) -> Result<Box<dyn Session>, SmtpError>;
}

/// Per-client transaction state.
#[async_trait]
pub trait Session: Send {
    /// Start a new transaction from `from`, discarding any pending one.
    fn mail(&mut self, from: &str) -> Result<(), SmtpError>;

    fn rcpt(&mut self, to: &str) -> Result<(), SmtpError>;

    /// Deliver the message body to every pending recipient.
    async fn data(&mut self, body: Vec<u8>) -> Result<(), SmtpError>;

    fn reset(&mut self);
}

/// Backend that republishes accepted mail to the queue.
pub struct QueueBackend {
    publisher: Arc<dyn Publisher>,
    username: String,
    password: String,
}

impl QueueBackend {
    /// Accept `login`/`password` and publish through `publisher`.
    pub fn new(
        publisher: Arc<dyn Publisher>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Backend for QueueBackend {
    fn login(&self, username: &str, password: &str) -> Result<Box<dyn Session>, SmtpError> {
        if username != self.username || password != self.password {
            tracing::warn!(username = %username, "Authentication failed");
            return Err(SmtpError::invalid_credentials());
        }

        tracing::debug!(username = %username, "Authenticated");
        Ok(Box::new(QueueSession {
            publisher: Arc::clone(&self.publisher),
            from: String::new(),
            to: Vec::new(),
        }))
    }
}

/// Session state for one authenticated client.
pub struct QueueSession {
    publisher: Arc<dyn Publisher>,
    from: String,
    to: Vec<String>,
}

#[async_trait]
impl Session for QueueSession {
    fn mail(&mut self, from: &str) -> Result<(), SmtpError> {
        self.reset();
        self.from = from.to_string();
        Ok(())
    }

    fn rcpt(&mut self, to: &str) -> Result<(), SmtpError> {
        self.to.push(to.to_string());
        Ok(())
    }

    async fn data(&mut self, body: Vec<u8>) -> Result<(), SmtpError> {
        metrics::record_message_received();

        for recipient in &self.to {
            let envelope = Envelope::new(self.from.clone(), recipient.clone(), body.clone());
            if let Err(e) = self.publisher.publish(&envelope).await {
                tracing::error!(recipient = %recipient, error = %e, "Failed to queue message");
                return Err(SmtpError::publish_failed(e));
            }
            tracing::info!(from = %self.from, recipient = %recipient, "Message queued");
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.from.clear();
        self.to.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::PublishError;
    use std::sync::Mutex;

    /// Records envelopes; fails every publish from the `fail_from`th on.
    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<Envelope>>,
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_from.is_some_and(|n| sent.len() >= n) {
                return Err(PublishError::ConnectionClosed);
            }
            sent.push(envelope.clone());
            Ok(())
        }
    }

    fn backend(publisher: Arc<RecordingPublisher>) -> QueueBackend {
        QueueBackend::new(publisher, "user", "secret")
    }

    #[test]
    fn valid_credentials_open_a_session() {
        let backend = backend(Arc::default());
        assert!(backend.login("user", "secret").is_ok());
    }

    #[test]
    fn invalid_credentials_are_rejected() {
        let backend = backend(Arc::default());
        for (user, pass) in [("user", "wrong"), ("other", "secret"), ("", "")] {
            let err = backend.login(user, pass).err().unwrap();
            assert_eq!(err.code, 535);
        }
    }

    #[tokio::test]
    async fn data_publishes_one_envelope_per_recipient_in_order() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut session = backend(publisher.clone()).login("user", "secret").unwrap();

        session.mail("a@x").unwrap();
        session.rcpt("b@y").unwrap();
        session.rcpt("c@z").unwrap();
        session.data(b"hi".to_vec()).await.unwrap();

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(
            *sent,
            vec![
                Envelope::new("a@x", "b@y", b"hi".to_vec()),
                Envelope::new("a@x", "c@z", b"hi".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn publish_failure_stops_at_first_error() {
        let publisher = Arc::new(RecordingPublisher {
            fail_from: Some(1),
            ..Default::default()
        });
        let mut session = backend(publisher.clone()).login("user", "secret").unwrap();

        session.mail("a@x").unwrap();
        for rcpt in ["r1@y", "r2@y", "r3@y"] {
            session.rcpt(rcpt).unwrap();
        }
        let err = session.data(b"body".to_vec()).await.unwrap_err();

        assert_eq!((err.code, err.enhanced), (451, "4.3.0"));
        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient(), "r1@y");
    }

    #[tokio::test]
    async fn mail_discards_the_previous_transaction() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut session = backend(publisher.clone()).login("user", "secret").unwrap();

        session.mail("old@x").unwrap();
        session.rcpt("stale@y").unwrap();
        session.mail("new@x").unwrap();
        session.rcpt("fresh@y").unwrap();
        session.data(b"m".to_vec()).await.unwrap();

        let sent = publisher.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sender(), "new@x");
        assert_eq!(sent[0].recipient(), "fresh@y");
    }
}
