//! In-memory broker transport for tests.
//!
//! Records topology, publishes and close calls, and lets tests inject
//! failures and close notifications.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::amqp::transport::{CloseEvents, Dialer, Publishing, Topology, Transport, TransportError};

#[derive(Default)]
struct State {
    uri: Option<String>,
    topology: Option<Topology>,
    published: Vec<Publishing>,
    close_calls: Vec<&'static str>,
    topology_error: Option<String>,
    channel_close_error: Option<String>,
    events: Option<mpsc::UnboundedSender<Option<TransportError>>>,
}

struct Inner {
    state: Mutex<State>,
    handshake_complete: AtomicBool,
    fail_publishes: AtomicBool,
    connection_closed: AtomicBool,
    publish_delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    published_after_close: AtomicUsize,
}

/// Shared handle to a recording transport. Clones observe the same state.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Create a transport with a complete handshake and no failures.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                handshake_complete: AtomicBool::new(true),
                fail_publishes: AtomicBool::new(false),
                connection_closed: AtomicBool::new(false),
                publish_delay_ms: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                published_after_close: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn dialed_uri(&self) -> Option<String> {
        self.state().uri.clone()
    }

    pub fn topology(&self) -> Option<Topology> {
        self.state().topology.clone()
    }

    pub fn published(&self) -> Vec<Publishing> {
        self.state().published.clone()
    }

    /// Published payloads decoded as UTF-8.
    pub fn payloads(&self) -> Vec<String> {
        self.state()
            .published
            .iter()
            .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
            .collect()
    }

    pub fn close_calls(&self) -> Vec<&'static str> {
        self.state().close_calls.clone()
    }

    pub fn connection_closed(&self) -> bool {
        self.inner.connection_closed.load(Ordering::SeqCst)
    }

    pub fn fail_topology(&self, message: &str) {
        self.state().topology_error = Some(message.to_string());
    }

    pub fn fail_channel_close(&self, message: &str) {
        self.state().channel_close_error = Some(message.to_string());
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Hold each publish for `delay` before recording it.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.inner
            .publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Most publishes ever observed running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }

    /// Publishes that reached the transport after the connection closed.
    pub fn published_after_close(&self) -> usize {
        self.inner.published_after_close.load(Ordering::SeqCst)
    }

    pub fn set_handshake_complete(&self, complete: bool) {
        self.inner.handshake_complete.store(complete, Ordering::SeqCst);
    }

    /// Deliver a close notification, as the broker client would.
    pub fn emit_close(&self, cause: Option<TransportError>) {
        if let Some(events) = &self.state().events {
            let _ = events.send(cause);
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn declare_topology(&self, topology: &Topology) -> Result<(), TransportError> {
        let mut state = self.state();
        if let Some(message) = &state.topology_error {
            return Err(TransportError::new(message.clone()));
        }
        state.topology = Some(topology.clone());
        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> Result<(), TransportError> {
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::new("channel write failed"));
        }
        if self.inner.connection_closed.load(Ordering::SeqCst) {
            self.inner.published_after_close.fetch_add(1, Ordering::SeqCst);
        }

        let running = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = self.inner.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.state().published.push(publishing);
        self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn handshake_complete(&self) -> bool {
        self.inner.handshake_complete.load(Ordering::SeqCst)
    }

    async fn close_channel(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.close_calls.push("channel");
        match &state.channel_close_error {
            Some(message) => Err(TransportError::new(message.clone())),
            None => Ok(()),
        }
    }

    async fn close_connection(&self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.close_calls.push("connection");
        self.inner.connection_closed.store(true, Ordering::SeqCst);
        if let Some(events) = &state.events {
            let _ = events.send(None);
        }
        Ok(())
    }
}

/// Dialer handing out a [`MemoryTransport`], or failing every dial.
pub struct MemoryDialer {
    transport: MemoryTransport,
    error: Option<String>,
}

impl MemoryDialer {
    /// Dialer handing out `transport`.
    pub fn new(transport: MemoryTransport) -> Self {
        Self {
            transport,
            error: None,
        }
    }

    /// Dialer failing every dial with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            transport: MemoryTransport::new(),
            error: Some(message.to_string()),
        }
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, uri: &str) -> Result<(Box<dyn Transport>, CloseEvents), TransportError> {
        if let Some(message) = &self.error {
            return Err(TransportError::new(message.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.transport.state();
            state.uri = Some(uri.to_string());
            state.events = Some(tx);
        }
        Ok((Box::new(self.transport.clone()), rx))
    }
}
