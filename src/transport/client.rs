//! Connection lifecycle for one persistent device link.
//!
//! A `ConnectionClient` owns at most one live link and one receive worker.
//! State transitions happen under the client lock; the worker only touches
//! state while its generation is current, so a superseded worker can never
//! flip a newer connection back to `Disconnected`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Error;

use crate::transport::link::{Connector, Incoming, Link};

pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Lifecycle callbacks, invoked one at a time from the receive worker.
///
/// `on_open` precedes every message of a connection and `on_close` follows
/// the last one.
pub trait ConnectionHandler: Send + Sync {
    fn on_open(&self, _client: &ConnectionClient) {}
    fn on_binary(&self, _client: &ConnectionClient, _data: Vec<u8>) {}
    fn on_text(&self, _client: &ConnectionClient, _text: &str) {}
    fn on_error(&self, _client: &ConnectionClient, _error: &Error) {}
    fn on_close(&self, _client: &ConnectionClient, _code: Option<u16>, _reason: &str) {}
}

/// Handler that ignores every event.
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

type SharedLink = Arc<Mutex<Box<dyn Link>>>;

struct Worker {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

struct Inner {
    state: ConnectionState,
    link: Option<SharedLink>,
    worker: Option<Worker>,
    generation: u64,
}

struct Shared {
    url: String,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn ConnectionHandler>,
    join_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Cloneable handle to one connection.
#[derive(Clone)]
pub struct ConnectionClient {
    shared: Arc<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Join `handle`, giving up after `timeout`. Returns whether the thread
/// finished in time; an abandoned thread keeps running detached.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    if handle.join().is_err() {
        log::error!("worker thread panicked");
    }
    true
}

impl ConnectionClient {
    pub fn new(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self::with_join_timeout(url, connector, handler, DEFAULT_JOIN_TIMEOUT)
    }

    pub fn with_join_timeout(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn ConnectionHandler>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                connector,
                handler,
                join_timeout,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Disconnected,
                    link: None,
                    worker: None,
                    generation: 0,
                }),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Start a connection attempt unless one is live or in progress.
    pub fn connect(&self) {
        let (stale, generation, stop) = {
            let mut inner = lock(&self.shared.inner);
            if matches!(
                inner.state,
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                log::debug!("connect ignored: already {}", inner.state);
                return;
            }
            let stale = (inner.worker.take(), inner.link.take());
            inner.state = ConnectionState::Connecting;
            inner.generation += 1;
            let stop = Arc::new(AtomicBool::new(false));
            inner.worker = Some(Worker {
                stop: stop.clone(),
                join: None,
            });
            (stale, inner.generation, stop)
        };

        if let (Some(worker), link) = stale {
            log::info!("tearing down stale connection worker");
            self.teardown(worker, link);
        }

        log::info!("connecting to {}", self.shared.url);
        let client = self.clone();
        let worker_stop = stop.clone();
        let join = std::thread::spawn(move || client.run_worker(generation, worker_stop));

        let mut inner = lock(&self.shared.inner);
        match inner.worker.as_mut() {
            Some(worker) if Arc::ptr_eq(&worker.stop, &stop) => worker.join = Some(join),
            // Closed before the worker was registered; it sees its stop flag.
            _ => drop(join),
        }
    }

    /// Send a text command. Dropped with a warning unless connected and
    /// writable.
    pub fn send(&self, text: &str) -> bool {
        let mut inner = lock(&self.shared.inner);
        if inner.state != ConnectionState::Connected {
            log::warn!("dropping '{}': connection is {}", text, inner.state);
            return false;
        }
        let Some(link) = inner.link.clone() else {
            log::warn!("dropping '{}': no open link", text);
            return false;
        };
        let mut link = lock(&link);
        if !link.is_writable() {
            log::warn!("dropping '{}': link is not writable", text);
            return false;
        }
        match link.send_text(text) {
            Ok(()) => {
                log::debug!("sent '{}'", text);
                true
            }
            Err(e) => {
                log::warn!("send of '{}' failed: {:#}", text, e);
                drop(link);
                inner.state = ConnectionState::Disconnected;
                false
            }
        }
    }

    /// Close the connection and stop the worker. Idempotent.
    pub fn close(&self) {
        let (worker, link, generation) = {
            let mut inner = lock(&self.shared.inner);
            if inner.worker.is_none() && inner.link.is_none() {
                inner.state = ConnectionState::Disconnected;
                return;
            }
            inner.state = ConnectionState::Closing;
            inner.generation += 1;
            (inner.worker.take(), inner.link.take(), inner.generation)
        };

        log::info!("closing connection to {}", self.shared.url);
        match worker {
            Some(worker) => self.teardown(worker, link),
            None => {
                if let Some(link) = link {
                    lock(&link).close();
                }
            }
        }

        let mut inner = lock(&self.shared.inner);
        if inner.generation == generation {
            inner.state = ConnectionState::Disconnected;
        }
    }

    fn teardown(&self, worker: Worker, link: Option<SharedLink>) {
        worker.stop.store(true, Ordering::SeqCst);
        if let Some(link) = link {
            lock(&link).close();
        }
        if let Some(join) = worker.join {
            if !join_with_timeout(join, self.shared.join_timeout) {
                log::warn!(
                    "connection worker did not stop within {:?}; abandoning it",
                    self.shared.join_timeout
                );
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        lock(&self.shared.inner).generation == generation
    }

    fn run_worker(&self, generation: u64, stop: Arc<AtomicBool>) {
        let handler = self.shared.handler.clone();
        let link = match self.shared.connector.connect(&self.shared.url) {
            Ok(link) => Arc::new(Mutex::new(link)),
            Err(e) => {
                log::warn!("connection to {} failed: {:#}", self.shared.url, e);
                self.mark_disconnected(generation);
                handler.on_error(self, &e);
                handler.on_close(self, None, "connect failed");
                return;
            }
        };

        {
            let mut inner = lock(&self.shared.inner);
            if inner.generation != generation || stop.load(Ordering::SeqCst) {
                drop(inner);
                lock(&link).close();
                log::debug!("discarding link opened by a superseded worker");
                return;
            }
            inner.link = Some(link.clone());
            inner.state = ConnectionState::Connected;
        }
        log::info!("connected to {}", self.shared.url);
        handler.on_open(self);

        let (code, reason) = loop {
            if stop.load(Ordering::SeqCst) {
                break (None, "closed locally".to_string());
            }
            let received = lock(&link).recv();
            match received {
                Ok(None) => continue,
                Ok(Some(Incoming::Binary(data))) => handler.on_binary(self, data),
                Ok(Some(Incoming::Text(text))) => handler.on_text(self, &text),
                Ok(Some(Incoming::Closed { code, reason })) => {
                    if !stop.load(Ordering::SeqCst) {
                        log::warn!(
                            "connection closed by peer (code {:?}): {}",
                            code,
                            reason
                        );
                    }
                    break (code, reason);
                }
                Err(e) => {
                    if stop.load(Ordering::SeqCst) {
                        break (None, "closed locally".to_string());
                    }
                    log::warn!("connection error: {:#}", e);
                    handler.on_error(self, &e);
                    break (None, e.to_string());
                }
            }
        };

        lock(&link).close();
        if self.is_current(generation) {
            self.mark_disconnected(generation);
        }
        handler.on_close(self, code, &reason);
    }

    fn mark_disconnected(&self, generation: u64) {
        let mut inner = lock(&self.shared.inner);
        if inner.generation == generation {
            inner.state = ConnectionState::Disconnected;
            inner.link = None;
        }
    }
}

/// Once-initialized holder for the coordinator's connection client.
#[derive(Default)]
pub struct ClientCell {
    cell: OnceLock<ConnectionClient>,
}

impl ClientCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the client, creating it on first use. A later request for a
    /// different endpoint keeps the existing client.
    pub fn get_or_init(
        &self,
        url: &str,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ConnectionClient {
        let client = self
            .cell
            .get_or_init(|| ConnectionClient::new(url, connector, handler));
        if client.url() != url {
            log::warn!(
                "connection client already bound to {}; ignoring request for {}",
                client.url(),
                url
            );
        }
        client.clone()
    }

    pub fn get(&self) -> Option<&ConnectionClient> {
        self.cell.get()
    }
}
