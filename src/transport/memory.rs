//! In-process transport used by tests and demos.
//!
//! `MemoryConnector` hands out links backed by channels. The paired
//! `MemoryPeer` plays the device: it pushes frames and notifications into the
//! current link, drops connections, and records every text the client sent.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::transport::link::{Connector, Incoming, Link};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct PeerState {
    inbound: Option<Sender<Incoming>>,
    sent: Vec<String>,
    connects: usize,
    refuse: bool,
    writable: bool,
    fail_sends: bool,
}

#[derive(Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<PeerState>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PeerState {
                writable: true,
                ..PeerState::default()
            })),
        }
    }

    pub fn peer(&self) -> MemoryPeer {
        MemoryPeer {
            state: self.state.clone(),
        }
    }
}

fn lock(state: &Mutex<PeerState>) -> MutexGuard<'_, PeerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connector for MemoryConnector {
    fn connect(&self, url: &str) -> Result<Box<dyn Link>> {
        let mut state = lock(&self.state);
        state.connects += 1;
        if state.refuse {
            return Err(anyhow!("connection to {} refused", url));
        }
        let (tx, rx) = mpsc::channel();
        // Replacing the sender disconnects any previous link.
        state.inbound = Some(tx);
        Ok(Box::new(MemoryLink {
            state: self.state.clone(),
            inbound: rx,
            closed: false,
        }))
    }
}

struct MemoryLink {
    state: Arc<Mutex<PeerState>>,
    inbound: Receiver<Incoming>,
    closed: bool,
}

impl Link for MemoryLink {
    fn recv(&mut self) -> Result<Option<Incoming>> {
        if self.closed {
            return Ok(Some(Incoming::Closed {
                code: None,
                reason: "closed locally".into(),
            }));
        }
        match self.inbound.recv_timeout(POLL_INTERVAL) {
            Ok(Incoming::Closed { code, reason }) => {
                self.closed = true;
                Ok(Some(Incoming::Closed { code, reason }))
            }
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                self.closed = true;
                Err(anyhow!("memory peer went away"))
            }
        }
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        if self.closed {
            return Err(anyhow!("link closed"));
        }
        let mut state = lock(&self.state);
        if state.fail_sends {
            return Err(anyhow!("simulated write failure"));
        }
        state.sent.push(text.to_string());
        Ok(())
    }

    fn is_writable(&self) -> bool {
        !self.closed && lock(&self.state).writable
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Device side of a `MemoryConnector`.
#[derive(Clone)]
pub struct MemoryPeer {
    state: Arc<Mutex<PeerState>>,
}

impl MemoryPeer {
    fn push(&self, message: Incoming) -> bool {
        let state = lock(&self.state);
        match &state.inbound {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Deliver a binary frame to the current link.
    pub fn push_binary(&self, data: Vec<u8>) -> bool {
        self.push(Incoming::Binary(data))
    }

    pub fn push_text(&self, text: &str) -> bool {
        self.push(Incoming::Text(text.to_string()))
    }

    /// Close the current link from the device side.
    pub fn drop_connection(&self) -> bool {
        let delivered = self.push(Incoming::Closed {
            code: Some(1006),
            reason: "peer dropped".into(),
        });
        lock(&self.state).inbound = None;
        delivered
    }

    /// Texts received from the client, in order.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.state).sent.clone()
    }

    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    /// Number of connection attempts so far, refused ones included.
    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn set_refuse(&self, refuse: bool) {
        lock(&self.state).refuse = refuse;
    }

    pub fn set_writable(&self, writable: bool) {
        lock(&self.state).writable = writable;
    }

    pub fn set_fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_messages_reach_the_link() -> Result<()> {
        let connector = MemoryConnector::new();
        let peer = connector.peer();
        let mut link = connector.connect("mem://device")?;

        assert!(peer.push_text("current_fps:3"));
        assert_eq!(link.recv()?, Some(Incoming::Text("current_fps:3".into())));
        assert_eq!(link.recv()?, None);

        link.send_text("start_stream")?;
        assert_eq!(peer.sent(), vec!["start_stream".to_string()]);
        Ok(())
    }

    #[test]
    fn dropped_connection_surfaces_as_closed() -> Result<()> {
        let connector = MemoryConnector::new();
        let peer = connector.peer();
        let mut link = connector.connect("mem://device")?;

        peer.drop_connection();
        assert!(matches!(link.recv()?, Some(Incoming::Closed { .. })));
        assert!(!link.is_writable());
        assert!(link.send_text("stop_stream").is_err());
        Ok(())
    }

    #[test]
    fn refused_connections_are_counted() {
        let connector = MemoryConnector::new();
        let peer = connector.peer();
        peer.set_refuse(true);
        assert!(connector.connect("mem://device").is_err());
        assert_eq!(peer.connect_count(), 1);
    }
}
