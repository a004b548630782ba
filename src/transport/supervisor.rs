use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::transport::client::{join_with_timeout, ConnectionClient, ConnectionState};

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Background reconnect loop for one client.
///
/// Every `interval` the supervisor looks at the client and calls `connect`
/// when it is neither connected nor connecting.
pub struct ReconnectSupervisor {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    interval: Duration,
}

impl ReconnectSupervisor {
    pub fn start(client: ConnectionClient, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let join = std::thread::spawn(move || {
            log::debug!("reconnect supervisor started ({:?})", interval);
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                match client.state() {
                    ConnectionState::Connected | ConnectionState::Connecting => {}
                    state => {
                        log::info!("connection is {}; attempting reconnect", state);
                        client.connect();
                    }
                }
            }
            log::debug!("reconnect supervisor stopped");
        });
        Self {
            stop: Some(stop_tx),
            join: Some(join),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .map(|join| !join.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait briefly for it to exit. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(join) = self.join.take() {
            if !join_with_timeout(join, STOP_TIMEOUT) {
                log::warn!("reconnect supervisor did not stop within {:?}", STOP_TIMEOUT);
            }
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
