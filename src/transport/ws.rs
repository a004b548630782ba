//! WebSocket links over plain TCP (`ws://`), the camera firmware's transport.

use std::io::ErrorKind;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tungstenite::protocol::WebSocket;
use tungstenite::{Error as WsError, Message};

use crate::transport::link::{Connector, Incoming, Link};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Connector for WsConnector {
    fn connect(&self, endpoint: &str) -> Result<Box<dyn Link>> {
        let url = url::Url::parse(endpoint)
            .map_err(|e| anyhow!("invalid websocket url '{}': {}", endpoint, e))?;
        if url.scheme() != "ws" {
            return Err(anyhow!("unsupported websocket scheme '{}'", url.scheme()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("websocket url '{}' has no host", endpoint))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let addrs: Vec<_> = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("resolve {}:{}", host, port))?
            .collect();
        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }
        let stream = match (stream, last_err) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(anyhow!("connect to {}:{} failed: {}", host, port, e)),
            (None, None) => return Err(anyhow!("{} resolved to no addresses", host)),
        };
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .context("set handshake timeout")?;

        let (socket, _response) = tungstenite::client(endpoint, stream)
            .map_err(|e| anyhow!("websocket handshake with {} failed: {}", endpoint, e))?;
        socket
            .get_ref()
            .set_read_timeout(Some(POLL_INTERVAL))
            .context("set read timeout")?;
        log::debug!("websocket handshake with {} complete", endpoint);
        Ok(Box::new(WsLink { socket }))
    }
}

struct WsLink {
    socket: WebSocket<TcpStream>,
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl Link for WsLink {
    fn recv(&mut self) -> Result<Option<Incoming>> {
        match self.socket.read() {
            Ok(Message::Binary(data)) => Ok(Some(Incoming::Binary(data))),
            Ok(Message::Text(text)) => Ok(Some(Incoming::Text(text))),
            Ok(Message::Close(frame)) => Ok(Some(match frame {
                Some(frame) => Incoming::Closed {
                    code: Some(u16::from(frame.code)),
                    reason: frame.reason.to_string(),
                },
                None => Incoming::Closed {
                    code: None,
                    reason: String::new(),
                },
            })),
            // Pings are answered by tungstenite on the next read or write.
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => Ok(None),
            Err(WsError::Io(e)) if is_timeout(&e) => Ok(None),
            Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                Ok(Some(Incoming::Closed {
                    code: None,
                    reason: "connection closed".into(),
                }))
            }
            Err(e) => Err(anyhow!("websocket read failed: {}", e)),
        }
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.socket
            .send(Message::Text(text.to_string()))
            .map_err(|e| anyhow!("websocket write failed: {}", e))
    }

    fn is_writable(&self) -> bool {
        self.socket.can_write()
    }

    fn close(&mut self) {
        if self.socket.can_write() {
            if let Err(e) = self.socket.close(None) {
                log::debug!("websocket close failed: {}", e);
            }
            let _ = self.socket.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn rejects_non_ws_urls() {
        let connector = WsConnector::new();
        assert!(connector.connect("http://localhost:8080").is_err());
        assert!(connector.connect("not a url").is_err());
    }

    #[test]
    fn unreachable_endpoint_fails_within_the_connect_timeout() -> Result<()> {
        let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
        let connector = WsConnector::new().with_connect_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        assert!(connector.connect(&format!("ws://127.0.0.1:{}/", port)).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        Ok(())
    }

    #[test]
    fn exchanges_messages_with_a_server() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = std::thread::spawn(move || -> Result<String> {
            let (stream, _) = listener.accept()?;
            let mut ws = tungstenite::accept(stream).map_err(|e| anyhow!("{}", e))?;
            ws.send(Message::Binary(vec![0xFF, 0xD8]))?;
            let reply = loop {
                match ws.read()? {
                    Message::Text(text) => break text,
                    _ => continue,
                }
            };
            ws.close(None)?;
            let _ = ws.flush();
            Ok(reply)
        });

        let mut link = WsConnector::new().connect(&format!("ws://127.0.0.1:{}", port))?;
        let first = loop {
            if let Some(message) = link.recv()? {
                break message;
            }
        };
        assert_eq!(first, Incoming::Binary(vec![0xFF, 0xD8]));
        assert!(link.is_writable());
        link.send_text("start_stream")?;

        let reply = server.join().map_err(|_| anyhow!("server panicked"))??;
        assert_eq!(reply, "start_stream");
        Ok(())
    }
}
