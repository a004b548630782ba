use anyhow::Result;

/// One message read from a link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Incoming {
    Binary(Vec<u8>),
    Text(String),
    /// The peer closed the link, or it was closed locally.
    Closed { code: Option<u16>, reason: String },
}

/// An established bidirectional message link.
///
/// `recv` must return within a short poll interval so the receive worker can
/// observe its stop flag; `Ok(None)` means nothing arrived in time.
pub trait Link: Send {
    fn recv(&mut self) -> Result<Option<Incoming>>;
    fn send_text(&mut self, text: &str) -> Result<()>;
    fn is_writable(&self) -> bool;
    fn close(&mut self);
}

/// Opens links to an endpoint.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str) -> Result<Box<dyn Link>>;
}
