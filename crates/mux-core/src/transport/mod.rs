//! Transport boundary for the duplex client.
//!
//! The client core never touches sockets directly. It asks a [`Connector`]
//! for a [`Link`] (a text-frame sink plus a text-frame stream) and treats
//! the end of the stream (or any error on either half) as the end of the
//! connection epoch. One message in, one message out; framing is the
//! connector's business.

pub mod ws;

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, Stream};

use crate::error::MuxError;

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = MuxError> + Send>>;

/// Inbound half of a connection. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, MuxError>> + Send>>;

/// One established physical connection.
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Link {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a connection to `url`.
    async fn connect(&self, url: &str) -> Result<Link, MuxError>;
}

pub use ws::WsConnector;
