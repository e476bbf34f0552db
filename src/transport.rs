//! Transport abstraction between the runtime and a language server.
//!
//! The runtime never touches bytes: message framing (`Content-Length`
//! headers, JSON encoding) belongs to the embedder, which hands the client a
//! stream/sink pair speaking [`Message`] values. A fresh pair is requested
//! for every start, so a [`Connect`] implementation typically spawns (or
//! respawns) the server process and wraps its stdio in a codec.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::jsonrpc::Message;

/// A boxed stream of messages decoded from the server.
///
/// Individual items may fail: a frame that could not be decoded surfaces as
/// an `Err` and counts toward the connection's consecutive error budget
/// without tearing the stream down. The stream ending means the connection
/// closed.
pub type MessageStream = Pin<Box<dyn Stream<Item = io::Result<Message>> + Send>>;

/// A boxed sink of messages encoded and sent to the server.
pub type MessageSink = Pin<Box<dyn Sink<Message, Error = io::Error> + Send>>;

/// A factory for fresh server connections.
///
/// Called once per [`LanguageClient::start`](crate::LanguageClient::start),
/// including restarts after a connection close.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Establishes a new connection to the language server.
    async fn connect(&self) -> io::Result<(MessageStream, MessageSink)>;
}
