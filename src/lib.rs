//! Language Server Protocol client runtime based on [`tower`].
//!
//! This crate is the stateful middle layer between an editor (the "host")
//! and a language server: it owns the JSON-RPC connection lifecycle, builds
//! and interprets capabilities, synchronizes documents, schedules pull
//! diagnostics, bridges file watchers, and exposes one generic
//! middleware-wrapped request pipeline for every language feature.
//!
//! Byte framing is deliberately out of scope: a [`Connect`] implementation
//! supplies a stream/sink pair speaking [`jsonrpc::Message`] values, usually
//! by spawning the server process and wrapping its stdio in a codec. The
//! host side is a single [`Host`] trait with conservative defaults.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tower_lsp_client::lsp_types::request::HoverRequest;
//! use tower_lsp_client::lsp_types::*;
//! use tower_lsp_client::{ClientOptions, Host, LanguageClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(connect: impl tower_lsp_client::Connect) -> tower_lsp_client::Result<()> {
//! struct Editor;
//! impl Host for Editor {}
//!
//! let client = LanguageClient::new(connect, Arc::new(Editor), ClientOptions::default());
//! client.start().await?;
//!
//! let uri: Url = "file:///src/main.rs".parse().unwrap();
//! client
//!     .did_open(TextDocumentItem::new(uri.clone(), "rust".into(), 1, "fn main() {}".into()))
//!     .await?;
//!
//! let hover = client
//!     .document_request::<HoverRequest>(
//!         &uri,
//!         HoverParams {
//!             text_document_position_params: TextDocumentPositionParams {
//!                 text_document: TextDocumentIdentifier::new(uri.clone()),
//!                 position: Position::new(0, 3),
//!             },
//!             work_done_progress_params: Default::default(),
//!         },
//!         &CancellationToken::new(),
//!     )
//!     .await?;
//! # let _ = hover;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

/// A re-export of [`async-trait`](https://docs.rs/async-trait) for convenience.
pub use async_trait::async_trait;

/// A re-export of [`lsp-types`](https://docs.rs/lsp-types) for convenience.
pub use lsp_types;

pub mod jsonrpc;

pub use self::client::{LanguageClient, PublicState};
pub use self::error::{CloseAction, DefaultErrorHandler, Error, ErrorAction, ErrorHandler, Result};
pub use self::host::{Host, RefreshKind};
pub use self::middleware::{
    Middleware, NextNotification, NextRequest, NotificationHook, RequestHook,
};
pub use self::options::{
    ClientOptions, DiagnosticPullFilter, DiagnosticPullMode, DiagnosticPullOptions,
    InitializationFailedHandler, RevealOutputChannelOn, SynchronizeOptions,
    DEFAULT_MAX_RESTART_COUNT,
};
pub use self::transport::{Connect, MessageSink, MessageStream};

mod capabilities;
mod client;
mod connection;
mod diagnostics;
mod error;
mod file_events;
mod host;
mod middleware;
mod options;
mod progress;
mod registry;
mod selector;
mod sync;
mod transport;

#[cfg(test)]
pub(crate) mod test_support;
