/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! The interface boundary between subchannels and the transport that
//! actually carries calls.  Stream multiplexing, header encoding,
//! credentials and payload framing all live behind these traits.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::oneshot;
use tonic::async_trait;

use super::name_resolution::Address;

/// Why a session stopped being usable.  Subchannels normalize all of these to
/// a single connection-lost state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session was closed cleanly.
    Closed,
    /// The session failed with an error.
    Error(String),
    /// The peer sent a GOAWAY.
    GoAway(String),
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Closed => write!(f, "session closed"),
            SessionEvent::Error(e) => write!(f, "session error: {e}"),
            SessionEvent::GoAway(reason) => write!(f, "received goaway: {reason}"),
        }
    }
}

/// A newly established session plus a listener that completes when the
/// session is no longer usable.
pub struct ConnectedSession {
    pub session: Box<dyn Session>,
    pub disconnection_listener: oneshot::Receiver<SessionEvent>,
}

// TODO: The following options are specific to HTTP/2. We should
// instead pass an attribute-like bag to connect() which can hold config
// relevant to a particular transport.
#[derive(Default, Debug, Clone)]
pub struct ConnectOptions {
    pub connect_deadline: Option<Instant>,
    pub tcp_keepalive: Option<Duration>,
    pub tcp_nodelay: bool,
}

/// Establishes sessions to addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        address: &Address,
        opts: &ConnectOptions,
    ) -> Result<ConnectedSession, String>;
}

/// One live transport session (e.g. an HTTP/2 connection).
#[async_trait]
pub trait Session: Send + Sync {
    /// Sends a ping and resolves when the peer acknowledges it.
    async fn ping(&self) -> Result<(), String>;

    /// Opens a new request stream carrying the given request headers.
    fn start_stream(&self, request: http::Request<()>) -> Result<Box<dyn TransportStream>, String>;

    /// Closes the session.  Streams still open on it observe an error.
    fn close(&self);
}

/// The transport half of one call.
#[async_trait]
pub trait TransportStream: Send {
    /// Sends one framed message.  `end_stream` half-closes the send side.
    async fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), String>;

    /// Receives the next framed message, or None once the peer has finished.
    async fn recv_data(&mut self) -> Option<Result<Bytes, String>>;
}
