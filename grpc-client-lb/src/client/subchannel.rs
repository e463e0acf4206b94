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

//! A Subchannel owns one transport session to one resolved address.
//!
//! Subchannels never reconnect on their own: every state change is reported
//! to the LB policy that created the subchannel, which decides whether to
//! connect again or replace it.

use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue, TE, USER_AGENT};
use parking_lot::Mutex;
use tonic::metadata::MetadataMap;
use tracing::{debug, trace, warn};

use crate::Error;
use crate::client::load_balancing::SubchannelState;
use crate::client::name_resolution::Address;
use crate::client::transport::{
    ConnectOptions, ConnectedSession, Connector, Session, SessionEvent, TransportStream,
};
use crate::client::{CallInfo, ConnectivityState};
use crate::rt::{BoxedTaskHandle, Runtime};

/// The default interval between keepalive pings.  It is large enough that
/// keepalive is effectively disabled unless configured.
pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_millis(i32::MAX as u64);

/// The default time to wait for a keepalive ping to be acknowledged before
/// the connection is considered dead.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(20000);

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Per-subchannel overrides supplied by an LB policy.  Unset fields inherit
/// the channel's configuration.
#[derive(Debug, Clone, Default)]
pub struct SubchannelArgs {
    pub keepalive_time: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,
}

/// The fully resolved configuration of a subchannel.
#[derive(Debug, Clone)]
pub(crate) struct SubchannelConfig {
    pub(crate) keepalive_time: Duration,
    pub(crate) keepalive_timeout: Duration,
    pub(crate) user_agent: String,
    pub(crate) connect_options: ConnectOptions,
}

impl SubchannelConfig {
    pub(crate) fn with_args(&self, args: &SubchannelArgs) -> Self {
        Self {
            keepalive_time: args.keepalive_time.unwrap_or(self.keepalive_time),
            keepalive_timeout: args.keepalive_timeout.unwrap_or(self.keepalive_timeout),
            ..self.clone()
        }
    }
}

/// Receives every state change of a subchannel.
pub(crate) trait SubchannelStateWatcher: Send + Sync {
    fn on_state_change(&self, subchannel: WeakSubchannel, state: SubchannelState);
}

enum InternalSubchannelState {
    Idle,
    Connecting(InternalSubchannelConnectingState),
    Ready(InternalSubchannelReadyState),
    TransientFailure,
    Shutdown,
}

struct InternalSubchannelConnectingState {
    abort_handle: Option<BoxedTaskHandle>,
}

struct InternalSubchannelReadyState {
    session: Arc<dyn Session>,
    disconnect_task: Option<BoxedTaskHandle>,
    keepalive_task: Option<BoxedTaskHandle>,
}

impl InternalSubchannelState {
    fn connectivity_state(&self) -> ConnectivityState {
        match self {
            Self::Idle => ConnectivityState::Idle,
            Self::Connecting(_) => ConnectivityState::Connecting,
            Self::Ready(_) => ConnectivityState::Ready,
            Self::TransientFailure => ConnectivityState::TransientFailure,
            Self::Shutdown => ConnectivityState::Shutdown,
        }
    }
}

impl Drop for InternalSubchannelConnectingState {
    fn drop(&mut self) {
        if let Some(ah) = &self.abort_handle {
            ah.abort();
        }
    }
}

impl Drop for InternalSubchannelReadyState {
    fn drop(&mut self) {
        if let Some(task) = &self.keepalive_task {
            task.abort();
        }
        if let Some(task) = &self.disconnect_task {
            task.abort();
        }
        self.session.close();
    }
}

struct InnerState {
    state: InternalSubchannelState,
    ref_count: usize,
    // Identifies the current connection attempt.  Results and events from
    // earlier attempts are ignored.
    generation: u64,
    delayed_connect: Option<BoxedTaskHandle>,
}

struct InnerSubchannel {
    id: u64,
    address: Address,
    config: SubchannelConfig,
    connector: Arc<dyn Connector>,
    runtime: Arc<dyn Runtime>,
    watcher: Arc<dyn SubchannelStateWatcher>,
    weak_self: Weak<InnerSubchannel>,
    state: Mutex<InnerState>,
}

/// A Subchannel represents one connection to one address.  Clones refer to
/// the same subchannel.
///
/// - Subchannels start IDLE.
///
/// - IDLE and TRANSIENT_FAILURE transition to CONNECTING when connect() is
///   called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the session is closed, fails, receives a
///   GOAWAY or misses a keepalive ping acknowledgement.
///
/// - Any state transitions to SHUTDOWN on close().  No further state changes
///   are reported after that.
///
/// When the last clone is dropped, the subchannel is closed.
#[derive(Clone)]
pub struct Subchannel {
    inner: Arc<InnerSubchannel>,
}

impl Subchannel {
    pub(crate) fn new(
        address: Address,
        config: SubchannelConfig,
        connector: Arc<dyn Connector>,
        runtime: Arc<dyn Runtime>,
        watcher: Arc<dyn SubchannelStateWatcher>,
    ) -> Self {
        let id = NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        debug!("creating subchannel {} for {}", id, address);
        let inner = Arc::new_cyclic(|weak_self| InnerSubchannel {
            id,
            address,
            config,
            connector,
            runtime,
            watcher,
            weak_self: weak_self.clone(),
            state: Mutex::new(InnerState {
                state: InternalSubchannelState::Idle,
                ref_count: 0,
                generation: 0,
                delayed_connect: None,
            }),
        });
        Self { inner }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn address(&self) -> &Address {
        &self.inner.address
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.inner.state.lock().state.connectivity_state()
    }

    pub fn ref_count(&self) -> usize {
        self.inner.state.lock().ref_count
    }

    /// Begins connecting asynchronously if the subchannel is IDLE or in
    /// TRANSIENT_FAILURE.  Otherwise does nothing.
    pub fn connect(&self) {
        self.inner.connect();
    }

    /// Like connect(), but waits for `delay` first.  A later call replaces
    /// any pending delayed connect.
    pub fn connect_after(&self, delay: Duration) {
        if delay.is_zero() {
            if let Some(previous) = self.inner.state.lock().delayed_connect.take() {
                previous.abort();
            }
            self.connect();
            return;
        }
        let weak = self.inner.weak_self.clone();
        let sleep = self.inner.runtime.sleep(delay);
        let task = self.inner.runtime.spawn(Box::pin(async move {
            sleep.await;
            if let Some(inner) = weak.upgrade() {
                inner.connect();
            }
        }));
        if let Some(previous) = self.inner.state.lock().delayed_connect.replace(task) {
            previous.abort();
        }
    }

    /// Marks the session as actively needed.  The first reference resumes
    /// keepalive pings on a connected session.
    pub fn add_ref(&self) {
        let mut inner = self.inner.state.lock();
        inner.ref_count += 1;
        if inner.ref_count == 1 {
            self.inner.start_keepalive(&mut inner);
        }
    }

    /// Releases a reference.  When the last reference is released keepalive
    /// pings are suspended; the session itself stays open.
    pub fn unref(&self) {
        self.inner.unref();
    }

    /// Starts a new call stream on the connected session.  The stream holds a
    /// reference to the subchannel until it is dropped.
    pub fn start_call_stream(
        &self,
        metadata: MetadataMap,
        call: &CallInfo,
    ) -> Result<SubchannelStream, Error> {
        let session = match &self.inner.state.lock().state {
            InternalSubchannelState::Ready(st) => st.session.clone(),
            _ => return Err(Error::SubchannelNotReady(self.inner.address.to_string())),
        };

        let uri = http::Uri::builder()
            .scheme("http")
            .authority(call.authority.as_str())
            .path_and_query(call.method.as_str())
            .build()?;
        let mut request = http::Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .version(http::Version::HTTP_2)
            .body(())?;
        let headers = request.headers_mut();
        headers.extend(metadata.into_headers());
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&self.inner.config.user_agent).map_err(http::Error::from)?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        headers.insert(TE, HeaderValue::from_static("trailers"));

        let stream = session.start_stream(request).map_err(Error::Transport)?;
        self.add_ref();
        Ok(SubchannelStream {
            stream,
            subchannel: self.inner.weak_self.clone(),
        })
    }

    /// Closes the session and cancels every timer.  Streams still open on the
    /// session observe an error.
    pub fn close(&self) {
        self.inner.close();
    }

    pub(crate) fn downgrade(&self) -> WeakSubchannel {
        WeakSubchannel {
            id: self.inner.id,
            inner: self.inner.weak_self.clone(),
        }
    }
}

impl InnerSubchannel {
    fn notify(&self, state: SubchannelState) {
        self.watcher.on_state_change(
            WeakSubchannel {
                id: self.id,
                inner: self.weak_self.clone(),
            },
            state,
        );
    }

    fn connect(&self) {
        {
            let mut inner = self.state.lock();
            match inner.state {
                InternalSubchannelState::Idle | InternalSubchannelState::TransientFailure => {}
                _ => return,
            }
            inner.generation += 1;
            let generation = inner.generation;
            debug!("subchannel {} connecting to {}", self.id, self.address);

            let weak = self.weak_self.clone();
            let connector = self.connector.clone();
            let address = self.address.clone();
            let opts = self.config.connect_options.clone();
            // Move to Connecting before spawning so a fast result never
            // observes the previous state.
            inner.state = InternalSubchannelState::Connecting(InternalSubchannelConnectingState {
                abort_handle: None,
            });
            let task = self.runtime.spawn(Box::pin(async move {
                let result = connector.connect(&address, &opts).await;
                match weak.upgrade() {
                    Some(isc) => isc.on_connect_result(generation, result),
                    None => {
                        if let Ok(connected) = result {
                            connected.session.close();
                        }
                    }
                }
            }));
            if let InternalSubchannelState::Connecting(st) = &mut inner.state {
                st.abort_handle = Some(task);
            }
        }
        self.notify(SubchannelState::new(ConnectivityState::Connecting));
    }

    fn on_connect_result(&self, generation: u64, result: Result<ConnectedSession, String>) {
        let state = {
            let mut inner = self.state.lock();
            let current = inner.generation == generation
                && matches!(inner.state, InternalSubchannelState::Connecting(_));
            match result {
                Ok(connected) if !current => {
                    connected.session.close();
                    return;
                }
                Err(_) if !current => return,
                Ok(ConnectedSession {
                    session,
                    disconnection_listener,
                }) => {
                    debug!("subchannel {} connected to {}", self.id, self.address);
                    let weak = self.weak_self.clone();
                    let disconnect_task = self.runtime.spawn(Box::pin(async move {
                        let event = disconnection_listener.await.unwrap_or(SessionEvent::Closed);
                        if let Some(isc) = weak.upgrade() {
                            isc.on_connection_lost(generation, event.to_string());
                        }
                    }));
                    inner.state = InternalSubchannelState::Ready(InternalSubchannelReadyState {
                        session: Arc::from(session),
                        disconnect_task: Some(disconnect_task),
                        keepalive_task: None,
                    });
                    if inner.ref_count > 0 {
                        self.start_keepalive(&mut inner);
                    }
                    SubchannelState::new(ConnectivityState::Ready)
                }
                Err(err) => {
                    debug!(
                        "subchannel {} failed to connect to {}: {}",
                        self.id, self.address, err
                    );
                    inner.state = InternalSubchannelState::TransientFailure;
                    SubchannelState::with_error(ConnectivityState::TransientFailure, err)
                }
            }
        };
        self.notify(state);
    }

    // Close, error and goaway events from the session, as well as keepalive
    // timeouts, all end up here.
    fn on_connection_lost(&self, generation: u64, reason: String) {
        {
            let mut inner = self.state.lock();
            if inner.generation != generation
                || !matches!(inner.state, InternalSubchannelState::Ready(_))
            {
                return;
            }
            debug!(
                "subchannel {} lost connection to {}: {}",
                self.id, self.address, reason
            );
            inner.state = InternalSubchannelState::Idle;
        }
        self.notify(SubchannelState::with_error(ConnectivityState::Idle, reason));
    }

    fn start_keepalive(&self, inner: &mut InnerState) {
        let generation = inner.generation;
        let InternalSubchannelState::Ready(ready) = &mut inner.state else {
            return;
        };
        if ready.keepalive_task.is_some() {
            return;
        }
        let session = ready.session.clone();
        let runtime = self.runtime.clone();
        let weak = self.weak_self.clone();
        let id = self.id;
        let keepalive_time = self.config.keepalive_time;
        let keepalive_timeout = self.config.keepalive_timeout;
        ready.keepalive_task = Some(self.runtime.spawn(Box::pin(async move {
            loop {
                trace!("subchannel {} sending keepalive ping", id);
                let timeout = runtime.sleep(keepalive_timeout);
                tokio::select! {
                    _ = timeout => {
                        warn!("subchannel {} keepalive ping timed out after {:?}", id, keepalive_timeout);
                        if let Some(isc) = weak.upgrade() {
                            isc.on_connection_lost(generation, "keepalive ping timed out".to_string());
                        }
                        return;
                    }
                    result = session.ping() => {
                        if let Err(err) = result {
                            debug!("subchannel {} keepalive ping failed: {}", id, err);
                        }
                    }
                }
                runtime.sleep(keepalive_time).await;
            }
        })));
    }

    fn stop_keepalive(&self, inner: &mut InnerState) {
        if let InternalSubchannelState::Ready(ready) = &mut inner.state {
            if let Some(task) = ready.keepalive_task.take() {
                trace!("subchannel {} suspending keepalive pings", self.id);
                task.abort();
            }
        }
    }

    fn unref(&self) {
        let mut inner = self.state.lock();
        debug_assert!(inner.ref_count > 0, "unref of unreferenced subchannel");
        inner.ref_count = inner.ref_count.saturating_sub(1);
        if inner.ref_count == 0 {
            self.stop_keepalive(&mut inner);
        }
    }

    fn close(&self) {
        let mut inner = self.state.lock();
        if let Some(task) = inner.delayed_connect.take() {
            task.abort();
        }
        if !matches!(inner.state, InternalSubchannelState::Shutdown) {
            debug!("closing subchannel {} for {}", self.id, self.address);
            inner.state = InternalSubchannelState::Shutdown;
        }
    }
}

impl Drop for InnerSubchannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subchannel {}

impl Hash for Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl Display for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subchannel({}, {})", self.inner.id, self.inner.address)
    }
}

impl Debug for Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

/// A non-owning handle to a subchannel, used to route state changes without
/// keeping the subchannel alive.
#[derive(Clone)]
pub(crate) struct WeakSubchannel {
    id: u64,
    inner: Weak<InnerSubchannel>,
}

impl WeakSubchannel {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<Subchannel> {
        self.inner.upgrade().map(|inner| Subchannel { inner })
    }
}

impl Debug for WeakSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WeakSubchannel({})", self.id)
    }
}

/// A call stream started on a subchannel.  Dropping it releases the
/// reference it holds on the subchannel.
pub struct SubchannelStream {
    stream: Box<dyn TransportStream>,
    subchannel: Weak<InnerSubchannel>,
}

impl SubchannelStream {
    pub async fn send_data(&mut self, data: Bytes, end_stream: bool) -> Result<(), String> {
        self.stream.send_data(data, end_stream).await
    }

    pub async fn recv_data(&mut self) -> Option<Result<Bytes, String>> {
        self.stream.recv_data().await
    }
}

impl Drop for SubchannelStream {
    fn drop(&mut self) {
        if let Some(isc) = self.subchannel.upgrade() {
            isc.unref();
        }
    }
}

impl Debug for SubchannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubchannelStream").finish_non_exhaustive()
    }
}
