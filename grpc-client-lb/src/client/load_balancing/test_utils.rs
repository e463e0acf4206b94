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

use std::collections::HashSet;
use std::error::Error;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tonic::async_trait;

use crate::client::load_balancing::{
    ChannelControlHelper, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Picker,
    SubchannelState,
};
use crate::client::name_resolution::{
    Address, Resolver, ResolverBuilder, ResolverListener, ResolverOptions, Target,
};
use crate::client::service_config::LbConfig;
use crate::client::subchannel::{
    DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_KEEPALIVE_TIME, Subchannel, SubchannelArgs,
    SubchannelConfig, SubchannelStateWatcher, WeakSubchannel,
};
use crate::client::transport::{
    ConnectOptions, ConnectedSession, Connector, Session, SessionEvent, TransportStream,
};
use crate::client::ConnectivityState;
use crate::rt::{default_runtime, Runtime};

/// Installs a tracing subscriber that writes through the test harness.
/// Filtering is controlled with RUST_LOG.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) enum TestEvent {
    NewSubchannel(Subchannel),
    UpdatePicker(LbState),
    RequestResolution,
    SubchannelUpdate(Subchannel, SubchannelState),
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::SubchannelUpdate(sc, state) => {
                write!(f, "SubchannelUpdate({}, {})", sc.address(), state)
            }
        }
    }
}

impl SubchannelStateWatcher for mpsc::UnboundedSender<TestEvent> {
    fn on_state_change(&self, subchannel: WeakSubchannel, state: SubchannelState) {
        if let Some(sc) = subchannel.upgrade() {
            let _ = self.send(TestEvent::SubchannelUpdate(sc, state));
        }
    }
}

/// Waits for the next event, failing the test if none arrives within a few
/// (virtual) seconds.
pub(crate) async fn next_event(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> TestEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for test event")
        .expect("test event channel closed")
}

pub(crate) fn test_subchannel_config() -> SubchannelConfig {
    SubchannelConfig {
        keepalive_time: DEFAULT_KEEPALIVE_TIME,
        keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        user_agent: "grpc-client-lb-test".to_string(),
        connect_options: ConnectOptions::default(),
    }
}

/// A test helper that creates real subchannels on a [`FakeConnector`] and
/// forwards every report to a channel so tests can observe them.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
    pub(crate) connector: Arc<FakeConnector>,
    pub(crate) runtime: Arc<dyn Runtime>,
    watcher: Arc<dyn SubchannelStateWatcher>,
}

impl TestChannelController {
    /// Builds a controller whose subchannel state changes are delivered as
    /// [`TestEvent::SubchannelUpdate`] on the returned receiver.
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TestEvent>) {
        let (tx_events, rx_events) = mpsc::unbounded_channel();
        let watcher = Arc::new(tx_events.clone());
        (Self::with_watcher(tx_events, watcher), rx_events)
    }

    /// Builds a controller whose subchannel state changes go to `watcher`.
    pub(crate) fn with_watcher(
        tx_events: mpsc::UnboundedSender<TestEvent>,
        watcher: Arc<dyn SubchannelStateWatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            tx_events,
            connector: Arc::new(FakeConnector::default()),
            runtime: default_runtime(),
            watcher,
        })
    }
}

impl ChannelControlHelper for TestChannelController {
    fn create_subchannel(&self, address: &Address, args: &SubchannelArgs) -> Subchannel {
        let subchannel = Subchannel::new(
            address.clone(),
            test_subchannel_config().with_args(args),
            self.connector.clone(),
            self.runtime.clone(),
            self.watcher.clone(),
        );
        let _ = self
            .tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_state(&self, connectivity_state: ConnectivityState, picker: Arc<dyn Picker>) {
        let _ = self.tx_events.send(TestEvent::UpdatePicker(LbState {
            connectivity_state,
            picker,
        }));
    }

    fn request_reresolution(&self) {
        let _ = self.tx_events.send(TestEvent::RequestResolution);
    }
}

/// A request header block recorded by a [`FakeSession`].
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub(crate) method: http::Method,
    pub(crate) uri: http::Uri,
    pub(crate) version: http::Version,
    pub(crate) headers: http::HeaderMap,
}

/// Test-side control of one fake session.
pub(crate) struct FakeSessionHandle {
    pub(crate) address: String,
    pings: AtomicUsize,
    ping_acks: AtomicBool,
    closed: AtomicBool,
    events: Mutex<Option<oneshot::Sender<SessionEvent>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl FakeSessionHandle {
    pub(crate) fn ping_count(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    /// Controls whether pings are acknowledged.  Unacknowledged pings never
    /// complete.
    pub(crate) fn set_ping_acks(&self, acks: bool) {
        self.ping_acks.store(acks, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates the session ending from the transport side.
    pub(crate) fn disconnect(&self, event: SessionEvent) {
        if let Some(tx) = self.events.lock().take() {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

struct FakeSession {
    handle: Arc<FakeSessionHandle>,
}

#[async_trait]
impl Session for FakeSession {
    async fn ping(&self) -> Result<(), String> {
        self.handle.pings.fetch_add(1, Ordering::SeqCst);
        if !self.handle.ping_acks.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn start_stream(&self, request: http::Request<()>) -> Result<Box<dyn TransportStream>, String> {
        if self.handle.is_closed() {
            return Err("session closed".to_string());
        }
        let (parts, ()) = request.into_parts();
        self.handle.requests.lock().push(RecordedRequest {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
        });
        Ok(Box::new(FakeStream { sent: Vec::new() }))
    }

    fn close(&self) {
        self.handle.closed.store(true, Ordering::SeqCst);
        self.handle.disconnect(SessionEvent::Closed);
    }
}

/// A stream that echoes back whatever was sent on it once the send side is
/// closed.
struct FakeStream {
    sent: Vec<Bytes>,
}

#[async_trait]
impl TransportStream for FakeStream {
    async fn send_data(&mut self, data: Bytes, _end_stream: bool) -> Result<(), String> {
        self.sent.push(data);
        Ok(())
    }

    async fn recv_data(&mut self) -> Option<Result<Bytes, String>> {
        if self.sent.is_empty() {
            return None;
        }
        Some(Ok(self.sent.remove(0)))
    }
}

#[derive(Default)]
struct FakeConnectorState {
    failing: HashSet<String>,
    hanging: HashSet<String>,
    attempts: Vec<String>,
    sessions: Vec<Arc<FakeSessionHandle>>,
}

/// A connector that succeeds immediately unless told otherwise for a given
/// address.
#[derive(Default)]
pub(crate) struct FakeConnector {
    state: Mutex<FakeConnectorState>,
}

impl FakeConnector {
    /// Makes connection attempts to `address` fail.
    pub(crate) fn fail(&self, address: &str) {
        self.state.lock().failing.insert(address.to_string());
    }

    /// Makes connection attempts to `address` never complete.
    pub(crate) fn hang(&self, address: &str) {
        self.state.lock().hanging.insert(address.to_string());
    }

    /// Makes connection attempts to `address` succeed again.
    pub(crate) fn succeed(&self, address: &str) {
        let mut state = self.state.lock();
        state.failing.remove(address);
        state.hanging.remove(address);
    }

    /// Every address a connection was attempted to, in order.
    pub(crate) fn attempts(&self) -> Vec<String> {
        self.state.lock().attempts.clone()
    }

    /// The most recent session established to `address`.
    pub(crate) fn session(&self, address: &str) -> Option<Arc<FakeSessionHandle>> {
        self.state
            .lock()
            .sessions
            .iter()
            .rev()
            .find(|s| s.address == address)
            .cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        address: &Address,
        _opts: &ConnectOptions,
    ) -> Result<ConnectedSession, String> {
        let addr = address.address.clone();
        let result = {
            let mut state = self.state.lock();
            state.attempts.push(addr.clone());
            if state.failing.contains(&addr) {
                Some(Err(format!("connection refused: {addr}")))
            } else if state.hanging.contains(&addr) {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let handle = Arc::new(FakeSessionHandle {
                    address: addr.clone(),
                    pings: AtomicUsize::new(0),
                    ping_acks: AtomicBool::new(true),
                    closed: AtomicBool::new(false),
                    events: Mutex::new(Some(tx)),
                    requests: Mutex::default(),
                });
                state.sessions.push(handle.clone());
                Some(Ok(ConnectedSession {
                    session: Box::new(FakeSession { handle }),
                    disconnection_listener: rx,
                }))
            }
        };
        match result {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

type UpdateFn = dyn Fn(
        &mut Data,
        Vec<Address>,
        Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    + Send
    + Sync;
type SubchannelUpdateFn = dyn Fn(&mut Data, &Subchannel, &SubchannelState) + Send + Sync;
type ParseConfigFn =
    dyn Fn(&serde_json::Value) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> + Send + Sync;

/// This struct holds `LbPolicy` trait stub functions that tests are expected
/// to implement.
#[derive(Clone, Default)]
pub(crate) struct PolicyFuncs {
    pub(crate) update_address_list: Option<Arc<UpdateFn>>,
    pub(crate) subchannel_update: Option<Arc<SubchannelUpdateFn>>,
    pub(crate) exit_idle: Option<Arc<dyn Fn(&mut Data) + Send + Sync>>,
    pub(crate) parse_config: Option<Arc<ParseConfigFn>>,
}

/// Data holds test data passed to all functions in PolicyFuncs, including
/// the helper the policy currently reports through.
pub(crate) struct Data {
    pub(crate) helper: Arc<dyn ChannelControlHelper>,
    /// Subchannels the stub keeps alive until it is dropped.
    pub(crate) subchannels: Vec<Subchannel>,
}

/// The stub `LbPolicy` that calls the provided functions and logs every
/// call.
pub(crate) struct StubPolicy {
    name: &'static str,
    funcs: PolicyFuncs,
    data: Data,
    log: Arc<Mutex<Vec<String>>>,
}

impl StubPolicy {
    fn record(&self, op: &str) {
        self.log.lock().push(format!("{}:{}", self.name, op));
    }
}

impl LbPolicy for StubPolicy {
    fn update_address_list(
        &mut self,
        addresses: Vec<Address>,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.record("update_address_list");
        if let Some(f) = &self.funcs.update_address_list {
            return f(&mut self.data, addresses, config);
        }
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Subchannel, state: &SubchannelState) {
        self.record("subchannel_update");
        if let Some(f) = &self.funcs.subchannel_update {
            f(&mut self.data, subchannel, state);
        }
    }

    fn exit_idle(&mut self) {
        self.record("exit_idle");
        if let Some(f) = &self.funcs.exit_idle {
            f(&mut self.data);
        }
    }

    fn reset_backoff(&mut self) {
        self.record("reset_backoff");
    }

    fn destroy(&mut self) {
        self.record("destroy");
    }

    fn type_name(&self) -> &'static str {
        self.name
    }

    fn replace_channel_control_helper(&mut self, helper: Arc<dyn ChannelControlHelper>) {
        self.record("replace_channel_control_helper");
        self.data.helper = helper;
    }
}

/// This StubPolicyBuilder builds a StubPolicy.  All policies it builds share
/// one call log.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    funcs: PolicyFuncs,
    log: Arc<Mutex<Vec<String>>>,
}

impl StubPolicyBuilder {
    pub(crate) fn new(name: &'static str, funcs: PolicyFuncs) -> Self {
        Self {
            name,
            funcs,
            log: Arc::default(),
        }
    }

    /// Like new(), but records into an existing call log.
    pub(crate) fn with_log(
        name: &'static str,
        funcs: PolicyFuncs,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Self {
        Self { name, funcs, log }
    }

    /// Returns a handle to the shared call log.  Entries are formatted as
    /// `name:operation`.
    pub(crate) fn log(&self) -> Arc<Mutex<Vec<String>>> {
        self.log.clone()
    }
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(
        &self,
        helper: Arc<dyn ChannelControlHelper>,
        _options: LbPolicyOptions,
    ) -> Box<dyn LbPolicy> {
        self.log.lock().push(format!("{}:build", self.name));
        Box::new(StubPolicy {
            name: self.name,
            funcs: self.funcs.clone(),
            data: Data {
                helper,
                subchannels: Vec::new(),
            },
            log: self.log.clone(),
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        config: &serde_json::Value,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        match &self.funcs.parse_config {
            Some(f) => f(config),
            None => Ok(None),
        }
    }
}

#[derive(Default)]
struct ManualResolverState {
    listener: Option<ResolverListener>,
    resolution_requests: usize,
}

/// A resolver builder whose resolver only reports what the test tells it
/// to, through [`ManualResolverBuilder::listener`].
#[derive(Clone, Default)]
pub(crate) struct ManualResolverBuilder {
    state: Arc<Mutex<ManualResolverState>>,
}

impl ManualResolverBuilder {
    pub(crate) fn listener(&self) -> ResolverListener {
        self.state
            .lock()
            .listener
            .clone()
            .expect("resolver has not been built")
    }

    /// How many times the resolver has been asked to resolve.
    pub(crate) fn resolution_requests(&self) -> usize {
        self.state.lock().resolution_requests
    }
}

impl ResolverBuilder for ManualResolverBuilder {
    fn build(&self, _target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        self.state.lock().listener = Some(options.listener);
        Box::new(ManualResolver {
            state: self.state.clone(),
        })
    }

    fn scheme(&self) -> &str {
        "manual"
    }
}

struct ManualResolver {
    state: Arc<Mutex<ManualResolverState>>,
}

impl Resolver for ManualResolver {
    fn update_resolution(&mut self) {
        self.state.lock().resolution_requests += 1;
    }
}
