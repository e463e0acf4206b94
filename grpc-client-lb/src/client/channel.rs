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

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tonic::Status;
use tonic::metadata::MetadataMap;
use tracing::{debug, trace};

use crate::Error;
use crate::client::backoff::BackoffConfig;
use crate::client::load_balancing::{
    ChannelControlHelper, GLOBAL_LB_REGISTRY, LbPolicyRegistry, LbState, PickResult, Picker,
    SubchannelState,
};
use crate::client::name_resolution::{
    Address, GLOBAL_RESOLVER_REGISTRY, ResolutionResult, ResolverRegistry, Target,
};
use crate::client::resolving_load_balancer::{
    ResolvingLoadBalancer, ResolvingLoadBalancerOptions,
};
use crate::client::service_config::ServiceConfig;
use crate::client::subchannel::{
    DEFAULT_KEEPALIVE_TIME, DEFAULT_KEEPALIVE_TIMEOUT, Subchannel, SubchannelArgs,
    SubchannelConfig, SubchannelStateWatcher, SubchannelStream, WeakSubchannel,
};
use crate::client::transport::{ConnectOptions, Connector};
use crate::client::{CallInfo, ConnectivityState};
use crate::rt::{Runtime, default_runtime};

/// One unit of work for the task that owns the resolving load balancer.
/// Items are processed strictly in the order they were sent.
pub(crate) enum WorkItem {
    Resolution(ResolutionResult),
    BackoffExpired,
    SubchannelUpdate(WeakSubchannel, SubchannelState),
    ExitIdle,
    ResetBackoff,
    Destroy,
}

impl Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolution(result) => write!(f, "Resolution({result:?})"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
            Self::SubchannelUpdate(sc, state) => write!(f, "SubchannelUpdate({sc:?}, {state})"),
            Self::ExitIdle => write!(f, "ExitIdle"),
            Self::ResetBackoff => write!(f, "ResetBackoff"),
            Self::Destroy => write!(f, "Destroy"),
        }
    }
}

pub(crate) type WorkQueueTx = mpsc::UnboundedSender<WorkItem>;

impl SubchannelStateWatcher for WorkQueueTx {
    fn on_state_change(&self, subchannel: WeakSubchannel, state: SubchannelState) {
        let _ = self.send(WorkItem::SubchannelUpdate(subchannel, state));
    }
}

/// Configuration for a [`Channel`].
#[derive(Clone)]
pub struct ChannelOptions {
    keepalive_time: Duration,
    keepalive_timeout: Duration,
    user_agent: String,
    default_service_config: Option<ServiceConfig>,
    backoff_config: BackoffConfig,
    connect_options: ConnectOptions,
    lb_registry: Option<Arc<LbPolicyRegistry>>,
    resolver_registry: Option<Arc<ResolverRegistry>>,
    connector: Option<Arc<dyn Connector>>,
    runtime: Option<Arc<dyn Runtime>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            keepalive_time: DEFAULT_KEEPALIVE_TIME,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            user_agent: format!("grpc-rust-client-lb/{}", env!("CARGO_PKG_VERSION")),
            default_service_config: None,
            backoff_config: BackoffConfig::default(),
            connect_options: ConnectOptions::default(),
            lb_registry: None,
            resolver_registry: None,
            connector: None,
            runtime: None,
        }
    }
}

impl ChannelOptions {
    /// Interval between keepalive pings on connections that have active
    /// calls.
    pub fn keepalive_time(self, duration: Duration) -> Self {
        ChannelOptions {
            keepalive_time: duration,
            ..self
        }
    }

    /// How long to wait for a keepalive ping to be acknowledged before the
    /// connection is closed.
    pub fn keepalive_timeout(self, duration: Duration) -> Self {
        ChannelOptions {
            keepalive_timeout: duration,
            ..self
        }
    }

    pub fn user_agent(self, user_agent: impl Into<String>) -> Self {
        ChannelOptions {
            user_agent: user_agent.into(),
            ..self
        }
    }

    /// The service config used when the resolver does not provide one.
    pub fn default_service_config(self, config: ServiceConfig) -> Self {
        ChannelOptions {
            default_service_config: Some(config),
            ..self
        }
    }

    /// Backoff used between re-resolution attempts and between connection
    /// passes of the built-in policies.
    pub fn backoff_config(self, config: BackoffConfig) -> Self {
        ChannelOptions {
            backoff_config: config,
            ..self
        }
    }

    pub fn tcp_nodelay(self, enabled: bool) -> Self {
        ChannelOptions {
            connect_options: ConnectOptions {
                tcp_nodelay: enabled,
                ..self.connect_options
            },
            ..self
        }
    }

    pub fn tcp_keepalive(self, duration: Option<Duration>) -> Self {
        ChannelOptions {
            connect_options: ConnectOptions {
                tcp_keepalive: duration,
                ..self.connect_options
            },
            ..self
        }
    }

    /// LB policies available to this channel.  Defaults to
    /// [`GLOBAL_LB_REGISTRY`].
    pub fn lb_registry(self, registry: Arc<LbPolicyRegistry>) -> Self {
        ChannelOptions {
            lb_registry: Some(registry),
            ..self
        }
    }

    /// Resolvers available to this channel.  Defaults to
    /// [`GLOBAL_RESOLVER_REGISTRY`].
    pub fn resolver_registry(self, registry: Arc<ResolverRegistry>) -> Self {
        ChannelOptions {
            resolver_registry: Some(registry),
            ..self
        }
    }

    /// The transport used to establish connections.  Required.
    pub fn connector(self, connector: Arc<dyn Connector>) -> Self {
        ChannelOptions {
            connector: Some(connector),
            ..self
        }
    }

    pub fn runtime(self, runtime: Arc<dyn Runtime>) -> Self {
        ChannelOptions {
            runtime: Some(runtime),
            ..self
        }
    }
}

// The helper at the root of the policy tree.  It creates real subchannels and
// publishes state to the channel's watchers.
struct ChannelHelper {
    connector: Arc<dyn Connector>,
    runtime: Arc<dyn Runtime>,
    watcher: Arc<dyn SubchannelStateWatcher>,
    subchannel_config: SubchannelConfig,
    state_tx: watch::Sender<LbState>,
}

impl ChannelControlHelper for ChannelHelper {
    fn create_subchannel(&self, address: &Address, args: &SubchannelArgs) -> Subchannel {
        Subchannel::new(
            address.clone(),
            self.subchannel_config.with_args(args),
            self.connector.clone(),
            self.runtime.clone(),
            self.watcher.clone(),
        )
    }

    fn update_state(&self, connectivity_state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.state_tx.send_replace(LbState {
            connectivity_state,
            picker,
        });
    }

    fn request_reresolution(&self) {
        // The resolving load balancer owns the resolver; nothing above it
        // can re-resolve.
        trace!("ignoring re-resolution request at channel root");
    }
}

/// A virtual, persistent connection to a service.  Clones share the same
/// underlying channel, which shuts down when the last clone is dropped or
/// close() is called.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    target: Target,
    authority: String,
    work_tx: WorkQueueTx,
    state_rx: watch::Receiver<LbState>,
}

impl Channel {
    /// Constructs a new channel for `target`.  The channel starts IDLE and
    /// does not resolve or connect until a call is started or state(true) is
    /// called.
    ///
    /// Must be called from within the runtime the channel is configured with.
    pub fn new(target: &str, options: ChannelOptions) -> Result<Self, Error> {
        let parsed: Target = target.parse().map_err(|reason| Error::InvalidTarget {
            target: target.to_string(),
            reason,
        })?;
        let resolver_builder = match &options.resolver_registry {
            Some(registry) => registry.get(parsed.scheme()),
            None => GLOBAL_RESOLVER_REGISTRY.get(parsed.scheme()),
        }
        .ok_or_else(|| Error::UnknownScheme(parsed.scheme().to_string()))?;
        let connector = options.connector.ok_or(Error::MissingConnector)?;
        let runtime = options.runtime.unwrap_or_else(default_runtime);
        let authority = resolver_builder.default_authority(&parsed);

        let (work_tx, mut work_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(LbState::initial());
        let helper = Arc::new(ChannelHelper {
            connector,
            runtime: runtime.clone(),
            watcher: Arc::new(work_tx.clone()),
            subchannel_config: SubchannelConfig {
                keepalive_time: options.keepalive_time,
                keepalive_timeout: options.keepalive_timeout,
                user_agent: options.user_agent,
                connect_options: options.connect_options,
            },
            state_tx,
        });
        let mut rlb = ResolvingLoadBalancer::new(
            &parsed,
            resolver_builder,
            authority.clone(),
            ResolvingLoadBalancerOptions {
                runtime: runtime.clone(),
                lb_registry: options
                    .lb_registry
                    .unwrap_or_else(|| GLOBAL_LB_REGISTRY.clone()),
                default_service_config: options.default_service_config,
                backoff_config: options.backoff_config,
            },
            helper,
            work_tx.clone(),
        )?;

        debug!("created channel for {}", parsed);
        // The work loop owns the resolving load balancer.  It exits once the
        // balancer has been destroyed.
        runtime.spawn(Box::pin(async move {
            while let Some(item) = work_rx.recv().await {
                trace!("processing {:?}", item);
                let destroy = matches!(item, WorkItem::Destroy);
                rlb.handle_work(item);
                if destroy {
                    break;
                }
            }
        }));

        Ok(Self {
            inner: Arc::new(ChannelInner {
                target: parsed,
                authority,
                work_tx,
                state_rx,
            }),
        })
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// Returns the current state of the channel.  If the channel is IDLE and
    /// `try_to_connect` is set, the channel starts resolving and connecting.
    pub fn state(&self, try_to_connect: bool) -> ConnectivityState {
        let state = self.inner.state_rx.borrow().connectivity_state;
        if try_to_connect && state == ConnectivityState::Idle {
            self.inner.send(WorkItem::ExitIdle);
        }
        state
    }

    /// Waits until the channel's state differs from `last_observed` and
    /// returns the new state.  Returns SHUTDOWN without waiting once the
    /// channel has shut down.
    pub async fn wait_for_state_change(&self, last_observed: ConnectivityState) -> ConnectivityState {
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            let state = state_rx.borrow_and_update().connectivity_state;
            if state != last_observed || state == ConnectivityState::Shutdown {
                return state;
            }
            if state_rx.changed().await.is_err() {
                return ConnectivityState::Shutdown;
            }
        }
    }

    /// Picks a subchannel for a call to `method` and starts a stream on it.
    ///
    /// Calls wait while the channel is IDLE or CONNECTING and fail
    /// immediately with the picker's status while it is failing.
    pub async fn start_call(
        &self,
        method: &str,
        metadata: MetadataMap,
    ) -> Result<SubchannelStream, Status> {
        let call = CallInfo::new(method, self.inner.authority.clone());
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            let state = state_rx.borrow_and_update().clone();
            match state.picker.pick(&call) {
                PickResult::Pick(subchannel) => {
                    match subchannel.start_call_stream(metadata.clone(), &call) {
                        Ok(stream) => return Ok(stream),
                        // The picker is stale; wait for its replacement.
                        Err(err) => debug!("failed to start call on {}: {}", subchannel, err),
                    }
                }
                PickResult::Queue => {
                    if state.connectivity_state == ConnectivityState::Idle {
                        self.inner.send(WorkItem::ExitIdle);
                    }
                }
                PickResult::Fail(status) => return Err(status),
            }
            if state_rx.changed().await.is_err() {
                return Err(Status::unavailable("channel has been shut down"));
            }
        }
    }

    /// Resets all backoff timers so the next resolution or connection attempt
    /// happens immediately.
    pub fn reset_backoff(&self) {
        self.inner.send(WorkItem::ResetBackoff);
    }

    /// Shuts the channel down.  Calls started afterwards fail.
    pub fn close(&self) {
        self.inner.send(WorkItem::Destroy);
    }
}

impl ChannelInner {
    fn send(&self, item: WorkItem) {
        // The work loop is gone only after the channel has shut down.
        let _ = self.work_tx.send(item);
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        self.send(WorkItem::Destroy);
    }
}
