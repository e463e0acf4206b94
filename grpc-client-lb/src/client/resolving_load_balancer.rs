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

//! The resolving load balancer sits between a channel and its LB policy.  It
//! drives the name resolver, selects a policy from the service config, and
//! republishes the state of whichever policy is currently authoritative.
//!
//! When the service config selects a different policy while the current one
//! is serving, the new policy is built as a pending replacement alongside it.
//! The replacement takes over once the current policy leaves READY or the
//! replacement reaches READY, whichever happens first.

use std::collections::{HashMap, VecDeque};
use std::error::Error as StdError;
use std::sync::Arc;

use parking_lot::Mutex;
use tonic::Status;
use tracing::{debug, warn};

use crate::Error;
use crate::client::ConnectivityState;
use crate::client::backoff::{BackoffConfig, BackoffTimer};
use crate::client::channel::{WorkItem, WorkQueueTx};
use crate::client::load_balancing::{
    ChannelControlHelper, DEFAULT_LB_POLICY_NAME, FailingPicker, LbPolicy, LbPolicyBuilder,
    LbPolicyOptions, LbPolicyRegistry, LbState, Picker, QueuingPicker, SubchannelState,
};
use crate::client::name_resolution::{
    Address, ResolutionResult, Resolver, ResolverBuilder, ResolverListener, ResolverOptions,
    Target,
};
use crate::client::service_config::{LbConfig, ServiceConfig};
use crate::client::subchannel::{Subchannel, SubchannelArgs, WeakSubchannel};
use crate::rt::Runtime;

static TYPE_NAME: &str = "resolving_load_balancer";

/// Configuration for a [`ResolvingLoadBalancer`].
#[derive(Clone)]
pub(crate) struct ResolvingLoadBalancerOptions {
    pub(crate) runtime: Arc<dyn Runtime>,
    pub(crate) lb_registry: Arc<LbPolicyRegistry>,
    /// Used when the resolver provides no service config.  None selects the
    /// default policy.
    pub(crate) default_service_config: Option<ServiceConfig>,
    /// Paces re-resolution after failures, and is handed to child policies.
    pub(crate) backoff_config: BackoffConfig,
}

// The service config from the last successful resolution.
#[derive(Debug, Clone)]
enum PreviousServiceConfig {
    NeverResolved,
    // The resolver explicitly reported no service config.
    Absent,
    Config(ServiceConfig),
}

// Which child slot a helper, report or subchannel belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Active,
    Pending,
}

enum ChildReport {
    SubchannelCreated(WeakSubchannel),
    State(LbState),
    Reresolution,
}

type ReportQueue = Arc<Mutex<VecDeque<(Role, ChildReport)>>>;

// The helper given to a child policy.  Reports are queued and processed by
// the resolving load balancer once the call into the child returns.
struct ChildHelper {
    role: Role,
    parent: Arc<Mutex<Arc<dyn ChannelControlHelper>>>,
    reports: ReportQueue,
}

impl ChannelControlHelper for ChildHelper {
    fn create_subchannel(&self, address: &Address, args: &SubchannelArgs) -> Subchannel {
        let parent = self.parent.lock().clone();
        let subchannel = parent.create_subchannel(address, args);
        self.reports
            .lock()
            .push_back((self.role, ChildReport::SubchannelCreated(subchannel.downgrade())));
        subchannel
    }

    fn update_state(&self, connectivity_state: ConnectivityState, picker: Arc<dyn Picker>) {
        self.reports.lock().push_back((
            self.role,
            ChildReport::State(LbState {
                connectivity_state,
                picker,
            }),
        ));
    }

    fn request_reresolution(&self) {
        self.reports
            .lock()
            .push_back((self.role, ChildReport::Reresolution));
    }
}

struct ChildPolicy {
    policy: Box<dyn LbPolicy>,
    state: ConnectivityState,
    picker: Arc<dyn Picker>,
}

impl ChildPolicy {
    fn name(&self) -> &'static str {
        self.policy.type_name()
    }
}

// A pending replacement can only exist next to an active policy.
enum Children {
    None,
    Active(ChildPolicy),
    Switching {
        active: ChildPolicy,
        pending: ChildPolicy,
    },
}

/// Bridges a name resolver to a swappable LB policy and publishes a single
/// (state, picker) stream to its owner.
///
/// All methods must be called from one task; asynchronous inputs (resolver
/// results, backoff expiry, subchannel state changes) arrive as
/// [`WorkItem`]s through [`ResolvingLoadBalancer::handle_work`].
pub(crate) struct ResolvingLoadBalancer {
    helper: Arc<Mutex<Arc<dyn ChannelControlHelper>>>,
    resolver: Option<Box<dyn Resolver>>,
    lb_registry: Arc<LbPolicyRegistry>,
    lb_options: LbPolicyOptions,
    default_service_config: Option<ServiceConfig>,
    previous_service_config: PreviousServiceConfig,
    backoff: BackoffTimer,
    children: Children,
    reports: ReportQueue,
    // Which child owns each live subchannel, keyed by subchannel id.
    subchannels: HashMap<u64, (WeakSubchannel, Role)>,
    connectivity_state: ConnectivityState,
}

impl ResolvingLoadBalancer {
    /// Creates the resolving load balancer and its resolver.  Resolution
    /// starts on the first call to exit_idle.
    pub(crate) fn new(
        target: &Target,
        resolver_builder: Arc<dyn ResolverBuilder>,
        authority: String,
        options: ResolvingLoadBalancerOptions,
        helper: Arc<dyn ChannelControlHelper>,
        work_tx: WorkQueueTx,
    ) -> Result<Self, Error> {
        let backoff_tx = work_tx.clone();
        let backoff = BackoffTimer::new(
            options.backoff_config.clone(),
            options.runtime.clone(),
            move || {
                let _ = backoff_tx.send(WorkItem::BackoffExpired);
            },
        )?;
        let resolver = resolver_builder.build(
            target,
            ResolverOptions {
                authority,
                runtime: options.runtime.clone(),
                listener: ResolverListener::new(work_tx),
            },
        );
        debug!("created resolving load balancer for {}", target);
        Ok(Self {
            helper: Arc::new(Mutex::new(helper)),
            resolver: Some(resolver),
            lb_registry: options.lb_registry,
            lb_options: LbPolicyOptions {
                runtime: options.runtime,
                backoff_config: options.backoff_config,
            },
            default_service_config: options.default_service_config,
            previous_service_config: PreviousServiceConfig::NeverResolved,
            backoff,
            children: Children::None,
            reports: ReportQueue::default(),
            subchannels: HashMap::new(),
            connectivity_state: ConnectivityState::Idle,
        })
    }

    /// Processes one unit of work.  Nothing is processed after destroy.
    pub(crate) fn handle_work(&mut self, item: WorkItem) {
        if self.connectivity_state == ConnectivityState::Shutdown {
            return;
        }
        match item {
            WorkItem::Resolution(ResolutionResult::Success {
                addresses,
                service_config,
                service_config_error,
            }) => self.on_successful_resolution(addresses, service_config, service_config_error),
            WorkItem::Resolution(ResolutionResult::Error(status)) => {
                self.handle_resolution_failure(status)
            }
            WorkItem::BackoffExpired => self.on_backoff_expired(),
            WorkItem::SubchannelUpdate(subchannel, state) => {
                self.route_subchannel_update(&subchannel, &state)
            }
            WorkItem::ExitIdle => self.exit_idle(),
            WorkItem::ResetBackoff => self.reset_backoff(),
            WorkItem::Destroy => self.destroy(),
        }
    }

    pub(crate) fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity_state
    }

    fn on_successful_resolution(
        &mut self,
        addresses: Vec<Address>,
        service_config: Option<ServiceConfig>,
        service_config_error: Option<Status>,
    ) {
        debug!(
            "resolver reported {} addresses, service config present: {}",
            addresses.len(),
            service_config.is_some()
        );
        let working_config = match (service_config, service_config_error) {
            (Some(config), _) => {
                self.previous_service_config = PreviousServiceConfig::Config(config.clone());
                Some(config)
            }
            (None, None) => {
                self.previous_service_config = PreviousServiceConfig::Absent;
                self.default_service_config.clone()
            }
            (None, Some(error)) => match &self.previous_service_config {
                PreviousServiceConfig::NeverResolved => match &self.default_service_config {
                    Some(config) => Some(config.clone()),
                    None => {
                        self.handle_resolution_failure(error);
                        return;
                    }
                },
                PreviousServiceConfig::Config(config) => Some(config.clone()),
                PreviousServiceConfig::Absent => self.default_service_config.clone(),
            },
        };

        let (builder, lb_config) = match self.select_policy(working_config.as_ref()) {
            Ok(selected) => selected,
            Err(status) => {
                self.handle_resolution_failure(status);
                return;
            }
        };
        let name = builder.name();

        let active_name = self.child_mut(Role::Active).map(|c| c.name());
        let pending_name = self.child_mut(Role::Pending).map(|c| c.name());
        let role = if active_name == Some(name) {
            // The config went back to the serving policy; the replacement is
            // no longer wanted.
            self.discard_pending();
            Role::Active
        } else if pending_name == Some(name) {
            Role::Pending
        } else {
            self.install_child(&builder)
        };
        self.update_child(role, addresses, lb_config.as_ref());

        // A replacement for a policy that is not serving takes over at once.
        if let Children::Switching { active, .. } = &self.children {
            if active.state != ConnectivityState::Ready {
                self.switch_over();
            }
        }
    }

    // Picks the first policy in the config that is registered, and parses its
    // configuration.
    fn select_policy(
        &self,
        config: Option<&ServiceConfig>,
    ) -> Result<(Arc<dyn LbPolicyBuilder>, Option<LbConfig>), Status> {
        let entries = config.map_or(&[][..], |c| c.load_balancing_config.as_slice());
        if entries.is_empty() {
            let builder = self
                .lb_registry
                .get_policy(DEFAULT_LB_POLICY_NAME)
                .ok_or_else(|| {
                    Status::unavailable(format!(
                        "default LB policy {DEFAULT_LB_POLICY_NAME} is not registered"
                    ))
                })?;
            return Ok((builder, None));
        }
        for entry in entries {
            let Some(builder) = self.lb_registry.get_policy(&entry.name) else {
                continue;
            };
            let lb_config = builder.parse_config(&entry.config).map_err(|err| {
                Status::unavailable(format!(
                    "failed to parse config for LB policy {}: {}",
                    entry.name, err
                ))
            })?;
            return Ok((builder, lb_config));
        }
        Err(Status::unavailable(
            "All load balancer options in service config are not compatible",
        ))
    }

    fn child_helper(&self, role: Role) -> Arc<dyn ChannelControlHelper> {
        Arc::new(ChildHelper {
            role,
            parent: self.helper.clone(),
            reports: self.reports.clone(),
        })
    }

    fn build_child(&self, builder: &Arc<dyn LbPolicyBuilder>, role: Role) -> ChildPolicy {
        debug!("building {:?} LB policy {}", role, builder.name());
        let policy = builder.build(self.child_helper(role), self.lb_options.clone());
        // An active policy starts out mirroring the balancer's own IDLE state,
        // a replacement is considered to be connecting until it reports.
        let state = match role {
            Role::Active => ConnectivityState::Idle,
            Role::Pending => ConnectivityState::Connecting,
        };
        ChildPolicy {
            policy,
            state,
            picker: Arc::new(QueuingPicker {}),
        }
    }

    // Builds a child for the selected policy.  With no active policy it
    // becomes the active one, otherwise it becomes the pending replacement,
    // destroying any previous replacement first.
    fn install_child(&mut self, builder: &Arc<dyn LbPolicyBuilder>) -> Role {
        self.discard_pending();
        let active = match std::mem::replace(&mut self.children, Children::None) {
            Children::None => None,
            Children::Active(active) | Children::Switching { active, .. } => Some(active),
        };
        match active {
            None => {
                self.children = Children::Active(self.build_child(builder, Role::Active));
                Role::Active
            }
            Some(active) => {
                let pending = self.build_child(builder, Role::Pending);
                self.children = Children::Switching { active, pending };
                Role::Pending
            }
        }
    }

    // Destroys the pending replacement, if any, leaving the active policy
    // alone.
    fn discard_pending(&mut self) {
        match std::mem::replace(&mut self.children, Children::None) {
            Children::Switching {
                active,
                mut pending,
            } => {
                debug!("discarding pending LB policy {}", pending.name());
                pending.policy.destroy();
                self.forget_child(Role::Pending);
                self.children = Children::Active(active);
            }
            other => self.children = other,
        }
    }

    fn child_mut(&mut self, role: Role) -> Option<&mut ChildPolicy> {
        match (&mut self.children, role) {
            (Children::Active(active), Role::Active) => Some(active),
            (Children::Switching { active, .. }, Role::Active) => Some(active),
            (Children::Switching { pending, .. }, Role::Pending) => Some(pending),
            _ => None,
        }
    }

    fn update_child(&mut self, role: Role, addresses: Vec<Address>, config: Option<&LbConfig>) {
        if let Some(child) = self.child_mut(role) {
            if let Err(err) = child.policy.update_address_list(addresses, config) {
                warn!("LB policy {} rejected address update: {}", child.name(), err);
            }
        }
        self.drain_reports();
    }

    // Discards the queued reports and subchannel ownership of one slot.
    fn forget_child(&mut self, role: Role) {
        self.reports.lock().retain(|(r, _)| *r != role);
        self.subchannels.retain(|_, (_, r)| *r != role);
    }

    // Processes reports queued by children, including reports queued while
    // processing earlier ones.
    fn drain_reports(&mut self) {
        loop {
            let next = self.reports.lock().pop_front();
            let Some((role, report)) = next else {
                return;
            };
            match report {
                ChildReport::SubchannelCreated(subchannel) => {
                    self.subchannels.retain(|_, (sc, _)| sc.is_alive());
                    self.subchannels
                        .insert(subchannel.id(), (subchannel, role));
                }
                ChildReport::State(state) => self.on_child_state(role, state),
                ChildReport::Reresolution => self.on_child_reresolution(role),
            }
        }
    }

    fn on_child_state(&mut self, role: Role, state: LbState) {
        let Some(child) = self.child_mut(role) else {
            return;
        };
        child.state = state.connectivity_state;
        child.picker = state.picker.clone();
        let switching = matches!(self.children, Children::Switching { .. });

        match role {
            Role::Active if switching && state.connectivity_state != ConnectivityState::Ready => {
                self.switch_over();
            }
            Role::Active => self.publish(state.connectivity_state, state.picker),
            Role::Pending if state.connectivity_state == ConnectivityState::Ready => {
                self.switch_over();
            }
            Role::Pending => {}
        }
    }

    // Destroys the active policy and promotes the pending replacement.
    fn switch_over(&mut self) {
        let (mut old, mut promoted) = match std::mem::replace(&mut self.children, Children::None) {
            Children::Switching { active, pending } => (active, pending),
            other => {
                self.children = other;
                return;
            }
        };
        debug!(
            "switching LB policy from {} to {}",
            old.name(),
            promoted.name()
        );
        old.policy.destroy();
        self.forget_child(Role::Active);
        for (role, _) in self.reports.lock().iter_mut() {
            *role = Role::Active;
        }
        for (_, role) in self.subchannels.values_mut() {
            *role = Role::Active;
        }
        promoted
            .policy
            .replace_channel_control_helper(self.child_helper(Role::Active));

        let (state, picker) = (promoted.state, promoted.picker.clone());
        self.children = Children::Active(promoted);
        self.publish(state, picker);
    }

    fn on_child_reresolution(&mut self, role: Role) {
        let switching = matches!(self.children, Children::Switching { .. });
        if role == Role::Active && switching {
            return;
        }
        // While backing off, the backoff expiry triggers the next resolution.
        if self.backoff.is_running() {
            debug!("suppressing re-resolution request during backoff");
            return;
        }
        self.update_resolution();
    }

    fn update_resolution(&mut self) {
        if let Some(resolver) = &mut self.resolver {
            resolver.update_resolution();
        }
    }

    fn handle_resolution_failure(&mut self, error: Status) {
        debug!("resolution failed: {}", error);
        if matches!(self.children, Children::None) {
            self.publish(
                ConnectivityState::TransientFailure,
                Arc::new(FailingPicker::new(error)),
            );
        }
        self.backoff.run_once();
    }

    fn on_backoff_expired(&mut self) {
        if matches!(self.children, Children::None) {
            self.publish(ConnectivityState::Idle, Arc::new(QueuingPicker {}));
        } else {
            self.update_resolution();
        }
    }

    fn route_subchannel_update(&mut self, subchannel: &WeakSubchannel, state: &SubchannelState) {
        let Some(role) = self.subchannels.get(&subchannel.id()).map(|(_, role)| *role) else {
            debug!("dropping update for unowned {:?}: {}", subchannel, state);
            return;
        };
        let Some(subchannel) = subchannel.upgrade() else {
            return;
        };
        if let Some(child) = self.child_mut(role) {
            child.policy.subchannel_update(&subchannel, state);
        }
        self.drain_reports();
    }

    fn publish(&mut self, connectivity_state: ConnectivityState, picker: Arc<dyn Picker>) {
        if self.connectivity_state != connectivity_state {
            debug!(
                "resolving load balancer {} -> {}",
                self.connectivity_state, connectivity_state
            );
        }
        self.connectivity_state = connectivity_state;
        let helper = self.helper.lock().clone();
        helper.update_state(connectivity_state, picker);
    }
}

impl LbPolicy for ResolvingLoadBalancer {
    /// Always fails: addresses only ever come from the resolver.
    fn update_address_list(
        &mut self,
        _addresses: Vec<Address>,
        _config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        Err(Box::new(Error::Unsupported {
            operation: "update_address_list",
            component: "ResolvingLoadBalancer",
        }))
    }

    fn subchannel_update(&mut self, subchannel: &Subchannel, state: &SubchannelState) {
        if self.connectivity_state == ConnectivityState::Shutdown {
            return;
        }
        self.route_subchannel_update(&subchannel.downgrade(), state);
    }

    fn exit_idle(&mut self) {
        if self.connectivity_state != ConnectivityState::Idle {
            return;
        }
        self.publish(ConnectivityState::Connecting, Arc::new(QueuingPicker {}));
        self.update_resolution();
        if let Some(active) = self.child_mut(Role::Active) {
            active.policy.exit_idle();
        }
        self.drain_reports();
    }

    fn reset_backoff(&mut self) {
        if self.connectivity_state == ConnectivityState::Shutdown {
            return;
        }
        self.backoff.reset();
        for role in [Role::Active, Role::Pending] {
            if let Some(child) = self.child_mut(role) {
                child.policy.reset_backoff();
            }
        }
        self.drain_reports();
    }

    fn destroy(&mut self) {
        if self.connectivity_state == ConnectivityState::Shutdown {
            return;
        }
        debug!("destroying resolving load balancer");
        match std::mem::replace(&mut self.children, Children::None) {
            Children::None => {}
            Children::Active(mut active) => active.policy.destroy(),
            Children::Switching {
                mut active,
                mut pending,
            } => {
                active.policy.destroy();
                pending.policy.destroy();
            }
        }
        self.reports.lock().clear();
        self.subchannels.clear();
        self.backoff.stop();
        self.resolver = None;
        self.publish(
            ConnectivityState::Shutdown,
            Arc::new(FailingPicker::new(Status::unavailable(
                "channel has been shut down",
            ))),
        );
    }

    fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    fn replace_channel_control_helper(&mut self, helper: Arc<dyn ChannelControlHelper>) {
        *self.helper.lock() = helper;
    }
}
