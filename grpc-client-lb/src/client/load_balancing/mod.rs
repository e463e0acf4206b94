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

//! The contract between the channel and load balancing policies.
//!
//! Every stateful component publishes its state as an [`LbState`]: a
//! connectivity state paired with a [`Picker`].  A new report fully supersedes
//! the previous one.  Parents hand children a [`ChannelControlHelper`] through
//! which the child creates subchannels, publishes state and requests
//! re-resolution without knowing who its parent is.

use std::{error::Error, fmt::Display, sync::Arc};

use tonic::Status;

use crate::client::{
    CallInfo, ConnectivityState,
    backoff::BackoffConfig,
    name_resolution::Address,
    service_config::LbConfig,
    subchannel::{Subchannel, SubchannelArgs},
};
use crate::rt::Runtime;

pub mod pick_first;
mod registry;
#[cfg(test)]
pub(crate) mod test_utils;

pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

/// The name of the policy used when the service config does not select one.
pub static DEFAULT_LB_POLICY_NAME: &str = pick_first::POLICY_NAME;

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
#[derive(Clone)]
pub struct LbPolicyOptions {
    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,

    /// The backoff used by policies that pace their own reconnection
    /// attempts.
    pub backoff_config: BackoffConfig,
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance which reports through
    /// `helper`.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's update_address_list method.
    fn build(
        &self,
        helper: Arc<dyn ChannelControlHelper>,
        options: LbPolicyOptions,
    ) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &serde_json::Value,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.  All methods are called serially by the owner of the policy, and a
/// policy reports back only through the helper it currently holds.
pub trait LbPolicy: Send {
    /// Called when the name resolver produces a new address list, along with
    /// the configuration parsed for this policy from the service config.
    fn update_address_list(
        &mut self,
        addresses: Vec<Address>,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called when any subchannel created by the LB policy changes state.
    fn subchannel_update(&mut self, subchannel: &Subchannel, state: &SubchannelState);

    /// Asks an idle policy to start connecting.
    fn exit_idle(&mut self);

    /// Resets any connection backoff so the next attempt happens immediately.
    fn reset_backoff(&mut self);

    /// Releases every subchannel the policy holds.  No reports may be made
    /// through the helper afterwards.
    fn destroy(&mut self);

    /// Reports the registered name of the policy.
    fn type_name(&self) -> &'static str;

    /// Points the policy at a different helper.  Subsequent reports go to
    /// the new helper only.
    fn replace_channel_control_helper(&mut self, helper: Arc<dyn ChannelControlHelper>);
}

/// The capabilities a parent grants a child policy.
pub trait ChannelControlHelper: Send + Sync {
    /// Creates a new subchannel in IDLE state.
    fn create_subchannel(&self, address: &Address, args: &SubchannelArgs) -> Subchannel;

    /// Provides a new snapshot of the child's state to its parent.
    fn update_state(&self, connectivity_state: ConnectivityState, picker: Arc<dyn Picker>);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_reresolution(&self);
}

/// Represents the current state of a Subchannel.
#[derive(Clone, Debug)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    /// Describes the most recent connection error when the connection attempt
    /// failed or an established connection was lost.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl SubchannelState {
    pub(crate) fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }

    pub(crate) fn with_error(connectivity_state: ConnectivityState, error: String) -> Self {
        let error: Box<dyn Error + Send + Sync> = Box::from(error);
        Self {
            connectivity_state,
            last_connection_error: Some(Arc::from(error)),
        }
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connectivity_state: {}", self.connectivity_state)?;
        if let Some(err) = &self.last_connection_error {
            write!(f, ", last_connection_error: {err}")?;
        }
        Ok(())
    }
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is immutable once published; when its decisions become
/// stale the policy publishes a new one.  If pick() returns Queue, the channel
/// will queue the RPC until a new Picker is produced and will call pick() on
/// the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle or Connecting, the Picker should return a
/// Queue result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure or Shutdown, the Picker should
/// return a Fail result with an error that describes why connections are
/// failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the call.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced.
    fn pick(&self, call: &CallInfo) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel should be used for the call.
    Pick(Subchannel),
    /// Indicates the call should wait for the next Picker.
    Queue,
    /// Indicates that the call should fail immediately with the included
    /// status.
    Fail(Status),
}

impl std::fmt::Debug for PickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pick(sc) => write!(f, "Pick({sc})"),
            Self::Queue => write!(f, "Queue"),
            Self::Fail(st) => write!(f, "Fail({st})"),
        }
    }
}

/// A connectivity state published together with the picker that goes with
/// it.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns the state a channel starts in: Idle, with a picker that
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

impl std::fmt::Debug for LbState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LbState({})", self.connectivity_state)
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not Idle or
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _call: &CallInfo) -> PickResult {
        PickResult::Queue
    }
}

/// FailingPicker fails every call with the same status.
pub struct FailingPicker {
    pub error: Status,
}

impl FailingPicker {
    pub fn new(error: Status) -> Self {
        Self { error }
    }
}

impl Picker for FailingPicker {
    fn pick(&self, _call: &CallInfo) -> PickResult {
        PickResult::Fail(self.error.clone())
    }
}

#[cfg(test)]
mod tests {
    use tonic::{Code, Status};

    use super::{FailingPicker, LbState, PickResult, Picker, QueuingPicker};
    use crate::client::{CallInfo, ConnectivityState};

    #[test]
    fn initial_state_queues() {
        let state = LbState::initial();
        assert_eq!(state.connectivity_state, ConnectivityState::Idle);
        let call = CallInfo::new("/svc/Method", "localhost");
        assert!(matches!(state.picker.pick(&call), PickResult::Queue));
        assert!(matches!(QueuingPicker {}.pick(&call), PickResult::Queue));
    }

    #[test]
    fn failing_picker_carries_status() {
        let picker = FailingPicker::new(Status::unavailable("no addresses"));
        match picker.pick(&CallInfo::new("/svc/Method", "localhost")) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), Code::Unavailable);
                assert_eq!(status.message(), "no addresses");
            }
            other => panic!("unexpected pick result: {other:?}"),
        }
    }
}
