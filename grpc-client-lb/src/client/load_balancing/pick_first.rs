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

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tonic::Status;
use tracing::{debug, warn};

use crate::client::backoff::ExponentialBackoff;
use crate::client::load_balancing::{
    ChannelControlHelper, FailingPicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, PickResult,
    Picker, QueuingPicker, SubchannelState,
};
use crate::client::name_resolution::Address;
use crate::client::service_config::LbConfig;
use crate::client::subchannel::{Subchannel, SubchannelArgs};
use crate::client::{CallInfo, ConnectivityState};

pub static POLICY_NAME: &str = "pick_first";

pub struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(
        &self,
        helper: Arc<dyn ChannelControlHelper>,
        options: LbPolicyOptions,
    ) -> Box<dyn LbPolicy> {
        let backoff = ExponentialBackoff::new(options.backoff_config).unwrap_or_else(|err| {
            warn!("pick_first falling back to the default backoff: {}", err);
            ExponentialBackoff::default()
        });
        Box::new(PickFirstPolicy {
            helper,
            backoff,
            subchannels: Vec::new(),
            selected: None,
            pass_idx: 0,
            last_connection_error: None,
            connectivity_state: ConnectivityState::Connecting,
            sent_connecting_state: false,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &serde_json::Value,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = serde_json::from_value(config.clone())
            .map_err(|e| format!("failed to parse JSON config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct PickFirstConfig {
    shuffle_address_list: Option<bool>,
}

// Data tracked for each subchannel, one per address, in connection order.
struct SubchannelData {
    subchannel: Subchannel,
    state: ConnectivityState,
    // Whether the subchannel failed during the current connection pass.
    failed: bool,
}

impl SubchannelData {
    fn new(subchannel: Subchannel) -> Self {
        Self {
            subchannel,
            state: ConnectivityState::Idle,
            failed: false,
        }
    }
}

struct PickFirstPolicy {
    helper: Arc<dyn ChannelControlHelper>,
    backoff: ExponentialBackoff, // Paces connection passes after all addresses fail.
    subchannels: Vec<SubchannelData>,
    selected: Option<Subchannel>, // The currently connected subchannel.
    pass_idx: usize,              // Index of the subchannel being attempted.
    last_connection_error: Option<String>,
    connectivity_state: ConnectivityState,
    sent_connecting_state: bool,
}

impl LbPolicy for PickFirstPolicy {
    fn update_address_list(
        &mut self,
        mut addresses: Vec<Address>,
        config: Option<&LbConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        debug!("pick_first received addresses: {:?}", addresses);

        let mut seen = std::collections::HashSet::new();
        addresses.retain(|a| seen.insert(a.clone()));

        let shuffle = config
            .and_then(|c| c.convert_to::<PickFirstConfig>())
            .and_then(|c| c.shuffle_address_list)
            .unwrap_or(false);
        if shuffle {
            addresses.shuffle(&mut rand::rng());
        }

        if addresses.is_empty() {
            self.clear_subchannels();
            self.move_to_transient_failure(Status::unavailable(
                "received empty address list from the name resolver",
            ));
            self.helper.request_reresolution();
            return Err("received empty address list from the name resolver".into());
        }

        // Keep the subchannels of addresses that are still present.
        let mut previous = std::mem::take(&mut self.subchannels);
        for address in &addresses {
            match previous
                .iter()
                .position(|d| d.subchannel.address() == address)
            {
                Some(pos) => self.subchannels.push(previous.remove(pos)),
                None => {
                    let sc = self
                        .helper
                        .create_subchannel(address, &SubchannelArgs::default());
                    self.subchannels.push(SubchannelData::new(sc));
                }
            }
        }
        let mut lost_selected = false;
        for data in previous {
            if self.selected.as_ref() == Some(&data.subchannel) {
                data.subchannel.unref();
                self.selected = None;
                lost_selected = true;
            }
            data.subchannel.close();
        }

        if self.selected.is_some() {
            return Ok(());
        }
        if lost_selected {
            debug!("pick_first selected address removed by the resolver");
        } else if self.connectivity_state == ConnectivityState::Idle {
            // Wait for exit_idle() before connecting again.
            return Ok(());
        }
        self.start_pass();
        Ok(())
    }

    fn subchannel_update(&mut self, subchannel: &Subchannel, state: &SubchannelState) {
        debug!("pick_first received update for {}: {}", subchannel, state);

        // Any state change for the connected subchannel means we are no longer
        // connected.
        if self.selected.as_ref() == Some(subchannel) {
            if state.connectivity_state != ConnectivityState::Ready {
                self.move_to_idle();
            }
            return;
        }

        let Some(idx) = self
            .subchannels
            .iter()
            .position(|d| &d.subchannel == subchannel)
        else {
            debug!("pick_first ignoring update for unknown {}", subchannel);
            return;
        };
        self.subchannels[idx].state = state.connectivity_state;

        match state.connectivity_state {
            ConnectivityState::Ready if self.selected.is_none() => self.move_to_ready(idx),
            ConnectivityState::TransientFailure => {
                self.subchannels[idx].failed = true;
                if let Some(err) = &state.last_connection_error {
                    self.last_connection_error = Some(err.to_string());
                }
                if self.selected.is_none()
                    && idx == self.pass_idx
                    && self.connectivity_state != ConnectivityState::Idle
                    && !self.connect_from(idx + 1)
                {
                    self.on_pass_failed();
                }
            }
            _ => {}
        }
    }

    fn exit_idle(&mut self) {
        if self.connectivity_state == ConnectivityState::Idle {
            self.start_pass();
        }
    }

    fn reset_backoff(&mut self) {
        self.backoff.reset();
        // Retry immediately if a delayed pass is pending.
        if self.selected.is_none()
            && self.connectivity_state == ConnectivityState::TransientFailure
            && self.pass_idx == 0
        {
            if let Some(first) = self.subchannels.first() {
                if first.state == ConnectivityState::TransientFailure {
                    first.subchannel.connect_after(Duration::ZERO);
                }
            }
        }
    }

    fn destroy(&mut self) {
        self.clear_subchannels();
        self.connectivity_state = ConnectivityState::Shutdown;
    }

    fn type_name(&self) -> &'static str {
        POLICY_NAME
    }

    fn replace_channel_control_helper(&mut self, helper: Arc<dyn ChannelControlHelper>) {
        self.helper = helper;
    }
}

impl PickFirstPolicy {
    fn clear_subchannels(&mut self) {
        if let Some(sc) = self.selected.take() {
            sc.unref();
        }
        for data in self.subchannels.drain(..) {
            data.subchannel.close();
        }
    }

    // Starts connecting from the first address.
    fn start_pass(&mut self) {
        if self.subchannels.is_empty() {
            return;
        }
        for data in &mut self.subchannels {
            data.failed = false;
        }
        if self.connectivity_state != ConnectivityState::TransientFailure {
            self.move_to_connecting();
        }
        if !self.connect_from(0) {
            self.on_pass_failed();
        }
    }

    // Attempts the first subchannel at or after `start` that has not failed
    // in this pass.  Returns false if there is none.
    fn connect_from(&mut self, start: usize) -> bool {
        for idx in start..self.subchannels.len() {
            let data = &self.subchannels[idx];
            if data.failed {
                continue;
            }
            match data.state {
                ConnectivityState::Idle | ConnectivityState::TransientFailure => {
                    data.subchannel.connect();
                }
                ConnectivityState::Connecting => {}
                ConnectivityState::Ready => {
                    self.move_to_ready(idx);
                    return true;
                }
                ConnectivityState::Shutdown => continue,
            }
            self.pass_idx = idx;
            return true;
        }
        false
    }

    fn on_pass_failed(&mut self) {
        let error = self
            .last_connection_error
            .as_deref()
            .unwrap_or("no connection attempt succeeded");
        self.move_to_transient_failure(Status::unavailable(format!(
            "failed to connect to all addresses; last error: {error}"
        )));
        self.helper.request_reresolution();

        let delay = self.backoff.backoff_duration();
        debug!("pick_first retrying all addresses in {:?}", delay);
        for data in &mut self.subchannels {
            data.failed = false;
        }
        self.pass_idx = 0;
        if let Some(first) = self.subchannels.first() {
            first.subchannel.connect_after(delay);
        }
    }

    fn move_to_idle(&mut self) {
        let Some(lost) = self.selected.take() else {
            return;
        };
        debug!("pick_first lost connection on {}", lost);
        lost.unref();
        // Subchannels do not reconnect on their own; replace the lost one with
        // a fresh subchannel for the same address.
        if let Some(data) = self
            .subchannels
            .iter_mut()
            .find(|d| d.subchannel == lost)
        {
            let fresh = self
                .helper
                .create_subchannel(lost.address(), &SubchannelArgs::default());
            *data = SubchannelData::new(fresh);
        }
        lost.close();

        self.connectivity_state = ConnectivityState::Idle;
        self.sent_connecting_state = false;
        self.helper
            .update_state(ConnectivityState::Idle, Arc::new(QueuingPicker {}));
        self.helper.request_reresolution();
    }

    fn move_to_connecting(&mut self) {
        if self.connectivity_state == ConnectivityState::Connecting && self.sent_connecting_state {
            return;
        }
        self.connectivity_state = ConnectivityState::Connecting;
        self.sent_connecting_state = true;
        self.helper
            .update_state(ConnectivityState::Connecting, Arc::new(QueuingPicker {}));
    }

    fn move_to_ready(&mut self, idx: usize) {
        let sc = self.subchannels[idx].subchannel.clone();
        debug!("pick_first selected {}", sc);
        sc.add_ref();
        self.selected = Some(sc.clone());
        self.connectivity_state = ConnectivityState::Ready;
        self.sent_connecting_state = false;
        self.last_connection_error = None;
        self.backoff.reset();
        self.helper.update_state(
            ConnectivityState::Ready,
            Arc::new(OneSubchannelPicker { sc }),
        );
    }

    fn move_to_transient_failure(&mut self, error: Status) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        self.sent_connecting_state = false;
        self.helper.update_state(
            ConnectivityState::TransientFailure,
            Arc::new(FailingPicker::new(error)),
        );
    }
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    sc: Subchannel,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _call: &CallInfo) -> PickResult {
        PickResult::Pick(self.sc.clone())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use serde_json::json;
    use tokio::sync::mpsc;
    use tonic::Code;

    use super::{Builder, PickFirstConfig, POLICY_NAME};
    use crate::client::backoff::BackoffConfig;
    use crate::client::load_balancing::test_utils::{
        init_tracing, next_event, TestChannelController, TestEvent,
    };
    use crate::client::load_balancing::{
        LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, PickResult, GLOBAL_LB_REGISTRY,
    };
    use crate::client::name_resolution::Address;
    use crate::client::transport::SessionEvent;
    use crate::client::{CallInfo, ConnectivityState, Subchannel};
    use crate::rt::default_runtime;

    fn setup() -> (
        Box<dyn LbPolicy>,
        Arc<TestChannelController>,
        mpsc::UnboundedReceiver<TestEvent>,
    ) {
        init_tracing();
        let (helper, rx) = TestChannelController::new();
        let policy = Builder {}.build(
            helper.clone(),
            LbPolicyOptions {
                runtime: default_runtime(),
                backoff_config: BackoffConfig::default(),
            },
        );
        (policy, helper, rx)
    }

    // Feeds subchannel updates into the policy until it publishes `want`.
    async fn drive_until(
        policy: &mut dyn LbPolicy,
        rx: &mut mpsc::UnboundedReceiver<TestEvent>,
        want: ConnectivityState,
    ) -> LbState {
        loop {
            match next_event(rx).await {
                TestEvent::SubchannelUpdate(sc, state) => policy.subchannel_update(&sc, &state),
                TestEvent::UpdatePicker(state) if state.connectivity_state == want => {
                    return state;
                }
                _ => {}
            }
        }
    }

    fn picked(state: &LbState) -> Subchannel {
        match state.picker.pick(&CallInfo::new("/svc/Method", "test")) {
            PickResult::Pick(sc) => sc,
            other => panic!("unexpected pick result: {other:?}"),
        }
    }

    fn new_subchannels(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Vec<String> {
        let mut created = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TestEvent::NewSubchannel(sc) = event {
                created.push(sc.address().address.clone());
            }
        }
        created
    }

    #[test]
    fn builder_is_registered_globally() {
        let builder = GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).unwrap();
        assert_eq!(builder.name(), "pick_first");
    }

    #[test]
    fn parse_config() {
        let cfg = Builder {}
            .parse_config(&json!({"shuffleAddressList": true}))
            .unwrap()
            .unwrap();
        let cfg = cfg.convert_to::<PickFirstConfig>().unwrap();
        assert_eq!(cfg.shuffle_address_list, Some(true));

        assert!(Builder {}.parse_config(&json!({"shuffleAddressList": "yes"})).is_err());
    }

    #[tokio::test]
    async fn connects_to_first_address() {
        let (mut policy, helper, mut rx) = setup();
        policy
            .update_address_list(vec![Address::tcp("a:1"), Address::tcp("b:1")], None)
            .unwrap();

        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        let sc = picked(&state);
        assert_eq!(sc.address(), &Address::tcp("a:1"));
        assert_eq!(sc.ref_count(), 1);
        assert_eq!(helper.connector.attempts(), vec!["a:1".to_string()]);
    }

    #[tokio::test]
    async fn falls_through_to_next_address() {
        let (mut policy, helper, mut rx) = setup();
        helper.connector.fail("a:1");
        policy
            .update_address_list(vec![Address::tcp("a:1"), Address::tcp("b:1")], None)
            .unwrap();

        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        assert_eq!(picked(&state).address(), &Address::tcp("b:1"));
        assert_eq!(
            helper.connector.attempts(),
            vec!["a:1".to_string(), "b:1".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn all_addresses_failing_reports_transient_failure_then_retries() {
        let (mut policy, helper, mut rx) = setup();
        helper.connector.fail("a:1");
        helper.connector.fail("b:1");
        policy
            .update_address_list(vec![Address::tcp("a:1"), Address::tcp("b:1")], None)
            .unwrap();

        let state =
            drive_until(policy.as_mut(), &mut rx, ConnectivityState::TransientFailure).await;
        match state.picker.pick(&CallInfo::new("/svc/Method", "test")) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), Code::Unavailable);
                assert!(status.message().contains("connection refused: b:1"));
            }
            other => panic!("unexpected pick result: {other:?}"),
        }
        assert!(matches!(next_event(&mut rx).await, TestEvent::RequestResolution));

        helper.connector.succeed("b:1");
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        assert_eq!(picked(&state).address(), &Address::tcp("b:1"));
    }

    #[tokio::test]
    async fn surviving_addresses_keep_their_subchannels() {
        let (mut policy, _helper, mut rx) = setup();
        policy
            .update_address_list(vec![Address::tcp("a:1"), Address::tcp("b:1")], None)
            .unwrap();
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        let selected = picked(&state);

        policy
            .update_address_list(
                vec![
                    Address::tcp("b:1"),
                    Address::tcp("a:1"),
                    Address::tcp("c:1"),
                ],
                None,
            )
            .unwrap();
        assert_eq!(new_subchannels(&mut rx), vec!["c:1".to_string()]);
        assert_eq!(selected.connectivity_state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn removing_selected_address_reconnects() {
        let (mut policy, _helper, mut rx) = setup();
        policy
            .update_address_list(vec![Address::tcp("a:1")], None)
            .unwrap();
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        let old = picked(&state);

        policy
            .update_address_list(vec![Address::tcp("b:1")], None)
            .unwrap();
        assert_eq!(old.connectivity_state(), ConnectivityState::Shutdown);
        assert_eq!(old.ref_count(), 0);
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        assert_eq!(picked(&state).address(), &Address::tcp("b:1"));
    }

    #[tokio::test]
    async fn connection_loss_goes_idle_and_requests_reresolution() {
        let (mut policy, helper, mut rx) = setup();
        policy
            .update_address_list(vec![Address::tcp("a:1")], None)
            .unwrap();
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        let old = picked(&state);

        helper
            .connector
            .session("a:1")
            .unwrap()
            .disconnect(SessionEvent::GoAway("shutting down".to_string()));
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Idle).await;
        assert!(matches!(
            state.picker.pick(&CallInfo::new("/svc/Method", "test")),
            PickResult::Queue
        ));
        assert!(matches!(next_event(&mut rx).await, TestEvent::RequestResolution));
        assert_eq!(old.connectivity_state(), ConnectivityState::Shutdown);

        // Nothing reconnects until asked to.
        assert_eq!(helper.connector.attempts().len(), 1);
        policy.exit_idle();
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        let fresh = picked(&state);
        assert_eq!(fresh.address(), &Address::tcp("a:1"));
        assert_ne!(fresh, old);
    }

    #[tokio::test]
    async fn empty_address_list_is_rejected() {
        let (mut policy, _helper, mut rx) = setup();
        assert!(policy.update_address_list(vec![], None).is_err());
        let state =
            drive_until(policy.as_mut(), &mut rx, ConnectivityState::TransientFailure).await;
        assert!(matches!(
            state.picker.pick(&CallInfo::new("/svc/Method", "test")),
            PickResult::Fail(_)
        ));
        assert!(matches!(next_event(&mut rx).await, TestEvent::RequestResolution));
    }

    #[tokio::test]
    async fn destroy_closes_subchannels() {
        let (mut policy, _helper, mut rx) = setup();
        policy
            .update_address_list(vec![Address::tcp("a:1"), Address::tcp("b:1")], None)
            .unwrap();
        let state = drive_until(policy.as_mut(), &mut rx, ConnectivityState::Ready).await;
        let selected = picked(&state);
        policy.destroy();
        assert_eq!(selected.connectivity_state(), ConnectivityState::Shutdown);
        assert_eq!(selected.ref_count(), 0);
    }
}
