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

//! The `round_robin` policy: keeps a connection to every resolved address and
//! spreads calls across the READY ones.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, Pick,
    PickArgs, PickResult, Picker, QueuingPicker, Subchannel, SubchannelId, SubchannelState,
    TraceSeverity,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::status::Status;

pub static POLICY_NAME: &str = "round_robin";

#[derive(Debug)]
pub struct RoundRobinBuilder;

impl LbPolicyBuilder for RoundRobinBuilder {
    fn build(&self, _options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(RoundRobinPolicy {
            subchannels: Vec::new(),
            states: HashMap::new(),
            connectivity_state: ConnectivityState::Connecting,
            last_resolver_error: None,
            last_connection_error: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct RoundRobinPolicy {
    // One subchannel per address, in resolver order.
    subchannels: Vec<Arc<dyn Subchannel>>,
    states: HashMap<SubchannelId, ConnectivityState>,
    connectivity_state: ConnectivityState,
    last_resolver_error: Option<String>,
    last_connection_error: Option<Status>,
}

impl LbPolicy for RoundRobinPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        _config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let endpoints = match update.endpoints {
            Ok(endpoints) => endpoints,
            Err(error) => {
                debug!(%error, "round_robin received resolver error");
                self.last_resolver_error = Some(error);
                if self.subchannels.is_empty() {
                    self.move_to_transient_failure(channel_controller);
                }
                return Ok(());
            }
        };

        let mut uniques = HashSet::new();
        let addresses: Vec<Address> = endpoints
            .iter()
            .flat_map(|ep| ep.addresses.iter().cloned())
            .filter(|addr| uniques.insert(addr.clone()))
            .collect();
        debug!(addresses = addresses.len(), "round_robin received resolver update");

        if addresses.is_empty() {
            self.subchannels.clear();
            self.states.clear();
            self.last_resolver_error =
                Some("received empty address list from the name resolver".to_string());
            self.move_to_transient_failure(channel_controller);
            return Err("received empty address list from the name resolver".into());
        }
        self.last_resolver_error = None;

        // Keep subchannels for addresses that are still present.
        let mut existing: HashMap<Address, Arc<dyn Subchannel>> = self
            .subchannels
            .drain(..)
            .map(|sc| (sc.address(), sc))
            .collect();
        let mut states = HashMap::new();
        for address in &addresses {
            let sc = match existing.remove(address) {
                Some(sc) => sc,
                None => {
                    let sc = channel_controller.new_subchannel(address);
                    sc.connect();
                    sc
                }
            };
            let state = self
                .states
                .get(&sc.id())
                .copied()
                .unwrap_or(ConnectivityState::Idle);
            states.insert(sc.id(), state);
            self.subchannels.push(sc);
        }
        if !existing.is_empty() {
            channel_controller.add_trace_event(
                TraceSeverity::Info,
                &format!("round_robin removed {} subchannels", existing.len()),
            );
        }
        self.states = states;
        self.update_aggregate_state(channel_controller, true);
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(entry) = self.states.get_mut(&subchannel.id()) else {
            // Stale update from a subchannel that was removed.
            return;
        };
        debug!(%subchannel, state = %state.connectivity_state, "round_robin subchannel update");
        let old = std::mem::replace(entry, state.connectivity_state);
        match state.connectivity_state {
            ConnectivityState::Idle => {
                subchannel.connect();
                if old == ConnectivityState::Ready {
                    channel_controller.request_resolution();
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
                channel_controller.request_resolution();
            }
            _ => {}
        }
        self.update_aggregate_state(channel_controller, false);
    }

    fn exit_idle(&mut self, _channel_controller: &mut dyn ChannelController) {
        for sc in &self.subchannels {
            if self.states.get(&sc.id()) == Some(&ConnectivityState::Idle) {
                sc.connect();
            }
        }
    }

    fn work(&mut self, _channel_controller: &mut dyn ChannelController) {}

    fn reset_backoff(&mut self) {
        for sc in &self.subchannels {
            sc.reset_backoff();
        }
    }
}

impl RoundRobinPolicy {
    // READY if any subchannel is READY, else CONNECTING if any is connecting
    // or idle, else TRANSIENT_FAILURE.  Once in TRANSIENT_FAILURE the policy
    // stays there until a subchannel becomes READY or a new address list
    // arrives.
    fn update_aggregate_state(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        new_addresses: bool,
    ) {
        let ready: Vec<Arc<dyn Subchannel>> = self
            .subchannels
            .iter()
            .filter(|sc| self.states.get(&sc.id()) == Some(&ConnectivityState::Ready))
            .cloned()
            .collect();
        if !ready.is_empty() {
            self.connectivity_state = ConnectivityState::Ready;
            let next = rand::rng().random_range(0..ready.len());
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Ready,
                picker: Arc::new(RoundRobinPicker {
                    subchannels: ready,
                    next: AtomicUsize::new(next),
                }),
            });
            return;
        }

        let connecting = self.states.values().any(|s| {
            matches!(
                s,
                ConnectivityState::Connecting | ConnectivityState::Idle
            )
        });
        if connecting {
            if self.connectivity_state == ConnectivityState::TransientFailure && !new_addresses {
                return;
            }
            if self.connectivity_state == ConnectivityState::Connecting && !new_addresses {
                return;
            }
            self.connectivity_state = ConnectivityState::Connecting;
            channel_controller.update_picker(LbState {
                connectivity_state: ConnectivityState::Connecting,
                picker: Arc::new(QueuingPicker {}),
            });
            return;
        }
        self.move_to_transient_failure(channel_controller);
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let error = match (&self.last_resolver_error, &self.last_connection_error) {
            (Some(res), _) => Status::unavailable(res.clone()),
            (None, Some(conn)) => Status::unavailable(format!(
                "connections to all backends failing; last error: {}",
                conn.message()
            )),
            (None, None) => Status::unavailable("connections to all backends failing"),
        };
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
    }
}

struct RoundRobinPicker {
    subchannels: Vec<Arc<dyn Subchannel>>,
    next: AtomicUsize,
}

impl Picker for RoundRobinPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.subchannels.len();
        PickResult::Pick(Pick::new(self.subchannels[idx].clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::test_utils::{
        TestChannelController, TestEvent, drain, pick, test_harness,
    };
    use tokio::sync::mpsc::UnboundedReceiver;

    fn build() -> (
        Box<dyn LbPolicy>,
        TestChannelController,
        UnboundedReceiver<TestEvent>,
    ) {
        let (controller, scheduler, rx) = test_harness();
        let policy = RoundRobinBuilder.build(LbPolicyOptions {
            work_scheduler: scheduler,
            channel_args: Default::default(),
        });
        (policy, controller, rx)
    }

    fn subchannels_of(events: &[TestEvent]) -> Vec<Arc<dyn Subchannel>> {
        events
            .iter()
            .filter_map(|e| match e {
                TestEvent::NewSubchannel(sc) => Some(sc.clone()),
                _ => None,
            })
            .collect()
    }

    fn last_picker(events: Vec<TestEvent>) -> Option<LbState> {
        events.into_iter().rev().find_map(|e| match e {
            TestEvent::UpdatePicker(state) => Some(state),
            _ => None,
        })
    }

    fn ready() -> SubchannelState {
        SubchannelState::new(ConnectivityState::Ready)
    }

    #[test]
    fn spreads_picks_across_ready_subchannels() {
        let (mut policy, mut cc, mut rx) = build();
        let update = ResolverUpdate::from_addresses([Address::tcp("a:1"), Address::tcp("b:2")]);
        policy.resolver_update(update, None, &mut cc).unwrap();
        let events = drain(&mut rx);
        let scs = subchannels_of(&events);
        assert_eq!(scs.len(), 2);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, TestEvent::Connect(_)))
                .count(),
            2
        );
        assert_eq!(
            last_picker(events).unwrap().connectivity_state,
            ConnectivityState::Connecting
        );

        policy.subchannel_update(scs[0].clone(), &ready(), &mut cc);
        policy.subchannel_update(scs[1].clone(), &ready(), &mut cc);
        let state = last_picker(drain(&mut rx)).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);

        let mut picked = HashSet::new();
        for _ in 0..4 {
            match pick(&state, "/s/m") {
                PickResult::Pick(p) => {
                    picked.insert(p.subchannel.address());
                }
                other => panic!("unexpected pick result {other:?}"),
            }
        }
        assert_eq!(picked.len(), 2);
    }

    #[test]
    fn empty_update_reports_transient_failure() {
        let (mut policy, mut cc, mut rx) = build();
        assert!(
            policy
                .resolver_update(ResolverUpdate::default(), None, &mut cc)
                .is_err()
        );
        let state = last_picker(drain(&mut rx)).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        assert!(matches!(pick(&state, "/s/m"), PickResult::Fail(_)));
    }

    #[test]
    fn reuses_subchannels_for_unchanged_addresses() {
        let (mut policy, mut cc, mut rx) = build();
        let update = ResolverUpdate::from_addresses([Address::tcp("a:1")]);
        policy.resolver_update(update, None, &mut cc).unwrap();
        let first = subchannels_of(&drain(&mut rx)).remove(0);
        policy.subchannel_update(first.clone(), &ready(), &mut cc);
        drain(&mut rx);

        let update = ResolverUpdate::from_addresses([Address::tcp("a:1"), Address::tcp("b:2")]);
        policy.resolver_update(update, None, &mut cc).unwrap();
        let events = drain(&mut rx);
        let created = subchannels_of(&events);
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].address(), Address::tcp("b:2"));
        // a:1 is still READY, so the picker keeps serving it.
        let state = last_picker(events).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);
        match pick(&state, "/s/m") {
            PickResult::Pick(p) => assert_eq!(*p.subchannel, *first),
            other => panic!("unexpected pick result {other:?}"),
        }
    }

    #[test]
    fn all_failing_is_sticky_until_ready() {
        let (mut policy, mut cc, mut rx) = build();
        let update = ResolverUpdate::from_addresses([Address::tcp("a:1")]);
        policy.resolver_update(update, None, &mut cc).unwrap();
        let sc = subchannels_of(&drain(&mut rx)).remove(0);

        let failure = SubchannelState {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(Status::unavailable("refused")),
        };
        policy.subchannel_update(sc.clone(), &failure, &mut cc);
        let events = drain(&mut rx);
        assert!(
            events
                .iter()
                .any(|e| matches!(e, TestEvent::RequestResolution))
        );
        let state = last_picker(events).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);

        // Backoff expires: the subchannel goes IDLE and is reconnected, but
        // the policy keeps reporting the failure.
        policy.subchannel_update(
            sc.clone(),
            &SubchannelState::new(ConnectivityState::Idle),
            &mut cc,
        );
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, TestEvent::Connect(_))));
        assert!(last_picker(events).is_none());

        policy.subchannel_update(sc, &ready(), &mut cc);
        let state = last_picker(drain(&mut rx)).unwrap();
        assert_eq!(state.connectivity_state, ConnectivityState::Ready);
    }
}
