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

//! The `pick_first` policy: connects to the resolved addresses in order and
//! sends every call to the first one that becomes READY.

use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::load_balancing::{
    ChannelController, Failing, IdlePicker, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    ParsedJsonLbConfig, Pick, PickArgs, PickResult, Picker, QueuingPicker, Subchannel,
    SubchannelId, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::status::Status;

pub static POLICY_NAME: &str = "pick_first";

#[derive(Debug)]
pub struct PickFirstBuilder;

impl LbPolicyBuilder for PickFirstBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(PickFirstPolicy {
            work_scheduler: options.work_scheduler,
            subchannel_list: None,
            selected_subchannel: None,
            addresses: vec![],
            last_resolver_error: None,
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
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg: PickFirstConfig = config
            .convert_to()
            .map_err(|e| format!("failed to parse JSON config: {e}"))?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PickFirstConfig {
    shuffle_address_list: Option<bool>,
}

struct PickFirstPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    // Subchannels we are currently connecting to.
    subchannel_list: Option<SubchannelList>,
    // The currently connected subchannel.
    selected_subchannel: Option<Arc<dyn Subchannel>>,
    // Most recent addresses from the name resolver.
    addresses: Vec<Address>,
    last_resolver_error: Option<String>,
    last_connection_error: Option<Status>,
    connectivity_state: ConnectivityState,
    sent_connecting_state: bool,
}

impl LbPolicy for PickFirstPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        match update.endpoints {
            Ok(mut endpoints) => {
                debug!(endpoints = endpoints.len(), "pick_first received resolver update");
                if let Some(cfg) = config.and_then(|c| c.convert_to::<PickFirstConfig>()) {
                    if cfg.shuffle_address_list.unwrap_or(false) {
                        endpoints.shuffle(&mut rand::rng());
                    }
                }

                let new_addresses = address_list_from_endpoints(&endpoints);
                if new_addresses.is_empty() {
                    self.handle_empty_endpoints(channel_controller);
                    return Err("received empty address list from the name resolver".into());
                }
                self.last_resolver_error = None;

                // A connection to an address that is still present survives
                // the update.
                if let Some(selected) = &self.selected_subchannel {
                    if new_addresses.contains(&selected.address()) {
                        self.addresses = new_addresses;
                        return Ok(());
                    }
                }

                // Start using the new address list unless in IDLE, in which
                // case exit_idle() does so.
                self.addresses = new_addresses;
                if self.connectivity_state != ConnectivityState::Idle {
                    self.selected_subchannel = None;
                    self.start_connecting(channel_controller);
                }
            }
            Err(error) => {
                debug!(%error, "pick_first received resolver error");
                self.last_resolver_error = Some(error);

                // Enter or stay in TF if there is no good previous update from
                // the resolver.  Otherwise keep using the previous update.
                if self.addresses.is_empty()
                    || self.connectivity_state == ConnectivityState::TransientFailure
                {
                    self.move_to_transient_failure(channel_controller);
                }
            }
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        debug!(%subchannel, state = %state.connectivity_state, "pick_first subchannel update");

        if let Some(list) = &self.subchannel_list {
            if list.contains(&subchannel) {
                if state.connectivity_state == ConnectivityState::Ready {
                    self.move_to_ready(subchannel, channel_controller);
                } else {
                    self.update_tracked_subchannel(subchannel, state, channel_controller);
                }
                return;
            }
        }

        // Any state change for the selected subchannel means that we are no
        // longer connected.
        if let Some(selected) = &self.selected_subchannel {
            if **selected == *subchannel && state.connectivity_state != ConnectivityState::Ready {
                self.move_to_idle(channel_controller);
            }
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.connectivity_state == ConnectivityState::Idle {
            self.start_connecting(channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        // Scheduled by the idle picker.
        self.exit_idle(channel_controller);
    }

    fn reset_backoff(&mut self) {
        if let Some(list) = &self.subchannel_list {
            for sc in &list.ordered {
                sc.reset_backoff();
            }
        }
    }
}

impl PickFirstPolicy {
    fn start_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.addresses.is_empty() {
            return;
        }
        let mut list = SubchannelList::new(&self.addresses, channel_controller);
        list.connect_to_next_subchannel();
        self.subchannel_list = Some(list);
        if self.connectivity_state != ConnectivityState::TransientFailure {
            self.move_to_connecting(channel_controller);
        }
    }

    // Resets internal state and moves to TRANSIENT_FAILURE.
    fn handle_empty_endpoints(&mut self, channel_controller: &mut dyn ChannelController) {
        self.subchannel_list = None;
        self.selected_subchannel = None;
        self.addresses = vec![];
        self.last_resolver_error =
            Some("received empty address list from the name resolver".to_string());
        self.move_to_transient_failure(channel_controller);
    }

    fn update_tracked_subchannel(
        &mut self,
        sc: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let Some(list) = self.subchannel_list.as_mut() else {
            return;
        };
        list.states.insert(sc.id(), state.connectivity_state);

        match state.connectivity_state {
            ConnectivityState::Idle => {
                // After the first pass, reconnect as soon as the backoff of a
                // subchannel expires.
                if list.first_pass_complete {
                    sc.connect();
                }
            }
            ConnectivityState::Connecting => {
                if self.connectivity_state == ConnectivityState::Connecting
                    && self.sent_connecting_state
                {
                    return;
                }
                if self.connectivity_state != ConnectivityState::TransientFailure {
                    self.move_to_connecting(channel_controller);
                }
            }
            ConnectivityState::TransientFailure => {
                self.last_connection_error = state.last_connection_error.clone();
                if !list.first_pass_complete {
                    if list.is_current(&sc) && !list.connect_to_next_subchannel() {
                        list.first_pass_complete = true;
                        list.connect_to_all_subchannels();
                        self.move_to_transient_failure(channel_controller);
                    }
                } else if list.all_in_transient_failure() {
                    self.move_to_transient_failure(channel_controller);
                }
            }
            ConnectivityState::Ready | ConnectivityState::Shutdown => {}
        }
    }

    fn move_to_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Idle;
        self.subchannel_list = None;
        self.selected_subchannel = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Idle,
            picker: Arc::new(IdlePicker {
                work_scheduler: self.work_scheduler.clone(),
            }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }

    fn move_to_connecting(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::Connecting;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        });
        self.sent_connecting_state = true;
    }

    fn move_to_ready(
        &mut self,
        sc: Arc<dyn Subchannel>,
        channel_controller: &mut dyn ChannelController,
    ) {
        self.connectivity_state = ConnectivityState::Ready;
        self.selected_subchannel = Some(sc.clone());
        self.subchannel_list = None;
        self.last_connection_error = None;
        self.last_resolver_error = None;
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::Ready,
            picker: Arc::new(OneSubchannelPicker { sc }),
        });
        self.sent_connecting_state = false;
    }

    fn move_to_transient_failure(&mut self, channel_controller: &mut dyn ChannelController) {
        self.connectivity_state = ConnectivityState::TransientFailure;
        let error = match (&self.last_resolver_error, &self.last_connection_error) {
            (Some(res), _) => Status::unavailable(res.clone()),
            (None, Some(conn)) => Status::unavailable(format!(
                "failed to connect to all addresses; last error: {}",
                conn.message()
            )),
            (None, None) => Status::unavailable("failed to connect to all addresses"),
        };
        channel_controller.update_picker(LbState {
            connectivity_state: ConnectivityState::TransientFailure,
            picker: Arc::new(Failing { error }),
        });
        channel_controller.request_resolution();
        self.sent_connecting_state = false;
    }
}

// Flattens the endpoints into an ordered, de-duplicated address list.
fn address_list_from_endpoints(endpoints: &[Endpoint]) -> Vec<Address> {
    let mut uniques = HashSet::new();
    endpoints
        .iter()
        .flat_map(|ep| ep.addresses.iter().cloned())
        .filter(|addr| uniques.insert(addr.clone()))
        .collect()
}

// A picker that always returns the same subchannel.
struct OneSubchannelPicker {
    sc: Arc<dyn Subchannel>,
}

impl Picker for OneSubchannelPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::Pick(Pick::new(self.sc.clone()))
    }
}

// The subchannels created from the most recent address list, connected to
// one at a time during the first pass.
struct SubchannelList {
    ordered: Vec<Arc<dyn Subchannel>>,
    states: HashMap<SubchannelId, ConnectivityState>,
    // Index of the subchannel being connected to, None before the first
    // attempt.
    current: Option<usize>,
    first_pass_complete: bool,
}

impl SubchannelList {
    fn new(addresses: &[Address], channel_controller: &mut dyn ChannelController) -> Self {
        let ordered: Vec<_> = addresses
            .iter()
            .map(|address| channel_controller.new_subchannel(address))
            .collect();
        debug!("created new subchannel list with {} subchannels", ordered.len());
        SubchannelList {
            states: ordered
                .iter()
                .map(|sc| (sc.id(), ConnectivityState::Idle))
                .collect(),
            ordered,
            current: None,
            first_pass_complete: false,
        }
    }

    fn contains(&self, sc: &Arc<dyn Subchannel>) -> bool {
        self.states.contains_key(&sc.id())
    }

    fn is_current(&self, sc: &Arc<dyn Subchannel>) -> bool {
        self.current
            .and_then(|idx| self.ordered.get(idx))
            .is_some_and(|cur| cur.id() == sc.id())
    }

    // Initiates a connection attempt to the next subchannel in the list.
    // Returns false if there are no more subchannels in the list.
    fn connect_to_next_subchannel(&mut self) -> bool {
        let next = self.current.map_or(0, |idx| idx + 1);
        match self.ordered.get(next) {
            Some(sc) => {
                self.current = Some(next);
                sc.connect();
                true
            }
            None => false,
        }
    }

    fn connect_to_all_subchannels(&self) {
        for sc in &self.ordered {
            if self.states.get(&sc.id()) == Some(&ConnectivityState::Idle) {
                sc.connect();
            }
        }
    }

    fn all_in_transient_failure(&self) -> bool {
        self.states
            .values()
            .all(|s| *s == ConnectivityState::TransientFailure)
    }
}
