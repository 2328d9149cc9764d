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

//! The control plane.  Everything here runs on the channel's work queue, one
//! item at a time.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tonic::async_trait;
use tracing::{debug, error, info, warn};

use super::data_plane::ResolvedConfig;
use super::{ChannelInfo, ChannelShared, shutdown_status};
use crate::client::channel_args::{
    ChannelArgs, HEALTH_CHECK_SERVICE_NAME, LB_POLICY_NAME, SERVER_URI,
};
use crate::client::config_selector::{ConfigSelector, DefaultConfigSelector, selectors_equal};
use crate::client::load_balancing::{
    self, Failing, IdlePicker, LbPolicy, LbPolicyOptions, LbPolicyRegistry, LbState, Picker,
    QueuingPicker, Subchannel, SubchannelId, SubchannelState, TraceSeverity,
};
use crate::client::name_resolution::{
    self, Address, Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate, Target,
};
use crate::client::retry_throttle::RetryThrottleMap;
use crate::client::service_config::ServiceConfig;
use crate::client::subchannel::{
    ConnectedSubchannel, SubchannelKey, SubchannelPool, SubchannelWrapper,
};
use crate::client::transport::{ConnectedTransport, Transport, TransportOptions, TransportRegistry};
use crate::client::{ChannelContext, ConnectivityState};
use crate::status::Status;

const DEFAULT_LB_POLICY: &str = "pick_first";

pub(crate) enum WorkQueueItem {
    Closure(Box<dyn FnOnce(&mut InternalChannelController) + Send>),
    // Generations let work requested by a torn-down resolver or policy be
    // dropped instead of reaching its replacement.
    ScheduleResolverWork(u64),
    ScheduleLbWork(u64),
    Shutdown,
}

pub(crate) type WorkQueueTx = mpsc::UnboundedSender<WorkQueueItem>;

struct ResolverWorkScheduler {
    work_queue: WorkQueueTx,
    generation: u64,
}

impl name_resolution::WorkScheduler for ResolverWorkScheduler {
    fn schedule_work(&self) {
        let _ = self
            .work_queue
            .send(WorkQueueItem::ScheduleResolverWork(self.generation));
    }
}

struct LbWorkScheduler {
    work_queue: WorkQueueTx,
    generation: u64,
}

impl load_balancing::WorkScheduler for LbWorkScheduler {
    fn schedule_work(&self) {
        let _ = self
            .work_queue
            .send(WorkQueueItem::ScheduleLbWork(self.generation));
    }
}

// Backs the picker installed while the whole channel is idle.
struct ExitIdleScheduler {
    work_queue: WorkQueueTx,
}

impl load_balancing::WorkScheduler for ExitIdleScheduler {
    fn schedule_work(&self) {
        let _ = self.work_queue.send(WorkQueueItem::Closure(Box::new(
            |c: &mut InternalChannelController| c.exit_idle(),
        )));
    }
}

/// Handed to an LB policy that asks for a subchannel after shutdown began.
struct ShutdownSubchannel {
    id: SubchannelId,
    address: Address,
}

impl Subchannel for ShutdownSubchannel {
    fn id(&self) -> SubchannelId {
        self.id
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {}
}

impl std::fmt::Display for ShutdownSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShutdownSubchannel({})", self.address)
    }
}

/// Stands in for a missing transport so that the failure shows up as a
/// subchannel connection error.
struct UnsupportedTransport {
    error: String,
}

#[async_trait]
impl Transport for UnsupportedTransport {
    async fn connect(
        &self,
        _address: &Address,
        _options: &TransportOptions,
    ) -> Result<ConnectedTransport, Status> {
        Err(Status::unavailable(self.error.clone()))
    }
}

struct ActiveLbPolicy {
    name: String,
    generation: u64,
    policy: Box<dyn LbPolicy>,
}

pub(super) struct ControllerParams {
    pub(super) shared: Arc<ChannelShared>,
    pub(super) target: Target,
    pub(super) authority: String,
    pub(super) resolver_builder: Arc<dyn ResolverBuilder>,
    pub(super) context: ChannelContext,
    pub(super) subchannel_pool: Arc<SubchannelPool>,
    pub(super) channel_args: ChannelArgs,
    pub(super) default_service_config: Arc<ServiceConfig>,
    pub(super) keepalive_time: Option<Duration>,
}

/// Owns the resolver, the LB policy and the channel's subchannel wrappers.
pub(crate) struct InternalChannelController {
    shared: Arc<ChannelShared>,
    target: Target,
    authority: String,
    resolver_builder: Arc<dyn ResolverBuilder>,
    lb_policies: Arc<LbPolicyRegistry>,
    transports: Arc<TransportRegistry>,
    retry_throttle: Arc<RetryThrottleMap>,
    subchannel_pool: Arc<SubchannelPool>,
    channel_args: ChannelArgs,
    default_service_config: Arc<ServiceConfig>,
    keepalive_time: Option<Duration>,

    resolver: Option<Box<dyn Resolver>>,
    resolver_generation: u64,
    lb_policy: Option<ActiveLbPolicy>,
    lb_generation: u64,
    saved_service_config: Option<Arc<ServiceConfig>>,
    saved_config_selector: Option<Arc<dyn ConfigSelector>>,
    subchannels: HashMap<SubchannelId, Weak<SubchannelWrapper>>,
    // Connected-subchannel changes waiting for the next picker swap.
    pending_connected: Vec<(SubchannelId, Option<Arc<ConnectedSubchannel>>)>,
    shutdown: bool,
}

impl InternalChannelController {
    pub(super) fn new(params: ControllerParams) -> Self {
        let ControllerParams {
            shared,
            target,
            authority,
            resolver_builder,
            context,
            subchannel_pool,
            channel_args,
            default_service_config,
            keepalive_time,
        } = params;
        Self {
            shared,
            target,
            authority,
            resolver_builder,
            lb_policies: context.lb_policies,
            transports: context.transports,
            retry_throttle: context.retry_throttle,
            subchannel_pool,
            channel_args,
            default_service_config,
            keepalive_time,
            resolver: None,
            resolver_generation: 0,
            lb_policy: None,
            lb_generation: 0,
            saved_service_config: None,
            saved_config_selector: None,
            subchannels: HashMap::new(),
            pending_connected: Vec::new(),
            shutdown: false,
        }
    }

    /// Drains the work queue until the channel shuts down.
    pub(super) async fn run(mut self, mut work_rx: mpsc::UnboundedReceiver<WorkQueueItem>) {
        while let Some(item) = work_rx.recv().await {
            match item {
                WorkQueueItem::Closure(f) => f(&mut self),
                WorkQueueItem::ScheduleResolverWork(generation) => self.resolver_work(generation),
                WorkQueueItem::ScheduleLbWork(generation) => self.lb_work(generation),
                WorkQueueItem::Shutdown => self.shutdown(),
            }
            if self.shutdown {
                break;
            }
        }
        debug!(channel = %self.shared.target, "control plane stopped");
    }

    fn resolver_work(&mut self, generation: u64) {
        if generation != self.resolver_generation {
            return;
        }
        let Some(mut resolver) = self.resolver.take() else {
            return;
        };
        resolver.work(&mut ResolverHelper { controller: self });
        if !self.shutdown && generation == self.resolver_generation {
            self.resolver = Some(resolver);
        }
    }

    fn lb_work(&mut self, generation: u64) {
        if self
            .lb_policy
            .as_ref()
            .is_some_and(|p| p.generation == generation)
        {
            self.with_lb_policy(|policy, helper| policy.work(helper));
        }
    }

    /// Runs `f` against the active LB policy, if there is one.
    fn with_lb_policy<R>(
        &mut self,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn load_balancing::ChannelController) -> R,
    ) -> Option<R> {
        let mut active = self.lb_policy.take()?;
        let result = f(active.policy.as_mut(), &mut LbHelper { controller: self });
        if !self.shutdown && self.lb_policy.is_none() {
            self.lb_policy = Some(active);
        }
        Some(result)
    }

    fn on_resolver_result(&mut self, update: ResolverUpdate) -> Result<(), String> {
        if self.shutdown {
            return Ok(());
        }
        debug!(
            channel = %self.shared.target,
            endpoints = ?update.endpoints.as_ref().map(Vec::len),
            note = ?update.resolution_note,
            "resolver result"
        );

        let service_config = match &update.service_config {
            Ok(Some(sc)) => sc.clone(),
            Ok(None) => self.default_service_config.clone(),
            Err(e) => match &self.saved_service_config {
                Some(saved) => {
                    warn!(
                        channel = %self.shared.target,
                        error = %e,
                        "resolver returned an invalid service config, keeping the previous one"
                    );
                    saved.clone()
                }
                None => {
                    let error = format!("invalid service config: {e}");
                    self.on_resolver_error(Status::unavailable(error.clone()));
                    return Err(error);
                }
            },
        };

        if let Err(e) = &update.endpoints {
            if self.lb_policy.is_none() {
                let error = e.clone();
                self.on_resolver_error(Status::unavailable(format!(
                    "name resolution failed: {error}"
                )));
                return Err(error);
            }
        }

        let (policy_name, from_service_config) =
            self.choose_lb_policy(&service_config, &update.args);
        let lb_config = if from_service_config {
            service_config.lb_policy().and_then(|s| s.config.clone())
        } else {
            None
        };
        if self
            .lb_policy
            .as_ref()
            .is_none_or(|active| active.name != policy_name)
        {
            self.create_lb_policy(&policy_name)?;
        }

        let config_selector = update.config_selector.clone();
        let changed = self
            .saved_service_config
            .as_ref()
            .is_none_or(|saved| saved.json_string() != service_config.json_string())
            || !selectors_equal(
                self.saved_config_selector.as_ref(),
                config_selector.as_ref(),
            );
        if changed {
            debug!(
                channel = %self.shared.target,
                service_config = service_config.json_string(),
                "service config changed"
            );
            self.saved_service_config = Some(service_config.clone());
            self.saved_config_selector = config_selector.clone();
        }
        self.update_channel_info();

        let result = self
            .with_lb_policy(|policy, helper| {
                policy.resolver_update(update, lb_config.as_ref(), helper)
            })
            .unwrap_or(Ok(()))
            .map_err(|e| e.to_string());

        if changed {
            let config_selector = config_selector.unwrap_or_else(|| {
                Arc::new(DefaultConfigSelector::new(service_config.clone()))
            });
            let retry_throttler = service_config
                .retry_throttling()
                .map(|config| self.retry_throttle.get(self.target.server_name(), config));
            self.shared.set_resolved_config(Some(ResolvedConfig {
                config_selector,
                retry_throttler,
            }));
        }
        result
    }

    // Returns the policy name and whether it came from the service config's
    // loadBalancingConfig.
    fn choose_lb_policy(&self, service_config: &ServiceConfig, args: &ChannelArgs) -> (String, bool) {
        if let Some(selection) = service_config.lb_policy() {
            return (selection.name.clone(), true);
        }
        if let Some(name) = service_config.deprecated_lb_policy_name() {
            let name = name.to_ascii_lowercase();
            if self.lb_policies.get_policy(&name).is_some() {
                return (name, false);
            }
            warn!(channel = %self.shared.target, policy = %name, "unknown loadBalancingPolicy");
        }
        if let Some(name) = args
            .get_str(LB_POLICY_NAME)
            .or_else(|| self.channel_args.get_str(LB_POLICY_NAME))
        {
            if self.lb_policies.get_policy(name).is_some() {
                return (name.to_string(), false);
            }
            warn!(channel = %self.shared.target, policy = %name, "unknown LB policy in channel args");
        }
        (DEFAULT_LB_POLICY.to_string(), false)
    }

    fn create_lb_policy(&mut self, name: &str) -> Result<(), String> {
        let Some(builder) = self.lb_policies.get_policy(name) else {
            return Err(format!("LB policy {name} is not registered"));
        };
        self.lb_generation += 1;
        let policy = builder.build(LbPolicyOptions {
            work_scheduler: Arc::new(LbWorkScheduler {
                work_queue: self.shared.work_queue.clone(),
                generation: self.lb_generation,
            }),
            channel_args: self.channel_args.clone(),
        });
        debug!(
            channel = %self.shared.target,
            policy = name,
            previous = ?self.lb_policy.as_ref().map(|p| p.name.as_str()),
            "creating LB policy"
        );
        // Dropping the old policy releases its subchannels.
        self.lb_policy = Some(ActiveLbPolicy {
            name: name.to_string(),
            generation: self.lb_generation,
            policy,
        });
        Ok(())
    }

    fn on_resolver_error(&mut self, error: Status) {
        // An existing policy keeps owning the channel state.
        if self.lb_policy.is_some() {
            return;
        }
        debug!(channel = %self.shared.target, %error, "resolver error");
        self.update_state_and_picker(
            ConnectivityState::TransientFailure,
            Some(error.clone()),
            Arc::new(Failing {
                error: error.clone(),
            }),
            "resolver error",
        );
        self.shared.set_resolver_error(error);
    }

    fn update_state_and_picker(
        &mut self,
        state: ConnectivityState,
        status: Option<Status>,
        picker: Arc<dyn Picker>,
        reason: &str,
    ) {
        debug!(channel = %self.shared.target, %state, reason, "channel state update");
        self.shared.tracker.set_state(state, status, reason);
        let connected_updates = std::mem::take(&mut self.pending_connected);
        self.shared.update_picker(picker, connected_updates);
    }

    fn update_channel_info(&self) {
        self.shared.info.store(Arc::new(ChannelInfo {
            lb_policy_name: self.lb_policy.as_ref().map(|p| p.name.clone()),
            service_config_json: self
                .saved_service_config
                .as_ref()
                .map(|sc| sc.json_string().to_string()),
        }));
    }

    /// Starts resolving if the channel is idle; otherwise asks the LB policy
    /// to reconnect.
    pub(crate) fn exit_idle(&mut self) {
        if self.shutdown || self.shared.is_shutting_down() {
            return;
        }
        if self.resolver.is_some() {
            self.with_lb_policy(|policy, helper| policy.exit_idle(helper));
            return;
        }
        self.resolver_generation += 1;
        let generation = self.resolver_generation;
        debug!(channel = %self.shared.target, authority = %self.authority, "exiting idle");
        let resolver = self.resolver_builder.build(
            &self.target,
            ResolverOptions {
                authority: self.authority.clone(),
                channel_args: self.channel_args.clone(),
                work_scheduler: Arc::new(ResolverWorkScheduler {
                    work_queue: self.shared.work_queue.clone(),
                    generation,
                }),
            },
        );
        self.resolver = Some(resolver);
        self.update_state_and_picker(
            ConnectivityState::Connecting,
            None,
            Arc::new(QueuingPicker {}),
            "started name resolution",
        );
        // The first work call starts the resolver.
        let _ = self
            .shared
            .work_queue
            .send(WorkQueueItem::ScheduleResolverWork(generation));
    }

    pub(crate) fn enter_idle(&mut self) {
        if self.shutdown || self.resolver.is_none() {
            return;
        }
        debug!(channel = %self.shared.target, "entering idle");
        self.resolver = None;
        self.resolver_generation += 1;
        self.lb_policy = None;
        self.saved_service_config = None;
        self.saved_config_selector = None;
        self.shared.set_resolved_config(None);
        self.update_channel_info();
        let picker = Arc::new(IdlePicker {
            work_scheduler: Arc::new(ExitIdleScheduler {
                work_queue: self.shared.work_queue.clone(),
            }),
        });
        self.update_state_and_picker(ConnectivityState::Idle, None, picker, "channel idle");
    }

    fn shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        debug!(channel = %self.shared.target, "control plane shutting down");
        self.resolver = None;
        self.lb_policy = None;
        self.saved_service_config = None;
        self.saved_config_selector = None;
        self.update_state_and_picker(
            ConnectivityState::Shutdown,
            Some(shutdown_status()),
            Arc::new(Failing {
                error: shutdown_status(),
            }),
            "channel shutdown",
        );
        self.shared.set_resolved_config(None);
        self.subchannels.clear();
    }

    pub(crate) fn reset_connect_backoff(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.reset_backoff();
        }
        if let Some(active) = self.lb_policy.as_mut() {
            active.policy.reset_backoff();
        }
        for wrapper in self.subchannels.values().filter_map(Weak::upgrade) {
            wrapper.internal().reset_backoff();
        }
    }

    fn request_reresolution(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            debug!(channel = %self.shared.target, "re-resolution requested");
            resolver.resolve_now();
        }
    }

    fn create_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let transport = match self.transports.get_transport(address.network_type) {
            Some(transport) => transport,
            None => {
                warn!(channel = %self.shared.target, %address, "no transport for address");
                Arc::new(UnsupportedTransport {
                    error: format!("no transport for network type {}", address.network_type),
                })
            }
        };
        // The server URI is per-channel; leaving it in would stop channels to
        // different targets from sharing subchannels.
        let mut args = address
            .args
            .union_with(&self.channel_args.clone().remove(SERVER_URI));
        if let Some(name) = self
            .saved_service_config
            .as_ref()
            .and_then(|sc| sc.health_check_service_name())
        {
            args = args.set(HEALTH_CHECK_SERVICE_NAME, name);
        }
        let internal = self.subchannel_pool.get_or_create_subchannel(
            SubchannelKey::new(address.clone(), args),
            transport,
            self.keepalive_time,
            self.shared.runtime.clone(),
        );
        if let Some(keepalive_time) = self.keepalive_time {
            internal.throttle_keepalive_time(keepalive_time);
        }
        let wrapper = SubchannelWrapper::new(internal, self.shared.work_queue.clone());
        debug!(channel = %self.shared.target, subchannel = %wrapper, "created subchannel");
        self.subchannels.insert(wrapper.id(), Arc::downgrade(&wrapper));
        wrapper
    }

    pub(crate) fn on_subchannel_state_change(
        &mut self,
        subchannel: Arc<SubchannelWrapper>,
        state: SubchannelState,
        connected: Option<Arc<ConnectedSubchannel>>,
        keepalive_time: Option<Duration>,
    ) {
        if self.shutdown {
            return;
        }
        debug!(
            channel = %self.shared.target,
            %subchannel,
            state = %state.connectivity_state,
            "subchannel state change"
        );
        // A subchannel throttled by its peer raises the keepalive time for the
        // whole channel.
        if let (Some(ours), Some(theirs)) = (self.keepalive_time, keepalive_time) {
            if theirs > ours {
                debug!(channel = %self.shared.target, keepalive_time = ?theirs, "throttling keepalive time");
                self.keepalive_time = Some(theirs);
                for wrapper in self.subchannels.values().filter_map(Weak::upgrade) {
                    wrapper.internal().throttle_keepalive_time(theirs);
                }
            }
        }
        self.pending_connected.push((subchannel.id(), connected));
        let subchannel: Arc<dyn Subchannel> = subchannel;
        self.with_lb_policy(|policy, helper| policy.subchannel_update(subchannel, &state, helper));
    }

    pub(crate) fn on_subchannel_wrapper_dropped(&mut self, id: SubchannelId) {
        self.subchannels.remove(&id);
        self.pending_connected.push((id, None));
    }
}

struct ResolverHelper<'a> {
    controller: &'a mut InternalChannelController,
}

impl name_resolution::ChannelController for ResolverHelper<'_> {
    fn update(&mut self, update: ResolverUpdate) -> Result<(), String> {
        self.controller.on_resolver_result(update)
    }

    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String> {
        ServiceConfig::parse(config, &self.controller.lb_policies).map_err(|e| e.to_string())
    }
}

struct LbHelper<'a> {
    controller: &'a mut InternalChannelController,
}

impl LbHelper<'_> {
    // Policy callbacks become no-ops as soon as shutdown is requested, even
    // before the control plane has processed it.
    fn shutting_down(&self) -> bool {
        self.controller.shutdown || self.controller.shared.is_shutting_down()
    }
}

impl load_balancing::ChannelController for LbHelper<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        if self.shutting_down() {
            // Never connected; the policy is torn down right after.
            return Arc::new(ShutdownSubchannel {
                id: SubchannelId::new(),
                address: address.clone(),
            });
        }
        self.controller.create_subchannel(address)
    }

    fn update_picker(&mut self, update: LbState) {
        if self.shutting_down() {
            return;
        }
        let status = match update.connectivity_state {
            ConnectivityState::TransientFailure => update.picker.failure_status(),
            _ => None,
        };
        self.controller.update_state_and_picker(
            update.connectivity_state,
            status,
            update.picker,
            "LB policy update",
        );
    }

    fn request_resolution(&mut self) {
        if self.shutting_down() {
            return;
        }
        self.controller
            .shared
            .schedule(|c: &mut InternalChannelController| c.request_reresolution());
    }

    fn add_trace_event(&mut self, severity: TraceSeverity, message: &str) {
        if self.shutting_down() {
            return;
        }
        let channel = &self.controller.shared.target;
        match severity {
            TraceSeverity::Info => info!(channel = %channel, "{message}"),
            TraceSeverity::Warning => warn!(channel = %channel, "{message}"),
            TraceSeverity::Error => error!(channel = %channel, "{message}"),
        }
    }
}
