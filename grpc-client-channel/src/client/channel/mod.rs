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

//! The channel: a long-lived handle to one logical target.
//!
//! Control-plane state (resolver, LB policy, subchannels) is owned by a single
//! task draining the channel's work queue.  Calls never touch it directly;
//! they read the published service config under the resolution lock and pick
//! under the data-plane lock.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::client::call::{Call, CallArgs};
use crate::client::channel_args::{
    ChannelArgs, ENABLE_RETRIES, KEEPALIVE_TIME_MS, PER_RPC_RETRY_BUFFER_SIZE, SERVER_URI,
    SERVICE_CONFIG, USE_LOCAL_SUBCHANNEL_POOL,
};
use crate::client::connectivity::ConnectivityStateTracker;
use crate::client::name_resolution::Target;
use crate::client::service_config::ServiceConfig;
use crate::client::subchannel::SubchannelPool;
use crate::client::{ChannelContext, ConnectivityState};
use crate::error::ChannelError;
use crate::rt::GrpcRuntime;
use crate::status::Status;

mod controller;
mod data_plane;

pub(crate) use controller::{InternalChannelController, WorkQueueItem, WorkQueueTx};
pub(crate) use data_plane::{
    PickOutcome, PickRequest, PickedSubchannel, ResolutionResult, ResolvedConfig,
};

use controller::ControllerParams;
use data_plane::{DataPlane, ResolutionState};

const DEFAULT_PER_RPC_RETRY_BUFFER_SIZE: usize = 256 * 1024;

/// Options for creating a [`Channel`].
///
/// Channel args with the matching well-known keys override the typed
/// settings.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    default_service_config: Option<String>,
    enable_retries: bool,
    per_rpc_retry_buffer_size: usize,
    default_authority: Option<String>,
    channel_args: ChannelArgs,
    keepalive_time: Option<Duration>,
    use_local_subchannel_pool: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            default_service_config: None,
            enable_retries: true,
            per_rpc_retry_buffer_size: DEFAULT_PER_RPC_RETRY_BUFFER_SIZE,
            default_authority: None,
            channel_args: ChannelArgs::default(),
            keepalive_time: None,
            use_local_subchannel_pool: false,
        }
    }
}

impl ChannelOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The service config JSON used when the resolver does not supply one.
    pub fn with_default_service_config(mut self, json: impl Into<String>) -> Self {
        self.default_service_config = Some(json.into());
        self
    }

    pub fn with_enable_retries(mut self, enable: bool) -> Self {
        self.enable_retries = enable;
        self
    }

    /// Limits the bytes of send ops each call caches for replay.
    pub fn with_per_rpc_retry_buffer_size(mut self, bytes: usize) -> Self {
        self.per_rpc_retry_buffer_size = bytes;
        self
    }

    pub fn with_default_authority(mut self, authority: impl Into<String>) -> Self {
        self.default_authority = Some(authority.into());
        self
    }

    pub fn with_channel_args(mut self, args: ChannelArgs) -> Self {
        self.channel_args = args;
        self
    }

    pub fn with_keepalive_time(mut self, keepalive_time: Duration) -> Self {
        self.keepalive_time = Some(keepalive_time);
        self
    }

    /// Uses a subchannel pool private to this channel instead of the
    /// context's shared pool.
    pub fn with_local_subchannel_pool(mut self, local: bool) -> Self {
        self.use_local_subchannel_pool = local;
        self
    }
}

/// What the channel is currently using, for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    lb_policy_name: Option<String>,
    service_config_json: Option<String>,
}

impl ChannelInfo {
    pub fn lb_policy_name(&self) -> Option<&str> {
        self.lb_policy_name.as_deref()
    }

    pub fn service_config_json(&self) -> Option<&str> {
        self.service_config_json.as_deref()
    }
}

/// A gRPC channel.  Cloning is cheap; clones share the same connections.
///
/// The channel shuts down when the last clone is dropped.  Calls that are
/// still running at that point fail with UNAVAILABLE.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelHandle>,
}

struct ChannelHandle {
    shared: Arc<ChannelShared>,
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl Channel {
    /// Creates a channel for `target`, resolved with the resolver registered
    /// for the target's scheme.  The channel starts IDLE.
    pub fn new(
        target: &str,
        options: ChannelOptions,
        context: &ChannelContext,
    ) -> Result<Self, ChannelError> {
        let parsed: Target = target.parse().map_err(|source| ChannelError::InvalidTarget {
            target: target.to_string(),
            source,
        })?;
        let resolver_builder = context
            .resolvers
            .get(parsed.scheme())
            .ok_or_else(|| ChannelError::UnknownScheme(parsed.scheme().to_string()))?;
        if !resolver_builder.is_valid_uri(&parsed) {
            return Err(ChannelError::UnsupportedTarget {
                target: target.to_string(),
            });
        }

        let args = &options.channel_args;
        let default_service_config = match args
            .get_str(SERVICE_CONFIG)
            .or(options.default_service_config.as_deref())
        {
            Some(json) => ServiceConfig::parse(json, &context.lb_policies)?,
            None => ServiceConfig::default(),
        };
        let enable_retries = args
            .get_bool(ENABLE_RETRIES)
            .unwrap_or(options.enable_retries);
        let per_rpc_retry_buffer_size = args
            .get_int(PER_RPC_RETRY_BUFFER_SIZE)
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(options.per_rpc_retry_buffer_size);
        let keepalive_time = args
            .get_int(KEEPALIVE_TIME_MS)
            .and_then(|ms| u64::try_from(ms).ok())
            .map(Duration::from_millis)
            .or(options.keepalive_time);
        let subchannel_pool = if args
            .get_bool(USE_LOCAL_SUBCHANNEL_POOL)
            .unwrap_or(options.use_local_subchannel_pool)
        {
            Arc::new(SubchannelPool::new())
        } else {
            context.subchannel_pool.clone()
        };
        let authority = options
            .default_authority
            .clone()
            .unwrap_or_else(|| resolver_builder.default_authority(&parsed));
        let channel_args = options.channel_args.clone().set(SERVER_URI, target);

        let (work_queue, work_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            target: target.to_string(),
            runtime: context.runtime.clone(),
            enable_retries,
            per_rpc_retry_buffer_size,
            work_queue,
            tracker: ConnectivityStateTracker::new("channel", ConnectivityState::Idle),
            info: ArcSwap::from_pointee(ChannelInfo::default()),
            shutting_down: AtomicBool::new(false),
            next_call_id: AtomicU64::new(1),
            resolution: Mutex::new(ResolutionState::default()),
            data_plane: Mutex::new(DataPlane::new()),
        });
        let controller = InternalChannelController::new(ControllerParams {
            shared: shared.clone(),
            target: parsed,
            authority,
            resolver_builder,
            context: context.clone(),
            subchannel_pool,
            channel_args,
            default_service_config: Arc::new(default_service_config),
            keepalive_time,
        });
        // The task exits once the channel shuts down.
        let _ = context.runtime.spawn(Box::pin(controller.run(work_rx)));
        debug!(channel = %target, enable_retries, "created channel");
        Ok(Self {
            inner: Arc::new(ChannelHandle { shared }),
        })
    }

    pub fn target(&self) -> &str {
        &self.inner.shared.target
    }

    /// Starts a call.  The call begins once its first batch is started.
    pub fn create_call(&self, args: CallArgs) -> Call {
        Call::new(self.inner.shared.clone(), args)
    }

    /// Returns the channel's connectivity state.  With `try_to_connect`, an
    /// IDLE channel starts resolving and connecting.
    pub fn check_connectivity_state(&self, try_to_connect: bool) -> ConnectivityState {
        let state = self.inner.shared.tracker.state();
        if try_to_connect && state == ConnectivityState::Idle {
            self.inner.shared.request_exit_idle();
        }
        state
    }

    /// Subscribes to connectivity state changes.  Bursts of transitions
    /// collapse into the latest state.
    pub fn watch_connectivity_state(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.shared.tracker.subscribe()
    }

    /// Skips any pending reconnect or re-resolution backoff.
    pub fn reset_connect_backoff(&self) {
        self.inner
            .shared
            .schedule(|c: &mut InternalChannelController| c.reset_connect_backoff());
    }

    /// Tears down the resolver, the LB policy and their connections.  The next
    /// call or connect request brings them back.
    pub fn enter_idle(&self) {
        self.inner
            .shared
            .schedule(|c: &mut InternalChannelController| c.enter_idle());
    }

    /// Shuts the channel down, failing every queued call.  Idempotent.
    pub fn shutdown(&self) {
        self.inner.shared.shutdown();
    }

    pub fn channel_info(&self) -> ChannelInfo {
        ChannelInfo::clone(&self.inner.shared.info.load())
    }

    /// Calls waiting for resolution and picks waiting for a picker.
    #[cfg(test)]
    pub(crate) fn queued_counts(&self) -> (usize, usize) {
        self.inner.shared.queued_counts()
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.shared.target)
            .field("state", &self.inner.shared.tracker.state())
            .field("status", &self.inner.shared.tracker.status())
            .finish()
    }
}

/// State shared between the channel handle, the control-plane task and calls.
pub(crate) struct ChannelShared {
    pub(crate) target: String,
    pub(crate) runtime: GrpcRuntime,
    pub(crate) enable_retries: bool,
    pub(crate) per_rpc_retry_buffer_size: usize,
    work_queue: WorkQueueTx,
    tracker: ConnectivityStateTracker,
    info: ArcSwap<ChannelInfo>,
    shutting_down: AtomicBool,
    next_call_id: AtomicU64,
    // Lock order: never hold both.  The controller updates one, releases it,
    // then takes the other.
    resolution: Mutex<ResolutionState>,
    data_plane: Mutex<DataPlane>,
}

impl ChannelShared {
    pub(crate) fn next_call_id(&self) -> u64 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn schedule(&self, f: impl FnOnce(&mut InternalChannelController) + Send + 'static) {
        let _ = self.work_queue.send(WorkQueueItem::Closure(Box::new(f)));
    }

    fn request_exit_idle(&self) {
        self.schedule(|c: &mut InternalChannelController| c.exit_idle());
    }

    fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(channel = %self.target, "shutting down channel");
        self.tracker.set_state(
            ConnectivityState::Shutdown,
            Some(shutdown_status()),
            "channel shutdown",
        );
        let _ = self.work_queue.send(WorkQueueItem::Shutdown);
    }
}

pub(crate) fn shutdown_status() -> Status {
    Status::unavailable("channel shutdown")
}
