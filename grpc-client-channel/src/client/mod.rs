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

//! The client side of gRPC: channels, calls and the pluggable pieces they
//! are built from.

use std::fmt::Display;
use std::sync::Arc;

use crate::client::load_balancing::LbPolicyRegistry;
use crate::client::name_resolution::{PassthroughResolverBuilder, ResolverRegistry};
use crate::client::retry_throttle::RetryThrottleMap;
use crate::client::transport::TransportRegistry;
use crate::rt::{self, GrpcRuntime};

pub mod call;
pub mod channel;
pub mod channel_args;
pub mod config_selector;
pub mod load_balancing;
pub mod name_resolution;
pub mod retry_throttle;
pub mod service_config;
pub mod transport;

pub(crate) mod backoff;
pub(crate) mod connectivity;
pub(crate) mod subchannel;

pub use call::{Call, CallArgs};
pub use channel::{Channel, ChannelInfo, ChannelOptions};
pub use subchannel::SubchannelPool;

/// A representation of the current state of a gRPC channel, also used for the
/// state of subchannels (individual connections within the channel).
///
/// A gRPC channel begins in the Idle state.  When an RPC is attempted, the
/// channel will automatically transition to Connecting.  If connections to a
/// backend service are available, the state becomes Ready.  Otherwise, if RPCs
/// would fail due to a lack of connections, the state becomes TransientFailure
/// and continues to attempt to reconnect.
///
/// Shutdown is terminal and is only reached once the channel is shut down.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl Display for ConnectivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectivityState::Idle => write!(f, "Idle"),
            ConnectivityState::Connecting => write!(f, "Connecting"),
            ConnectivityState::Ready => write!(f, "Ready"),
            ConnectivityState::TransientFailure => write!(f, "TransientFailure"),
            ConnectivityState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Process-wide collaborators shared by the channels created with it.
///
/// Registries are explicit objects rather than globals so that tests can
/// install fakes per channel.  Cloning is cheap; clones share every registry.
#[derive(Clone, Debug)]
pub struct ChannelContext {
    pub(crate) lb_policies: Arc<LbPolicyRegistry>,
    pub(crate) resolvers: Arc<ResolverRegistry>,
    pub(crate) transports: Arc<TransportRegistry>,
    pub(crate) subchannel_pool: Arc<SubchannelPool>,
    pub(crate) retry_throttle: Arc<RetryThrottleMap>,
    pub(crate) runtime: GrpcRuntime,
}

impl ChannelContext {
    /// A context with the built-in LB policies and the `passthrough`
    /// resolver registered.  No transports are registered.
    pub fn new() -> Self {
        let resolvers = ResolverRegistry::new();
        resolvers.add_builder(PassthroughResolverBuilder);
        Self {
            lb_policies: Arc::new(LbPolicyRegistry::with_builtin_policies()),
            resolvers: Arc::new(resolvers),
            transports: Arc::new(TransportRegistry::new()),
            subchannel_pool: Arc::new(SubchannelPool::new()),
            retry_throttle: Arc::new(RetryThrottleMap::new()),
            runtime: rt::default_runtime(),
        }
    }

    pub fn with_lb_policies(mut self, registry: Arc<LbPolicyRegistry>) -> Self {
        self.lb_policies = registry;
        self
    }

    pub fn with_resolvers(mut self, registry: Arc<ResolverRegistry>) -> Self {
        self.resolvers = registry;
        self
    }

    pub fn with_transports(mut self, registry: Arc<TransportRegistry>) -> Self {
        self.transports = registry;
        self
    }

    pub fn with_subchannel_pool(mut self, pool: Arc<SubchannelPool>) -> Self {
        self.subchannel_pool = pool;
        self
    }

    pub fn with_retry_throttle(mut self, map: Arc<RetryThrottleMap>) -> Self {
        self.retry_throttle = map;
        self
    }

    pub fn lb_policies(&self) -> &Arc<LbPolicyRegistry> {
        &self.lb_policies
    }

    pub fn resolvers(&self) -> &Arc<ResolverRegistry> {
        &self.resolvers
    }

    pub fn transports(&self) -> &Arc<TransportRegistry> {
        &self.transports
    }
}

impl Default for ChannelContext {
    fn default() -> Self {
        Self::new()
    }
}
