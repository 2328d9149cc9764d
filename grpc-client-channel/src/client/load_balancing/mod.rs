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

//! Load balancing policy interfaces.
//!
//! The channel drives exactly one LB policy at a time.  The policy receives
//! resolver results and subchannel state changes, creates subchannels through
//! the [`ChannelController`], and publishes a [`Picker`] that the channel uses
//! to choose a subchannel for every call.

use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use tonic::metadata::MetadataMap;

use crate::client::ConnectivityState;
use crate::client::channel_args::ChannelArgs;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;
use crate::status::Status;

mod backend_metrics;
pub mod pick_first;
mod registry;
pub mod round_robin;
#[cfg(test)]
pub(crate) mod test_utils;

pub use backend_metrics::BackendMetricData;
pub use registry::LbPolicyRegistry;

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
#[non_exhaustive]
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,

    /// The channel's args.
    pub channel_args: ChannelArgs,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.  All methods are called serially from the channel's work queue.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel when it leaves the idle state, e.g. because an RPC
    /// was started or the application asked it to connect.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Resets connection backoff on every subchannel owned by the policy.
    fn reset_backoff(&mut self) {}
}

/// Severity of a trace event emitted by an LB policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceSeverity {
    Info,
    Warning,
    Error,
}

/// Controls channel behaviors.
pub trait ChannelController: Send {
    /// Creates a new subchannel in IDLE state.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);

    /// Records an event in the channel's trace.
    fn add_trace_event(&mut self, severity: TraceSeverity, message: &str);
}

/// Represents the current state of a Subchannel.
#[derive(Clone, Debug)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See Subchannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Status>,
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }
}

/// An LB policy's JSON config, as found in the service config's
/// `loadBalancingConfig` list.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn new(value: serde_json::Value) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    /// Deserializes the config into the policy's own config type.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, Box<dyn Error + Send + Sync>> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// The per-call inputs to a pick.
pub struct PickArgs<'a> {
    /// The method path, e.g. `/pkg.Service/Method`.
    pub path: &'a str,
    /// The call's initial metadata.  Policies may add or remove entries.
    pub metadata: &'a mut MetadataMap,
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  If pick() returns Queue, the channel will queue the RPC until a
/// new Picker is produced by the LbPolicy, and will call pick() on the new
/// Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail result that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function is called with the channel's data plane lock held and
    /// must not block or call back into the channel.
    fn pick(&self, args: &mut PickArgs<'_>) -> PickResult;

    /// The error behind a TransientFailure picker, reported as the channel's
    /// connectivity status.
    fn failure_status(&self) -> Option<Status> {
        None
    }
}

/// Invoked with the outcome of a call that used a picked subchannel.
pub type CallCompletionHook = Box<dyn FnOnce(&CallCompletion<'_>) + Send + Sync>;

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status.
    /// If the RPC is wait-for-ready, then it will not be terminated, but
    /// instead attempted on a new picker if one is produced before it is
    /// cancelled.
    Fail(Status),
    /// Indicates that the request should fail immediately with UNAVAILABLE,
    /// even if the RPC is wait-for-ready.
    Drop(Status),
}

impl Debug for PickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PickResult::Pick(pick) => write!(f, "Pick({})", pick.subchannel),
            PickResult::Queue => write!(f, "Queue"),
            PickResult::Fail(status) => write!(f, "Fail({status})"),
            PickResult::Drop(status) => write!(f, "Drop({status})"),
        }
    }
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Called once the call's final status is known.
    pub on_complete: Option<CallCompletionHook>,
}

impl Pick {
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Self {
            subchannel,
            on_complete: None,
        }
    }
}

/// The outcome of a call, given to a pick's completion hook.
#[derive(Debug)]
pub struct CallCompletion<'a> {
    pub status: &'a Status,
    pub trailing_metadata: &'a MetadataMap,
}

impl CallCompletion<'_> {
    /// Parses backend metrics reported by the server in the call's trailers,
    /// if any.
    pub fn backend_metrics(&self) -> Option<BackendMetricData> {
        BackendMetricData::from_metadata(self.trailing_metadata)
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

impl Debug for LbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LbState({})", self.connectivity_state)
    }
}

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a subchannel handed to an LB policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubchannelId(u64);

impl SubchannelId {
    pub fn new() -> Self {
        Self(NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubchannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SubchannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when connect() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to IDLE when the reconnect backoff timer
///   has expired.  This timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// When a Subchannel is dropped, no subsequent state updates will be provided
/// for it to the LB policy.  Subchannels compare and hash by identity.
pub trait Subchannel: Send + Sync + Display {
    /// The identity of this subchannel handle.
    fn id(&self) -> SubchannelId;

    /// Returns the address of the Subchannel.
    fn address(&self) -> Address;

    /// Notifies the Subchannel to connect.
    fn connect(&self);

    /// Skips any remaining reconnect backoff.
    fn reset_backoff(&self) {}
}

impl PartialEq for dyn Subchannel {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for dyn Subchannel {}

impl Hash for dyn Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl Debug for dyn Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({}, {})", self.id(), self.address())
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
#[derive(Debug)]
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every pick with the given error.
#[derive(Debug)]
pub struct Failing {
    pub error: Status,
}

impl Picker for Failing {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.error.clone())
    }

    fn failure_status(&self) -> Option<Status> {
        Some(self.error.clone())
    }
}

/// Returned while a policy is idle: asks the policy to reconnect and queues
/// the pick.
pub struct IdlePicker {
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

impl Picker for IdlePicker {
    fn pick(&self, _args: &mut PickArgs<'_>) -> PickResult {
        self.work_scheduler.schedule_work();
        PickResult::Queue
    }
}
