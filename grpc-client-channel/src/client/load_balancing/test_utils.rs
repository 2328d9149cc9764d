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

use std::any::Any;
use std::error::Error;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::metadata::MetadataMap;

use crate::client::load_balancing::{
    ChannelController, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState, ParsedJsonLbConfig,
    PickArgs, PickResult, Subchannel, SubchannelId, SubchannelState, TraceSeverity,
    WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::client::service_config::LbConfig;

// A test subchannel that forwards connect calls to a channel.
// This allows tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    id: SubchannelId,
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    pub(crate) fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self {
            id: SubchannelId::new(),
            address,
            tx_events,
        }
    }
}

impl Subchannel for TestSubchannel {
    fn id(&self) -> SubchannelId {
        self.id
    }

    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self.tx_events.send(TestEvent::Connect(self.address.clone()));
    }

    fn reset_backoff(&self) {
        let _ = self
            .tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()));
    }
}

impl Display for TestSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TestSubchannel({})", self.address)
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ResetBackoff(Address),
    ScheduleWork,
    Trace(TraceSeverity, String),
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({addr})"),
            Self::ResetBackoff(addr) => write!(f, "ResetBackoff({addr})"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
            Self::Trace(severity, msg) => write!(f, "Trace({severity:?}, {msg})"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        let _ = self
            .tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()));
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        let _ = self.tx_events.send(TestEvent::UpdatePicker(update));
    }

    fn request_resolution(&mut self) {
        let _ = self.tx_events.send(TestEvent::RequestResolution);
    }

    fn add_trace_event(&mut self, severity: TraceSeverity, message: &str) {
        let _ = self
            .tx_events
            .send(TestEvent::Trace(severity, message.to_string()));
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

/// Creates a controller and work scheduler that both report into the
/// returned receiver.
pub(crate) fn test_harness() -> (
    TestChannelController,
    Arc<TestWorkScheduler>,
    mpsc::UnboundedReceiver<TestEvent>,
) {
    let (tx_events, rx_events) = mpsc::unbounded_channel();
    (
        TestChannelController {
            tx_events: tx_events.clone(),
        },
        Arc::new(TestWorkScheduler { tx_events }),
        rx_events,
    )
}

/// Drains all events currently queued.
pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<TestEvent>) -> Vec<TestEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Runs a pick against an LbState's picker with empty metadata.
pub(crate) fn pick(state: &LbState, path: &str) -> PickResult {
    let mut metadata = MetadataMap::new();
    state.picker.pick(&mut PickArgs {
        path,
        metadata: &mut metadata,
    })
}

type ResolverUpdateFn = dyn Fn(
        &mut Data,
        ResolverUpdate,
        Option<&LbConfig>,
        &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    + Send
    + Sync;

type SubchannelUpdateFn = dyn Fn(&mut Data, Arc<dyn Subchannel>, &SubchannelState, &mut dyn ChannelController)
    + Send
    + Sync;

type ControllerFn = dyn Fn(&mut Data, &mut dyn ChannelController) + Send + Sync;

/// This struct holds `LbPolicy` trait stub functions that tests are expected
/// to implement.
#[derive(Clone, Default)]
pub(crate) struct PolicyFuncs {
    pub(crate) resolver_update: Option<Arc<ResolverUpdateFn>>,
    pub(crate) subchannel_update: Option<Arc<SubchannelUpdateFn>>,
    pub(crate) exit_idle: Option<Arc<ControllerFn>>,
    pub(crate) work: Option<Arc<ControllerFn>>,
}

/// Data holds test data that will be passed all to functions in PolicyFuncs.
#[derive(Default)]
pub(crate) struct Data {
    pub(crate) test_data: Option<Box<dyn Any + Send + Sync>>,
    pub(crate) work_scheduler: Option<Arc<dyn WorkScheduler>>,
}

/// The stub `LbPolicy` that calls the provided functions.
pub(crate) struct StubPolicy {
    funcs: PolicyFuncs,
    data: Data,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(f) = &self.funcs.resolver_update {
            return f(&mut self.data, update, config, channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(f) = &self.funcs.subchannel_update {
            f(&mut self.data, subchannel, state, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.exit_idle {
            f(&mut self.data, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.work {
            f(&mut self.data, channel_controller);
        }
    }
}

/// This StubPolicyBuilder builds a StubPolicy.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    funcs: PolicyFuncs,
}

impl StubPolicyBuilder {
    pub(crate) fn new(name: &'static str, funcs: PolicyFuncs) -> Self {
        Self { name, funcs }
    }
}

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(StubPolicy {
            funcs: self.funcs.clone(),
            data: Data {
                test_data: None,
                work_scheduler: Some(options.work_scheduler),
            },
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}
