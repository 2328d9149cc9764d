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

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::client::backoff::ExponentialBackoff;
use crate::client::channel::{InternalChannelController, WorkQueueItem, WorkQueueTx};
use crate::client::channel_args::ChannelArgs;
use crate::client::connectivity::{ConnectivityStateTracker, ConnectivityStateWatcher, WatcherId};
use crate::client::load_balancing::{Subchannel, SubchannelId, SubchannelState};
use crate::client::name_resolution::Address;
use crate::client::transport::{
    ConnectedTransport, DisconnectReason, StreamArgs, Transport, TransportConnection,
    TransportOptions, TransportStream,
};
use crate::rt::{BoxedTaskHandle, GrpcRuntime};
use crate::status::Status;

/// How long a single connection attempt may take before it is abandoned.
pub(crate) const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

// SubchannelKey uniquely identifies a subchannel in the pool.
#[derive(PartialEq, PartialOrd, Eq, Ord, Clone)]
pub(crate) struct SubchannelKey {
    address: Address,
    args: ChannelArgs,
}

impl SubchannelKey {
    pub(crate) fn new(address: Address, args: ChannelArgs) -> Self {
        Self { address, args }
    }
}

impl Display for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

impl Debug for SubchannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.address, self.args)
    }
}

/// The live transport of a READY subchannel.
pub(crate) struct ConnectedSubchannel {
    address: Address,
    connection: Arc<dyn TransportConnection>,
}

impl ConnectedSubchannel {
    pub(crate) fn address(&self) -> &Address {
        &self.address
    }

    pub(crate) fn create_stream(&self, args: StreamArgs) -> Box<dyn TransportStream> {
        self.connection.create_stream(args)
    }
}

impl Debug for ConnectedSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectedSubchannel({})", self.address)
    }
}

enum InternalSubchannelState {
    Idle,
    Connecting,
    Ready(Arc<ConnectedSubchannel>),
    TransientFailure,
}

impl Display for InternalSubchannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready(_) => write!(f, "Ready"),
            Self::TransientFailure => write!(f, "TransientFailure"),
        }
    }
}

struct InnerSubchannel {
    state: InternalSubchannelState,
    // The connect, disconnect-watch or backoff task for the current state.
    task: Option<BoxedTaskHandle>,
    keepalive_time: Option<Duration>,
}

impl InnerSubchannel {
    fn set_task(&mut self, task: Option<BoxedTaskHandle>) {
        if let Some(old) = std::mem::replace(&mut self.task, task) {
            old.abort();
        }
    }
}

enum SubchannelStateMachineEvent {
    ConnectionRequested,
    ConnectionSucceeded(ConnectedTransport),
    ConnectionTimedOut,
    ConnectionFailed(Status),
    ConnectionTerminated(DisconnectReason),
    BackoffExpired,
}

impl Debug for SubchannelStateMachineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRequested => write!(f, "ConnectionRequested"),
            Self::ConnectionSucceeded(_) => write!(f, "ConnectionSucceeded"),
            Self::ConnectionTimedOut => write!(f, "ConnectionTimedOut"),
            Self::ConnectionFailed(e) => write!(f, "ConnectionFailed({e})"),
            Self::ConnectionTerminated(r) => write!(f, "ConnectionTerminated({r})"),
            Self::BackoffExpired => write!(f, "BackoffExpired"),
        }
    }
}

/// One connection target, shared through the [`SubchannelPool`] by every
/// LB policy that asks for the same key.
///
/// A task owned by the subchannel runs the state machine; transitions are
/// published through the subchannel's connectivity state tracker.
pub(crate) struct InternalSubchannel {
    key: SubchannelKey,
    transport: Arc<dyn Transport>,
    tracker: ConnectivityStateTracker,
    inner: Mutex<InnerSubchannel>,
    backoff: Mutex<ExponentialBackoff>,
    state_machine_event_sender: mpsc::UnboundedSender<SubchannelStateMachineEvent>,
    state_machine_task: BoxedTaskHandle,
    runtime: GrpcRuntime,
    pool: Weak<SubchannelPool>,
}

impl InternalSubchannel {
    fn new(
        key: SubchannelKey,
        transport: Arc<dyn Transport>,
        keepalive_time: Option<Duration>,
        runtime: GrpcRuntime,
        pool: Weak<SubchannelPool>,
    ) -> Arc<InternalSubchannel> {
        debug!(subchannel = %key, "creating subchannel");
        let (tx, mut rx) = mpsc::unbounded_channel::<SubchannelStateMachineEvent>();
        Arc::new_cyclic(|weak: &Weak<InternalSubchannel>| {
            // The task only holds a weak reference, so it cannot keep the
            // subchannel alive.  It exits once the subchannel is dropped.
            let weak = weak.clone();
            let state_machine_task = runtime.spawn(Box::pin(async move {
                while let Some(event) = rx.recv().await {
                    let Some(isc) = weak.upgrade() else {
                        break;
                    };
                    debug!(subchannel = %isc.key, ?event, "subchannel event");
                    isc.handle_event(event);
                }
            }));
            Self {
                key,
                transport,
                tracker: ConnectivityStateTracker::new("subchannel", ConnectivityState::Idle),
                inner: Mutex::new(InnerSubchannel {
                    state: InternalSubchannelState::Idle,
                    task: None,
                    keepalive_time,
                }),
                backoff: Mutex::new(ExponentialBackoff::default()),
                state_machine_event_sender: tx,
                state_machine_task,
                runtime,
                pool,
            }
        })
    }

    pub(crate) fn address(&self) -> Address {
        self.key.address.clone()
    }

    /// The connection, if the subchannel is READY.
    pub(crate) fn connected_subchannel(&self) -> Option<Arc<ConnectedSubchannel>> {
        match &self.inner.lock().state {
            InternalSubchannelState::Ready(connected) => Some(connected.clone()),
            _ => None,
        }
    }

    pub(crate) fn keepalive_time(&self) -> Option<Duration> {
        self.inner.lock().keepalive_time
    }

    /// Raises the keepalive time used for future connections.  Never lowers
    /// it.
    pub(crate) fn throttle_keepalive_time(&self, keepalive_time: Duration) {
        let mut inner = self.inner.lock();
        if inner.keepalive_time.is_none_or(|cur| keepalive_time > cur) {
            inner.keepalive_time = Some(keepalive_time);
        }
    }

    pub(crate) fn add_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>) -> WatcherId {
        self.tracker.add_watcher(watcher)
    }

    pub(crate) fn remove_watcher(&self, id: WatcherId) {
        self.tracker.remove_watcher(id);
    }

    /// Begins connecting if the subchannel is IDLE.
    pub(crate) fn connect(&self) {
        if let InternalSubchannelState::Idle = self.inner.lock().state {
            let _ = self
                .state_machine_event_sender
                .send(SubchannelStateMachineEvent::ConnectionRequested);
        }
    }

    /// Resets the reconnect backoff.  A subchannel waiting out its backoff
    /// returns to IDLE right away.
    pub(crate) fn reset_backoff(&self) {
        self.backoff.lock().reset();
        let mut inner = self.inner.lock();
        if let InternalSubchannelState::TransientFailure = inner.state {
            inner.set_task(None);
            let _ = self
                .state_machine_event_sender
                .send(SubchannelStateMachineEvent::BackoffExpired);
        }
    }

    fn handle_event(&self, event: SubchannelStateMachineEvent) {
        match event {
            SubchannelStateMachineEvent::ConnectionRequested => self.move_to_connecting(),
            SubchannelStateMachineEvent::ConnectionSucceeded(transport) => {
                self.move_to_ready(transport)
            }
            SubchannelStateMachineEvent::ConnectionTimedOut => {
                self.move_to_transient_failure(Status::unavailable("connect timeout expired"))
            }
            SubchannelStateMachineEvent::ConnectionFailed(err) => {
                self.move_to_transient_failure(err)
            }
            SubchannelStateMachineEvent::ConnectionTerminated(reason) => {
                self.on_connection_terminated(reason)
            }
            SubchannelStateMachineEvent::BackoffExpired => self.move_to_idle(),
        }
    }

    fn move_to_idle(&self) {
        {
            let mut inner = self.inner.lock();
            // A reset_backoff may race with the backoff timer.
            if let InternalSubchannelState::Idle = inner.state {
                return;
            }
            inner.state = InternalSubchannelState::Idle;
            inner.set_task(None);
        }
        self.tracker.set_state(ConnectivityState::Idle, None, "subchannel idle");
    }

    fn move_to_connecting(&self) {
        let options = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, InternalSubchannelState::Idle) {
                return;
            }
            inner.state = InternalSubchannelState::Connecting;
            TransportOptions {
                keepalive_time: inner.keepalive_time,
                channel_args: self.key.args.clone(),
            }
        };
        self.tracker
            .set_state(ConnectivityState::Connecting, None, "connection requested");

        let transport = self.transport.clone();
        let address = self.address();
        let state_machine_tx = self.state_machine_event_sender.clone();
        let runtime = self.runtime.clone();
        let connect_task = self.runtime.spawn(Box::pin(async move {
            let event = tokio::select! {
                _ = runtime.sleep(MIN_CONNECT_TIMEOUT) => {
                    SubchannelStateMachineEvent::ConnectionTimedOut
                }
                result = transport.connect(&address, &options) => match result {
                    Ok(connected) => SubchannelStateMachineEvent::ConnectionSucceeded(connected),
                    Err(e) => SubchannelStateMachineEvent::ConnectionFailed(e),
                },
            };
            let _ = state_machine_tx.send(event);
        }));
        self.inner.lock().set_task(Some(connect_task));
    }

    fn move_to_ready(&self, transport: ConnectedTransport) {
        let ConnectedTransport {
            connection,
            disconnection_listener,
        } = transport;
        let state_machine_tx = self.state_machine_event_sender.clone();
        let disconnect_task = self.runtime.spawn(Box::pin(async move {
            let reason = disconnection_listener
                .await
                .unwrap_or(DisconnectReason::Closed);
            let _ = state_machine_tx.send(SubchannelStateMachineEvent::ConnectionTerminated(reason));
        }));
        {
            let mut inner = self.inner.lock();
            inner.state = InternalSubchannelState::Ready(Arc::new(ConnectedSubchannel {
                address: self.address(),
                connection,
            }));
            // Replacing the connect task also releases it.
            inner.task = Some(disconnect_task);
        }
        self.backoff.lock().reset();
        self.tracker
            .set_state(ConnectivityState::Ready, None, "connection established");
    }

    fn move_to_transient_failure(&self, err: Status) {
        let delay = self.backoff.lock().backoff_duration();
        let state_machine_tx = self.state_machine_event_sender.clone();
        let runtime = self.runtime.clone();
        let backoff_task = self.runtime.spawn(Box::pin(async move {
            runtime.sleep(delay).await;
            let _ = state_machine_tx.send(SubchannelStateMachineEvent::BackoffExpired);
        }));
        {
            let mut inner = self.inner.lock();
            inner.state = InternalSubchannelState::TransientFailure;
            inner.task = Some(backoff_task);
        }
        debug!(subchannel = %self.key, ?delay, error = %err, "connection attempt failed");
        self.tracker.set_state(
            ConnectivityState::TransientFailure,
            Some(err),
            "connection attempt failed",
        );
    }

    fn on_connection_terminated(&self, reason: DisconnectReason) {
        if reason == DisconnectReason::TooManyPings {
            let mut inner = self.inner.lock();
            if let Some(cur) = inner.keepalive_time {
                let throttled = cur.saturating_mul(2);
                debug!(subchannel = %self.key, ?throttled, "peer reported too many pings, throttling keepalive");
                inner.keepalive_time = Some(throttled);
            }
        }
        debug!(subchannel = %self.key, %reason, "connection terminated");
        self.move_to_idle();
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        debug!(subchannel = %self.key, "dropping subchannel");
        self.inner.get_mut().set_task(None);
        self.state_machine_task.abort();
        if let Some(pool) = self.pool.upgrade() {
            pool.unregister_subchannel(&self.key, self);
        }
    }
}

/// De-duplicates subchannels across LB policies and channels.  Entries are
/// weak, so a subchannel lives exactly as long as some policy holds it.
#[derive(Default)]
pub struct SubchannelPool {
    subchannels: Mutex<BTreeMap<SubchannelKey, Weak<InternalSubchannel>>>,
}

impl SubchannelPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subchannels in the pool.
    pub fn len(&self) -> usize {
        self.subchannels
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn get_or_create_subchannel(
        self: &Arc<Self>,
        key: SubchannelKey,
        transport: Arc<dyn Transport>,
        keepalive_time: Option<Duration>,
        runtime: GrpcRuntime,
    ) -> Arc<InternalSubchannel> {
        let mut subchannels = self.subchannels.lock();
        if let Some(isc) = subchannels.get(&key).and_then(Weak::upgrade) {
            return isc;
        }
        let isc = InternalSubchannel::new(
            key.clone(),
            transport,
            keepalive_time,
            runtime,
            Arc::downgrade(self),
        );
        subchannels.insert(key, Arc::downgrade(&isc));
        isc
    }

    fn unregister_subchannel(&self, key: &SubchannelKey, isc: *const InternalSubchannel) {
        let mut subchannels = self.subchannels.lock();
        // The key may already map to a newer subchannel.
        if subchannels
            .get(key)
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), isc))
        {
            subchannels.remove(key);
        }
    }
}

impl Debug for SubchannelPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubchannelPool")
            .field("subchannels", &self.subchannels.lock().len())
            .finish()
    }
}

/// The handle given to LB policies.  Each call to `new_subchannel` returns a
/// new wrapper, even when the underlying subchannel is shared.
pub(crate) struct SubchannelWrapper {
    id: SubchannelId,
    internal: Arc<InternalSubchannel>,
    watcher_id: Mutex<Option<WatcherId>>,
    work_queue: WorkQueueTx,
}

impl SubchannelWrapper {
    pub(crate) fn new(internal: Arc<InternalSubchannel>, work_queue: WorkQueueTx) -> Arc<Self> {
        let wrapper = Arc::new(Self {
            id: SubchannelId::new(),
            internal,
            watcher_id: Mutex::new(None),
            work_queue: work_queue.clone(),
        });
        let watcher = Arc::new(SubchannelStateWatcher {
            subchannel: Arc::downgrade(&wrapper),
            work_queue,
        });
        let id = wrapper.internal.add_watcher(watcher);
        *wrapper.watcher_id.lock() = Some(id);
        wrapper
    }

    pub(crate) fn internal(&self) -> &Arc<InternalSubchannel> {
        &self.internal
    }
}

impl Subchannel for SubchannelWrapper {
    fn id(&self) -> SubchannelId {
        self.id
    }

    fn address(&self) -> Address {
        self.internal.address()
    }

    fn connect(&self) {
        self.internal.connect();
    }

    fn reset_backoff(&self) {
        self.internal.reset_backoff();
    }
}

impl Display for SubchannelWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({}, {})", self.id, self.internal.key)
    }
}

impl Drop for SubchannelWrapper {
    fn drop(&mut self) {
        if let Some(id) = self.watcher_id.get_mut().take() {
            self.internal.remove_watcher(id);
        }
        let id = self.id;
        let _ = self.work_queue.send(WorkQueueItem::Closure(Box::new(
            move |c: &mut InternalChannelController| c.on_subchannel_wrapper_dropped(id),
        )));
    }
}

// Forwards internal subchannel transitions onto the channel's work queue.
struct SubchannelStateWatcher {
    subchannel: Weak<SubchannelWrapper>,
    work_queue: WorkQueueTx,
}

impl ConnectivityStateWatcher for SubchannelStateWatcher {
    fn on_connectivity_state_change(&self, state: ConnectivityState, status: Option<&Status>) {
        // Ignore internal subchannel state changes if the wrapper was dropped
        // but its watcher is still pending removal.
        let Some(sc) = self.subchannel.upgrade() else {
            return;
        };
        let connected = match state {
            ConnectivityState::Ready => sc.internal.connected_subchannel(),
            _ => None,
        };
        let keepalive_time = sc.internal.keepalive_time();
        let state = SubchannelState {
            connectivity_state: state,
            last_connection_error: status.cloned(),
        };
        let _ = self.work_queue.send(WorkQueueItem::Closure(Box::new(
            move |c: &mut InternalChannelController| {
                c.on_subchannel_state_change(sc, state, connected, keepalive_time)
            },
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::test_utils::FakeTransport;
    use crate::rt::default_runtime;

    struct ChannelWatcher {
        tx: mpsc::UnboundedSender<ConnectivityState>,
    }

    impl ConnectivityStateWatcher for ChannelWatcher {
        fn on_connectivity_state_change(&self, state: ConnectivityState, _: Option<&Status>) {
            let _ = self.tx.send(state);
        }
    }

    fn subchannel(
        pool: &Arc<SubchannelPool>,
        transport: &FakeTransport,
        address: &str,
        keepalive_time: Option<Duration>,
    ) -> (Arc<InternalSubchannel>, mpsc::UnboundedReceiver<ConnectivityState>) {
        let isc = pool.get_or_create_subchannel(
            SubchannelKey::new(Address::tcp(address.to_string()), ChannelArgs::default()),
            Arc::new(transport.clone()),
            keepalive_time,
            default_runtime(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        isc.add_watcher(Arc::new(ChannelWatcher { tx }));
        (isc, rx)
    }

    async fn next_state(rx: &mut mpsc::UnboundedReceiver<ConnectivityState>) -> ConnectivityState {
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn pool_shares_subchannels_by_key() {
        let pool = Arc::new(SubchannelPool::new());
        let transport = FakeTransport::new();
        let (a, _rx_a) = subchannel(&pool, &transport, "10.0.0.1:80", None);
        let (b, _rx_b) = subchannel(&pool, &transport, "10.0.0.1:80", None);
        let (c, _rx_c) = subchannel(&pool, &transport, "10.0.0.2:80", None);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len(), 2);

        drop(a);
        assert_eq!(pool.len(), 2);
        drop(b);
        assert_eq!(pool.len(), 1);
        drop(c);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn connects_and_returns_to_idle_on_disconnect() {
        let pool = Arc::new(SubchannelPool::new());
        let transport = FakeTransport::new();
        let (isc, mut rx) = subchannel(&pool, &transport, "10.0.0.1:80", None);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);

        isc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Ready);
        assert!(isc.connected_subchannel().is_some());
        assert_eq!(transport.connects(), vec![Address::tcp("10.0.0.1:80")]);

        transport.disconnect_all(DisconnectReason::Closed);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);
        assert!(isc.connected_subchannel().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_backs_off_then_goes_idle() {
        let pool = Arc::new(SubchannelPool::new());
        let transport = FakeTransport::new();
        transport.push_connect_result(Err(Status::unavailable("connection refused")));
        let (isc, mut rx) = subchannel(&pool, &transport, "10.0.0.1:80", None);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);

        isc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Connecting);
        assert_eq!(
            next_state(&mut rx).await,
            ConnectivityState::TransientFailure
        );
        let failed_at = tokio::time::Instant::now();
        // Connect requests are ignored while backing off.
        isc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);
        // Default base delay is 1s with 20% jitter.
        let waited = failed_at.elapsed();
        assert!(waited >= Duration::from_millis(800), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1200), "waited {waited:?}");
        assert_eq!(transport.connects().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_backoff_skips_the_wait() {
        let pool = Arc::new(SubchannelPool::new());
        let transport = FakeTransport::new();
        transport.push_connect_result(Err(Status::unavailable("connection refused")));
        let (isc, mut rx) = subchannel(&pool, &transport, "10.0.0.1:80", None);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);
        isc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Connecting);
        assert_eq!(
            next_state(&mut rx).await,
            ConnectivityState::TransientFailure
        );

        let start = tokio::time::Instant::now();
        isc.reset_backoff();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn too_many_pings_doubles_keepalive() {
        let pool = Arc::new(SubchannelPool::new());
        let transport = FakeTransport::new();
        let (isc, mut rx) = subchannel(
            &pool,
            &transport,
            "10.0.0.1:80",
            Some(Duration::from_secs(10)),
        );
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);
        isc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Ready);

        transport.disconnect_all(DisconnectReason::TooManyPings);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Idle);
        assert_eq!(isc.keepalive_time(), Some(Duration::from_secs(20)));

        isc.connect();
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Connecting);
        assert_eq!(next_state(&mut rx).await, ConnectivityState::Ready);
        assert_eq!(
            transport.keepalive_times(),
            vec![Some(Duration::from_secs(10)), Some(Duration::from_secs(20))]
        );

        // Throttling never lowers the keepalive time.
        isc.throttle_keepalive_time(Duration::from_secs(5));
        assert_eq!(isc.keepalive_time(), Some(Duration::from_secs(20)));
    }
}
