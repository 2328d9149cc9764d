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

//! Connectivity state tracking shared by the channel and its subchannels.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::client::ConnectivityState;
use crate::status::Status;

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a watcher registered with a [`ConnectivityStateTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WatcherId(u64);

impl WatcherId {
    fn new() -> Self {
        Self(NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receives connectivity state transitions from a tracker.
///
/// Notifications are delivered outside the tracker's lock, in transition
/// order. Implementations typically forward the change onto a work queue.
pub(crate) trait ConnectivityStateWatcher: Send + Sync {
    fn on_connectivity_state_change(&self, state: ConnectivityState, status: Option<&Status>);
}

struct TrackerState {
    state: ConnectivityState,
    status: Option<Status>,
    watchers: Vec<(WatcherId, Arc<dyn ConnectivityStateWatcher>)>,
}

/// Holds a current connectivity state and notifies watchers on transitions.
///
/// Shutdown is terminal: watchers are notified one last time and dropped, and
/// later registrations are told about the shutdown immediately without being
/// retained.
pub(crate) struct ConnectivityStateTracker {
    name: &'static str,
    inner: Mutex<TrackerState>,
    // Subscribers only observe the latest state, so bursts of transitions
    // collapse into a single wake-up.
    latest: watch::Sender<ConnectivityState>,
}

impl ConnectivityStateTracker {
    pub fn new(name: &'static str, state: ConnectivityState) -> Self {
        let (latest, _) = watch::channel(state);
        Self {
            name,
            inner: Mutex::new(TrackerState {
                state,
                status: None,
                watchers: Vec::new(),
            }),
            latest,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().state
    }

    /// The status associated with the current state, set for
    /// TransientFailure and Shutdown.
    pub fn status(&self) -> Option<Status> {
        self.inner.lock().status.clone()
    }

    /// Registers a watcher and immediately notifies it of the current state.
    pub fn add_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>) -> WatcherId {
        let id = WatcherId::new();
        let (state, status) = {
            let mut inner = self.inner.lock();
            if inner.state != ConnectivityState::Shutdown {
                inner.watchers.push((id, watcher.clone()));
            }
            (inner.state, inner.status.clone())
        };
        watcher.on_connectivity_state_change(state, status.as_ref());
        id
    }

    pub fn remove_watcher(&self, id: WatcherId) {
        self.inner.lock().watchers.retain(|(w, _)| *w != id);
    }

    /// Returns a receiver that always observes the most recent state.
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.latest.subscribe()
    }

    /// Moves to `state`, notifying every watcher if the state changed.
    pub fn set_state(&self, state: ConnectivityState, status: Option<Status>, reason: &str) {
        let watchers = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectivityState::Shutdown {
                return;
            }
            let changed = inner.state != state;
            debug!(
                tracker = self.name,
                from = %inner.state,
                to = %state,
                reason,
                "connectivity state change"
            );
            inner.state = state;
            inner.status = status.clone();
            if !changed {
                return;
            }
            if state == ConnectivityState::Shutdown {
                std::mem::take(&mut inner.watchers)
            } else {
                inner.watchers.clone()
            }
        };
        self.latest.send_replace(state);
        for (_, watcher) in watchers {
            watcher.on_connectivity_state_change(state, status.as_ref());
        }
    }
}

impl fmt::Debug for ConnectivityStateTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectivityStateTracker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingWatcher {
        seen: Mutex<Vec<ConnectivityState>>,
    }

    impl ConnectivityStateWatcher for RecordingWatcher {
        fn on_connectivity_state_change(&self, state: ConnectivityState, _: Option<&Status>) {
            self.seen.lock().push(state);
        }
    }

    #[test]
    fn watchers_see_each_transition_once() {
        let tracker = ConnectivityStateTracker::new("test", ConnectivityState::Idle);
        let watcher = Arc::new(RecordingWatcher::default());
        tracker.add_watcher(watcher.clone());

        tracker.set_state(ConnectivityState::Connecting, None, "connect");
        tracker.set_state(ConnectivityState::Connecting, None, "still connecting");
        tracker.set_state(ConnectivityState::Ready, None, "connected");

        assert_eq!(
            *watcher.seen.lock(),
            vec![
                ConnectivityState::Idle,
                ConnectivityState::Connecting,
                ConnectivityState::Ready
            ]
        );
    }

    #[test]
    fn removed_watcher_is_not_notified() {
        let tracker = ConnectivityStateTracker::new("test", ConnectivityState::Idle);
        let watcher = Arc::new(RecordingWatcher::default());
        let id = tracker.add_watcher(watcher.clone());
        tracker.remove_watcher(id);
        tracker.set_state(ConnectivityState::Connecting, None, "connect");
        assert_eq!(*watcher.seen.lock(), vec![ConnectivityState::Idle]);
    }

    #[test]
    fn shutdown_is_terminal() {
        let tracker = ConnectivityStateTracker::new("test", ConnectivityState::Ready);
        let watcher = Arc::new(RecordingWatcher::default());
        tracker.add_watcher(watcher.clone());

        let status = Status::unavailable("channel shutdown");
        tracker.set_state(ConnectivityState::Shutdown, Some(status.clone()), "shutdown");
        tracker.set_state(ConnectivityState::Ready, None, "ignored");

        assert_eq!(tracker.state(), ConnectivityState::Shutdown);
        assert_eq!(tracker.status(), Some(status));
        assert_eq!(
            *watcher.seen.lock(),
            vec![ConnectivityState::Ready, ConnectivityState::Shutdown]
        );

        let late = Arc::new(RecordingWatcher::default());
        tracker.add_watcher(late.clone());
        assert_eq!(*late.seen.lock(), vec![ConnectivityState::Shutdown]);
    }

    #[tokio::test]
    async fn subscribers_collapse_to_latest() {
        let tracker = ConnectivityStateTracker::new("test", ConnectivityState::Idle);
        let mut rx = tracker.subscribe();
        tracker.set_state(ConnectivityState::Connecting, None, "a");
        tracker.set_state(ConnectivityState::TransientFailure, None, "b");
        tracker.set_state(ConnectivityState::Ready, None, "c");
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Ready);
        assert!(!rx.has_changed().unwrap());
    }
}
