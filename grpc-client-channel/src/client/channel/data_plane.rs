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

//! The call-facing half of the channel: the resolution queue and the
//! data-plane picker with its queue of waiting picks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tracing::trace;

use super::{ChannelShared, shutdown_status};
use crate::client::call::{CallEvent, CallTx};
use crate::client::config_selector::ConfigSelector;
use crate::client::load_balancing::{
    CallCompletionHook, PickArgs, PickResult, Picker, QueuingPicker, SubchannelId,
};
use crate::client::retry_throttle::RetryThrottler;
use crate::client::subchannel::ConnectedSubchannel;
use crate::status::Status;

/// The configuration a call needs once resolution has produced a result.
#[derive(Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) config_selector: Arc<dyn ConfigSelector>,
    pub(crate) retry_throttler: Option<Arc<RetryThrottler>>,
}

pub(crate) enum ResolutionResult {
    Ready(ResolvedConfig),
    /// The call was added to the resolution queue and will receive
    /// [`CallEvent::ResolutionChanged`].
    Queued,
    Failed(Status),
}

struct QueuedResolution {
    wait_for_ready: bool,
    tx: CallTx,
}

#[derive(Default)]
pub(super) struct ResolutionState {
    config: Option<ResolvedConfig>,
    resolver_error: Option<Status>,
    queued_calls: BTreeMap<u64, QueuedResolution>,
}

/// A connected subchannel chosen by the picker.
pub(crate) struct PickedSubchannel {
    pub(crate) connected: Arc<ConnectedSubchannel>,
    pub(crate) on_complete: Option<CallCompletionHook>,
}

pub(crate) struct PickRequest<'a> {
    pub(crate) call_id: u64,
    pub(crate) attempt: u32,
    pub(crate) path: &'a str,
    pub(crate) metadata: MetadataMap,
    pub(crate) wait_for_ready: bool,
    pub(crate) tx: &'a CallTx,
}

pub(crate) enum PickOutcome {
    /// The pick completed.  The metadata may have been modified by the
    /// picker.
    Complete(PickedSubchannel, MetadataMap),
    /// The pick was queued and will be answered with
    /// [`CallEvent::PickDone`].
    Queued,
    Failed(Status),
}

struct QueuedPick {
    path: String,
    metadata: MetadataMap,
    wait_for_ready: bool,
    tx: CallTx,
}

pub(super) struct DataPlane {
    picker: Arc<dyn Picker>,
    // Updated only when the picker is swapped, never directly by subchannel
    // state changes.
    connected: HashMap<SubchannelId, Arc<ConnectedSubchannel>>,
    queued_picks: BTreeMap<(u64, u32), QueuedPick>,
}

impl DataPlane {
    pub(super) fn new() -> Self {
        Self {
            picker: Arc::new(QueuingPicker {}),
            connected: HashMap::new(),
            queued_picks: BTreeMap::new(),
        }
    }
}

enum Evaluation {
    Complete(PickedSubchannel),
    Queue,
    Fail(Status),
}

fn evaluate(
    picker: &dyn Picker,
    connected: &HashMap<SubchannelId, Arc<ConnectedSubchannel>>,
    path: &str,
    metadata: &mut MetadataMap,
    wait_for_ready: bool,
    shutting_down: bool,
) -> Evaluation {
    if shutting_down {
        return Evaluation::Fail(shutdown_status());
    }
    match picker.pick(&mut PickArgs { path, metadata }) {
        PickResult::Pick(pick) => match connected.get(&pick.subchannel.id()) {
            Some(connected) => Evaluation::Complete(PickedSubchannel {
                connected: connected.clone(),
                on_complete: pick.on_complete,
            }),
            // Connected but not yet visible to the data plane.
            None => Evaluation::Queue,
        },
        PickResult::Queue => Evaluation::Queue,
        PickResult::Fail(status) if !wait_for_ready => Evaluation::Fail(status),
        PickResult::Fail(_) => Evaluation::Queue,
        PickResult::Drop(status) => Evaluation::Fail(status),
    }
}

impl ChannelShared {
    /// Returns the call's config if the channel has one, otherwise queues the
    /// call (or fails it, see [`ResolutionResult`]).
    pub(crate) fn check_resolution(
        &self,
        call_id: u64,
        wait_for_ready: bool,
        tx: &CallTx,
    ) -> ResolutionResult {
        let newly_queued = {
            let mut resolution = self.resolution.lock();
            if self.is_shutting_down() {
                resolution.queued_calls.remove(&call_id);
                return ResolutionResult::Failed(shutdown_status());
            }
            if let Some(config) = &resolution.config {
                let config = config.clone();
                resolution.queued_calls.remove(&call_id);
                return ResolutionResult::Ready(config);
            }
            if let Some(error) = &resolution.resolver_error {
                if !wait_for_ready {
                    let error = error.clone();
                    resolution.queued_calls.remove(&call_id);
                    return ResolutionResult::Failed(error);
                }
            }
            resolution
                .queued_calls
                .insert(
                    call_id,
                    QueuedResolution {
                        wait_for_ready,
                        tx: tx.clone(),
                    },
                )
                .is_none()
        };
        trace!(call = call_id, "queued for name resolution");
        if newly_queued {
            self.request_exit_idle();
        }
        ResolutionResult::Queued
    }

    pub(crate) fn remove_queued_call(&self, call_id: u64) -> bool {
        self.resolution.lock().queued_calls.remove(&call_id).is_some()
    }

    /// Picks a connected subchannel with the current picker.
    pub(crate) fn pick(&self, request: PickRequest<'_>) -> PickOutcome {
        let PickRequest {
            call_id,
            attempt,
            path,
            mut metadata,
            wait_for_ready,
            tx,
        } = request;
        let mut data_plane = self.data_plane.lock();
        let evaluation = evaluate(
            data_plane.picker.as_ref(),
            &data_plane.connected,
            path,
            &mut metadata,
            wait_for_ready,
            self.is_shutting_down(),
        );
        match evaluation {
            Evaluation::Complete(picked) => {
                data_plane.queued_picks.remove(&(call_id, attempt));
                PickOutcome::Complete(picked, metadata)
            }
            Evaluation::Fail(status) => {
                data_plane.queued_picks.remove(&(call_id, attempt));
                PickOutcome::Failed(status)
            }
            Evaluation::Queue => {
                data_plane.queued_picks.insert(
                    (call_id, attempt),
                    QueuedPick {
                        path: path.to_string(),
                        metadata,
                        wait_for_ready,
                        tx: tx.clone(),
                    },
                );
                PickOutcome::Queued
            }
        }
    }

    pub(crate) fn remove_queued_pick(&self, call_id: u64, attempt: u32) -> bool {
        self.data_plane
            .lock()
            .queued_picks
            .remove(&(call_id, attempt))
            .is_some()
    }

    /// Installs `picker` and re-evaluates every queued pick against it before
    /// releasing the lock.
    pub(super) fn update_picker(
        &self,
        picker: Arc<dyn Picker>,
        connected_updates: Vec<(SubchannelId, Option<Arc<ConnectedSubchannel>>)>,
    ) {
        let shutting_down = self.is_shutting_down();
        let mut wakeups = Vec::new();
        {
            let mut data_plane = self.data_plane.lock();
            let DataPlane {
                picker: current,
                connected,
                queued_picks,
            } = &mut *data_plane;
            *current = picker;
            for (id, update) in connected_updates {
                match update {
                    Some(c) => connected.insert(id, c),
                    None => connected.remove(&id),
                };
            }
            queued_picks.retain(|&(call_id, attempt), queued| {
                let result = match evaluate(
                    current.as_ref(),
                    connected,
                    &queued.path,
                    &mut queued.metadata,
                    queued.wait_for_ready,
                    shutting_down,
                ) {
                    Evaluation::Queue => return true,
                    Evaluation::Complete(picked) => Ok(picked),
                    Evaluation::Fail(status) => Err(status),
                };
                trace!(call = call_id, attempt, ok = result.is_ok(), "queued pick done");
                wakeups.push((
                    queued.tx.clone(),
                    CallEvent::PickDone {
                        attempt,
                        metadata: std::mem::take(&mut queued.metadata),
                        result,
                    },
                ));
                false
            });
        }
        for (tx, event) in wakeups {
            let _ = tx.send(event);
        }
    }

    /// Publishes a new config (or clears it) and wakes every call waiting for
    /// resolution.
    pub(super) fn set_resolved_config(&self, config: Option<ResolvedConfig>) {
        let woken = {
            let mut resolution = self.resolution.lock();
            resolution.config = config;
            resolution.resolver_error = None;
            std::mem::take(&mut resolution.queued_calls)
        };
        for queued in woken.into_values() {
            let _ = queued.tx.send(CallEvent::ResolutionChanged);
        }
    }

    /// Records a resolution failure and wakes the queued calls that are not
    /// wait-for-ready so they fail with it.
    pub(super) fn set_resolver_error(&self, error: Status) {
        let woken = {
            let mut resolution = self.resolution.lock();
            resolution.resolver_error = Some(error);
            let (keep, fail): (BTreeMap<_, _>, BTreeMap<_, _>) =
                std::mem::take(&mut resolution.queued_calls)
                    .into_iter()
                    .partition(|(_, q)| q.wait_for_ready);
            resolution.queued_calls = keep;
            fail
        };
        for queued in woken.into_values() {
            let _ = queued.tx.send(CallEvent::ResolutionChanged);
        }
    }

    #[cfg(test)]
    pub(super) fn queued_counts(&self) -> (usize, usize) {
        let resolution = self.resolution.lock().queued_calls.len();
        let picks = self.data_plane.lock().queued_picks.len();
        (resolution, picks)
    }
}
