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

//! The outermost call stage: waits for the channel's resolver result, applies
//! the per-call config and hands batches to the dynamic call.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tracing::{debug, trace};

use super::lb_call::LbCall;
use super::retry::RetryingCall;
use super::{Batch, BatchResult, CallContext, CallEvent, PendingBatchQueue};
use crate::client::channel::{PickedSubchannel, ResolutionResult, ResolvedConfig};
use crate::client::config_selector::CallConfigArgs;
use crate::client::service_config::ServiceConfig;
use crate::status::Status;

type CommittedHook = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

enum Stage {
    /// No resolver result has been asked for yet, or the call failed.
    Unresolved,
    /// Waiting in the channel's resolution queue.
    Queued,
    Active(DynamicCall),
}

pub(crate) struct CallData {
    ctx: CallContext,
    // Method timeouts count from here, not from when the config arrives.
    start_time: Instant,
    deadline: Option<Instant>,
    // As set on the call's initial metadata, before the method config is
    // known.
    wait_for_ready: Option<bool>,
    pending: PendingBatchQueue<Batch>,
    stage: Stage,
    cancel_error: Option<Status>,
    committed_hook: Option<CommittedHook>,
    // Keeps the config the call was started with alive until it ends.
    _service_config: Option<Arc<ServiceConfig>>,
}

impl CallData {
    pub(crate) fn new(ctx: CallContext, deadline: Option<Instant>) -> Self {
        Self {
            ctx,
            start_time: Instant::now(),
            deadline,
            wait_for_ready: None,
            pending: PendingBatchQueue::new(),
            stage: Stage::Unresolved,
            cancel_error: None,
            committed_hook: None,
            _service_config: None,
        }
    }

    /// Processes the call's events until the call is dropped.
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<CallEvent>,
        token: CancellationToken,
    ) {
        loop {
            let timer = self.next_timer();
            let runtime = self.ctx.shared.runtime.clone();
            let sleep = async move {
                match timer {
                    Some(at) => runtime.sleep(at.saturating_duration_since(Instant::now())).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.cancel(Status::cancelled("call dropped"));
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => break,
                },
                _ = sleep => self.on_timer(),
            }
        }
        trace!(call = self.ctx.id, "call task exiting");
    }

    fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Batch(batch) => self.start_batch(batch),
            CallEvent::ResolutionChanged => {
                if matches!(self.stage, Stage::Queued) && self.cancel_error.is_none() {
                    self.check_resolution();
                }
            }
            CallEvent::PickDone {
                attempt,
                metadata,
                result,
            } => {
                if let Stage::Active(dynamic) = &mut self.stage {
                    dynamic.on_pick_done(attempt, metadata, result);
                }
            }
            CallEvent::TransportBatchDone {
                attempt,
                tag,
                result,
            } => {
                if let Stage::Active(dynamic) = &mut self.stage {
                    dynamic.on_transport_batch_done(attempt, tag, result);
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        self.cancel_error.is_some()
            || matches!(&self.stage, Stage::Active(dynamic) if dynamic.is_done())
    }

    fn next_timer(&self) -> Option<Instant> {
        if self.is_done() {
            return None;
        }
        let retry = match &self.stage {
            Stage::Active(dynamic) => dynamic.next_timer(),
            _ => None,
        };
        match (self.deadline, retry) {
            (Some(deadline), Some(retry)) => Some(deadline.min(retry)),
            (deadline, retry) => deadline.or(retry),
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if self.deadline.is_some_and(|deadline| deadline <= now) {
            debug!(call = self.ctx.id, "call deadline exceeded");
            self.cancel(Status::deadline_exceeded("deadline exceeded"));
            return;
        }
        if let Stage::Active(dynamic) = &mut self.stage {
            dynamic.on_timer(now);
        }
    }

    fn start_batch(&mut self, batch: Batch) {
        if let Some(status) = batch.ops.cancel.clone() {
            let has_other_ops = batch.ops.first_op().is_some();
            self.cancel(status.clone());
            if has_other_ops {
                batch.fail(Status::internal("a cancel batch must carry no other ops"));
            } else {
                batch.on_complete.complete(BatchResult::ok());
            }
            return;
        }
        if let Some(error) = &self.cancel_error {
            batch.fail(error.clone());
            return;
        }
        if let Stage::Active(dynamic) = &mut self.stage {
            dynamic.start_batch(notify_committed(batch, self.committed_hook.as_ref()));
            return;
        }

        let Some(kind) = batch.ops.first_op() else {
            batch.on_complete.complete(BatchResult::ok());
            return;
        };
        let wait_for_ready = batch
            .ops
            .send_initial_metadata
            .as_ref()
            .map(|op| op.wait_for_ready);
        if let Err(batch) = self.pending.add(kind, batch) {
            batch.fail(Status::internal(format!(
                "a batch starting with {kind:?} is already pending"
            )));
            return;
        }
        if let Some(wait_for_ready) = wait_for_ready {
            self.wait_for_ready = wait_for_ready;
            self.check_resolution();
        }
    }

    fn check_resolution(&mut self) {
        let wait_for_ready = self.wait_for_ready.unwrap_or(false);
        match self
            .ctx
            .shared
            .check_resolution(self.ctx.id, wait_for_ready, &self.ctx.tx)
        {
            ResolutionResult::Ready(config) => {
                self.stage = Stage::Unresolved;
                self.apply_config(config);
            }
            ResolutionResult::Queued => self.stage = Stage::Queued,
            ResolutionResult::Failed(status) => {
                debug!(call = self.ctx.id, %status, "call failed waiting for resolution");
                self.cancel(status);
            }
        }
    }

    fn apply_config(&mut self, config: ResolvedConfig) {
        let metadata = self
            .pending
            .iter()
            .find_map(|batch| batch.ops.send_initial_metadata.as_ref())
            .map(|op| op.metadata.clone())
            .unwrap_or_default();
        let call_config = match config.config_selector.call_config(CallConfigArgs {
            path: &self.ctx.path,
            initial_metadata: &metadata,
        }) {
            Ok(call_config) => call_config,
            Err(status) => {
                debug!(call = self.ctx.id, %status, "config selector rejected call");
                self.cancel(status);
                return;
            }
        };

        let method_config = call_config.method_config.as_deref();
        if let Some(timeout) = method_config.and_then(|m| m.timeout) {
            let method_deadline = self.start_time + timeout;
            self.deadline = Some(
                self.deadline
                    .map_or(method_deadline, |deadline| deadline.min(method_deadline)),
            );
        }
        let wait_for_ready = self
            .wait_for_ready
            .or(method_config.and_then(|m| m.wait_for_ready))
            .unwrap_or(false);
        let retry_policy = method_config
            .and_then(|m| m.retry_policy.clone())
            .filter(|_| self.ctx.shared.enable_retries);

        self.committed_hook = call_config
            .on_call_committed
            .map(|hook| Arc::new(Mutex::new(Some(hook))));
        self._service_config = Some(call_config.service_config);

        let mut dynamic = match retry_policy {
            Some(policy) => {
                trace!(call = self.ctx.id, max_attempts = policy.max_attempts, "retries enabled");
                DynamicCall::Retrying(RetryingCall::new(
                    self.ctx.clone(),
                    policy,
                    config.retry_throttler,
                    self.deadline,
                    wait_for_ready,
                ))
            }
            None => DynamicCall::Direct(DirectCall::new(LbCall::new(
                self.ctx.clone(),
                1,
                self.deadline,
                wait_for_ready,
            ))),
        };
        for batch in self.pending.take_all() {
            dynamic.start_batch(notify_committed(batch, self.committed_hook.as_ref()));
        }
        self.stage = Stage::Active(dynamic);
    }

    fn cancel(&mut self, status: Status) {
        if self.cancel_error.is_some() {
            return;
        }
        self.cancel_error = Some(status.clone());
        if let Stage::Active(dynamic) = &mut self.stage {
            dynamic.cancel(status.clone());
        } else if matches!(self.stage, Stage::Queued) {
            self.ctx.shared.remove_queued_call(self.ctx.id);
            self.stage = Stage::Unresolved;
        }
        for batch in self.pending.take_all() {
            batch.fail(status.clone());
        }
    }
}

// Runs the config selector's commit hook before the first batch that carries
// response headers or the final status completes.
fn notify_committed(batch: Batch, hook: Option<&CommittedHook>) -> Batch {
    let Some(hook) = hook else {
        return batch;
    };
    if !batch.ops.recv_initial_metadata && !batch.ops.recv_trailing_metadata {
        return batch;
    }
    let hook = hook.clone();
    Batch::new(
        batch.ops,
        batch.on_complete.before(move || {
            let f = hook.lock().take();
            if let Some(f) = f {
                f();
            }
        }),
    )
}

enum DynamicCall {
    Direct(DirectCall),
    Retrying(RetryingCall),
}

impl DynamicCall {
    fn start_batch(&mut self, batch: Batch) {
        match self {
            DynamicCall::Direct(call) => call.start_batch(batch),
            DynamicCall::Retrying(call) => call.start_batch(batch),
        }
    }

    fn on_pick_done(
        &mut self,
        attempt: u32,
        metadata: MetadataMap,
        result: Result<PickedSubchannel, Status>,
    ) {
        match self {
            DynamicCall::Direct(call) => {
                if call.lb_call.attempt() == attempt {
                    call.lb_call.on_pick_done(metadata, result);
                }
            }
            DynamicCall::Retrying(call) => call.on_pick_done(attempt, metadata, result),
        }
    }

    fn on_transport_batch_done(&mut self, attempt: u32, tag: u64, result: BatchResult) {
        match self {
            DynamicCall::Direct(call) => call.on_transport_batch_done(tag, result),
            DynamicCall::Retrying(call) => call.on_transport_batch_done(attempt, tag, result),
        }
    }

    fn on_timer(&mut self, now: Instant) {
        if let DynamicCall::Retrying(call) = self {
            call.on_timer(now);
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        match self {
            DynamicCall::Direct(_) => None,
            DynamicCall::Retrying(call) => call.next_timer(),
        }
    }

    fn cancel(&mut self, status: Status) {
        match self {
            DynamicCall::Direct(call) => call.cancel(status),
            DynamicCall::Retrying(call) => call.cancel(status),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            DynamicCall::Direct(call) => call.done,
            DynamicCall::Retrying(call) => call.is_done(),
        }
    }
}

/// A call without retries: batches go straight to a single LB call.
struct DirectCall {
    lb_call: LbCall,
    next_tag: u64,
    batches: HashMap<u64, Batch>,
    done: bool,
}

impl DirectCall {
    fn new(lb_call: LbCall) -> Self {
        Self {
            lb_call,
            next_tag: 0,
            batches: HashMap::new(),
            done: false,
        }
    }

    fn start_batch(&mut self, batch: Batch) {
        let tag = self.next_tag;
        self.next_tag += 1;
        let ops = batch.ops.clone();
        self.batches.insert(tag, batch);
        self.lb_call.start_batch(tag, ops);
    }

    fn on_transport_batch_done(&mut self, tag: u64, result: BatchResult) {
        self.lb_call.on_batch_done(&result);
        if result.recv_trailing_metadata.is_some() {
            self.done = true;
        }
        if let Some(batch) = self.batches.remove(&tag) {
            batch.on_complete.complete(result);
        }
    }

    fn cancel(&mut self, status: Status) {
        self.done = true;
        self.lb_call.cancel(status.clone());
        for (_, batch) in self.batches.drain() {
            batch.fail(status.clone());
        }
    }
}
