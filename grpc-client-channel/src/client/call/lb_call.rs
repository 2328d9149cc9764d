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

//! The load-balanced call: one pick and one transport stream per attempt.

use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tracing::trace;

use super::{
    Batch, BatchOps, BatchResult, CallContext, CallEvent, Completion, OpKind, PendingBatchQueue,
};
use crate::client::channel::{PickOutcome, PickRequest, PickedSubchannel};
use crate::client::load_balancing::{CallCompletion, CallCompletionHook};
use crate::client::transport::{StreamArgs, TransportStream};
use crate::status::Status;

enum LbCallState {
    Unpicked,
    PickQueued,
    Active(Box<dyn TransportStream>),
    Failed(Status),
}

/// Drives one attempt.  Ops arrive tagged; each finishes by posting
/// [`CallEvent::TransportBatchDone`] with the attempt number and tag.
pub(crate) struct LbCall {
    ctx: CallContext,
    attempt: u32,
    deadline: Option<Instant>,
    wait_for_ready: bool,
    state: LbCallState,
    // Ops waiting for the pick.
    pending: PendingBatchQueue<(u64, BatchOps)>,
    on_complete: Option<CallCompletionHook>,
    // Set once trailers were seen or the stream was cancelled.
    finished: bool,
}

impl LbCall {
    pub(crate) fn new(
        ctx: CallContext,
        attempt: u32,
        deadline: Option<Instant>,
        wait_for_ready: bool,
    ) -> Self {
        Self {
            ctx,
            attempt,
            deadline,
            wait_for_ready,
            state: LbCallState::Unpicked,
            pending: PendingBatchQueue::new(),
            on_complete: None,
            finished: false,
        }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn start_batch(&mut self, tag: u64, ops: BatchOps) {
        match &mut self.state {
            LbCallState::Active(_) => self.dispatch(tag, ops),
            LbCallState::Failed(status) => {
                let status = status.clone();
                self.post_failure(tag, &ops, status);
            }
            LbCallState::Unpicked | LbCallState::PickQueued => {
                let Some(kind) = ops.first_op() else {
                    self.post(tag, BatchResult::ok());
                    return;
                };
                if let Err((tag, ops)) = self.pending.add(kind, (tag, ops)) {
                    self.post_failure(
                        tag,
                        &ops,
                        Status::internal(format!("an op of kind {kind:?} is already pending")),
                    );
                    return;
                }
                if kind == OpKind::SendInitialMetadata
                    && matches!(self.state, LbCallState::Unpicked)
                {
                    self.pick();
                }
            }
        }
    }

    fn pick(&mut self) {
        let metadata = match self
            .pending
            .find_mut(|(_, ops)| ops.send_initial_metadata.is_some())
            .and_then(|(_, ops)| ops.send_initial_metadata.as_mut())
        {
            // Lent to the picker, which may edit it.
            Some(op) => std::mem::take(&mut op.metadata),
            None => return,
        };
        let outcome = self.ctx.shared.pick(PickRequest {
            call_id: self.ctx.id,
            attempt: self.attempt,
            path: &self.ctx.path,
            metadata,
            wait_for_ready: self.wait_for_ready,
            tx: &self.ctx.tx,
        });
        match outcome {
            PickOutcome::Complete(picked, metadata) => self.on_pick_complete(metadata, Ok(picked)),
            PickOutcome::Queued => {
                trace!(call = self.ctx.id, attempt = self.attempt, "pick queued");
                self.state = LbCallState::PickQueued;
            }
            PickOutcome::Failed(status) => {
                self.on_pick_complete(MetadataMap::new(), Err(status))
            }
        }
    }

    /// Handles the answer to a queued pick.
    pub(crate) fn on_pick_done(
        &mut self,
        metadata: MetadataMap,
        result: Result<PickedSubchannel, Status>,
    ) {
        if matches!(self.state, LbCallState::PickQueued) {
            self.on_pick_complete(metadata, result);
        }
    }

    fn on_pick_complete(
        &mut self,
        metadata: MetadataMap,
        result: Result<PickedSubchannel, Status>,
    ) {
        if let Some(op) = self
            .pending
            .find_mut(|(_, ops)| ops.send_initial_metadata.is_some())
            .and_then(|(_, ops)| ops.send_initial_metadata.as_mut())
        {
            op.metadata = metadata;
        }
        match result {
            Ok(picked) => {
                trace!(
                    call = self.ctx.id,
                    attempt = self.attempt,
                    address = %picked.connected.address(),
                    "pick complete"
                );
                self.on_complete = picked.on_complete;
                let stream = picked.connected.create_stream(StreamArgs {
                    path: self.ctx.path.to_string(),
                    deadline: self.deadline,
                });
                self.state = LbCallState::Active(stream);
                for (tag, ops) in self.pending.take_all() {
                    self.dispatch(tag, ops);
                }
            }
            Err(status) => {
                trace!(call = self.ctx.id, attempt = self.attempt, %status, "pick failed");
                self.fail_pending(status);
            }
        }
    }

    fn fail_pending(&mut self, status: Status) {
        self.state = LbCallState::Failed(status.clone());
        for (tag, ops) in self.pending.take_all() {
            self.post_failure(tag, &ops, status.clone());
        }
    }

    fn dispatch(&mut self, tag: u64, ops: BatchOps) {
        let LbCallState::Active(stream) = &mut self.state else {
            return;
        };
        let tx = self.ctx.tx.clone();
        let attempt = self.attempt;
        stream.start_batch(Batch::new(
            ops,
            Completion::new(move |result| {
                let _ = tx.send(CallEvent::TransportBatchDone {
                    attempt,
                    tag,
                    result,
                });
            }),
        ));
    }

    fn post(&self, tag: u64, result: BatchResult) {
        let _ = self.ctx.tx.send(CallEvent::TransportBatchDone {
            attempt: self.attempt,
            tag,
            result,
        });
    }

    fn post_failure(&self, tag: u64, ops: &BatchOps, status: Status) {
        self.post(tag, BatchResult::failure(ops, status));
    }

    /// Must be called with every result of this attempt before it is
    /// interpreted.  Runs the pick's completion hook once trailers arrive.
    pub(crate) fn on_batch_done(&mut self, result: &BatchResult) {
        if let Some(trailers) = &result.recv_trailing_metadata {
            self.finished = true;
            if let Some(hook) = self.on_complete.take() {
                hook(&CallCompletion {
                    status: &trailers.status,
                    trailing_metadata: &trailers.metadata,
                });
            }
        }
    }

    pub(crate) fn cancel(&mut self, status: Status) {
        match &mut self.state {
            LbCallState::Active(stream) => {
                if !self.finished {
                    self.finished = true;
                    stream.start_batch(Batch::new(BatchOps::cancel(status), Completion::noop()));
                }
            }
            LbCallState::PickQueued => {
                self.ctx.shared.remove_queued_pick(self.ctx.id, self.attempt);
                self.fail_pending(status);
            }
            LbCallState::Unpicked => self.fail_pending(status),
            LbCallState::Failed(_) => {}
        }
    }
}

impl Drop for LbCall {
    fn drop(&mut self) {
        match &mut self.state {
            LbCallState::PickQueued => {
                self.ctx.shared.remove_queued_pick(self.ctx.id, self.attempt);
            }
            LbCallState::Active(stream) if !self.finished => {
                stream.start_batch(Batch::new(
                    BatchOps::cancel(Status::cancelled("call attempt abandoned")),
                    Completion::noop(),
                ));
            }
            _ => {}
        }
        if let Some(hook) = self.on_complete.take() {
            hook(&CallCompletion {
                status: &Status::cancelled("call attempt abandoned"),
                trailing_metadata: &MetadataMap::new(),
            });
        }
    }
}
