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

//! Transparent retries.
//!
//! Every send op is cached until the call commits so that it can be replayed
//! on a new attempt.  Results that would reveal a failed attempt to the
//! caller (an error, a trailers-only response, the end of the message stream)
//! are held back until the attempt's final status decides between retrying
//! and committing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tonic::metadata::{MetadataMap, MetadataValue};
use tracing::trace;

use super::lb_call::LbCall;
use super::{
    Batch, BatchOps, BatchResult, CallContext, OpKind, PendingBatch, PendingBatchQueue,
    RecvInitialMetadata, SendInitialMetadata, Trailers,
};
use crate::client::backoff::{BackoffConfig, ExponentialBackoff, RETRY_BACKOFF_JITTER};
use crate::client::channel::PickedSubchannel;
use crate::client::retry_throttle::RetryThrottler;
use crate::client::service_config::RetryPolicy;
use crate::status::Status;

const PREVIOUS_RPC_ATTEMPTS: &str = "grpc-previous-rpc-attempts";
const RETRY_PUSHBACK_MS: &str = "grpc-retry-pushback-ms";

#[derive(Debug, Clone, Copy)]
enum AttemptOp {
    SendInitialMetadata,
    SendMessage(usize),
    SendTrailingMetadata,
    RecvInitialMetadata,
    RecvMessage,
    RecvTrailingMetadata,
}

// Per-attempt bookkeeping.  Each op is sent to the LB call as its own batch.
struct Attempt {
    lb_call: LbCall,
    next_tag: u64,
    ops: HashMap<u64, AttemptOp>,
    started_send_initial: bool,
    started_messages: usize,
    completed_messages: usize,
    message_in_flight: bool,
    started_send_trailing: bool,
    started_recv_initial: bool,
    recv_message_in_flight: bool,
    started_recv_trailing: bool,
    deferred_recv_initial: Option<Result<RecvInitialMetadata, Status>>,
    deferred_recv_message: Option<Result<Option<Bytes>, Status>>,
}

impl Attempt {
    fn new(lb_call: LbCall) -> Self {
        Self {
            lb_call,
            next_tag: 0,
            ops: HashMap::new(),
            started_send_initial: false,
            started_messages: 0,
            completed_messages: 0,
            message_in_flight: false,
            started_send_trailing: false,
            started_recv_initial: false,
            recv_message_in_flight: false,
            started_recv_trailing: false,
            deferred_recv_initial: None,
            deferred_recv_message: None,
        }
    }

    fn number(&self) -> u32 {
        self.lb_call.attempt()
    }

    fn start(&mut self, op: AttemptOp, ops: BatchOps) {
        let tag = self.next_tag;
        self.next_tag += 1;
        self.ops.insert(tag, op);
        self.lb_call.start_batch(tag, ops);
    }

    /// Asks for the final status so that held-back results can be resolved,
    /// whether or not the caller asked for trailers yet.
    fn start_internal_recv_trailing(&mut self) {
        if !self.started_recv_trailing {
            self.started_recv_trailing = true;
            self.start(
                AttemptOp::RecvTrailingMetadata,
                BatchOps::new().recv_trailing_metadata(),
            );
        }
    }
}

// Cached send_message payloads, addressed by their position in the call's
// message sequence.  Released entries at the front are dropped so a committed
// streaming call holds only the messages it has yet to send.
#[derive(Default)]
struct MessageCache {
    base: usize,
    messages: VecDeque<Option<Bytes>>,
}

impl MessageCache {
    /// Number of messages the caller has started, released or not.
    fn end(&self) -> usize {
        self.base + self.messages.len()
    }

    fn push(&mut self, message: Bytes) {
        self.messages.push_back(Some(message));
    }

    fn get(&self, index: usize) -> Option<&Bytes> {
        let slot = self.messages.get(index.checked_sub(self.base)?)?;
        slot.as_ref()
    }

    fn release(&mut self, index: usize) {
        if let Some(slot) = index
            .checked_sub(self.base)
            .and_then(|i| self.messages.get_mut(i))
        {
            *slot = None;
        }
        while let Some(None) = self.messages.front() {
            self.messages.pop_front();
            self.base += 1;
        }
    }

    /// Releases every message before `end`.
    fn release_before(&mut self, end: usize) {
        while self.base < end && self.messages.pop_front().is_some() {
            self.base += 1;
        }
    }
}

pub(crate) struct RetryingCall {
    ctx: CallContext,
    policy: RetryPolicy,
    throttler: Option<Arc<RetryThrottler>>,
    deadline: Option<Instant>,
    wait_for_ready: bool,
    enable_retries: bool,
    committed: bool,
    bytes_buffered: usize,
    num_attempts_completed: u32,
    next_attempt: u32,
    backoff: Option<ExponentialBackoff>,
    retry_at: Option<Instant>,
    batches: PendingBatchQueue<PendingBatch>,
    // Cached send ops.  Messages are freed once sent on the committed attempt.
    send_initial: Option<SendInitialMetadata>,
    messages: MessageCache,
    send_trailing: bool,
    attempt: Option<Attempt>,
    cancelled: Option<Status>,
    final_trailers: Option<Trailers>,
}

impl RetryingCall {
    pub(crate) fn new(
        ctx: CallContext,
        policy: RetryPolicy,
        throttler: Option<Arc<RetryThrottler>>,
        deadline: Option<Instant>,
        wait_for_ready: bool,
    ) -> Self {
        Self {
            ctx,
            policy,
            throttler,
            deadline,
            wait_for_ready,
            enable_retries: true,
            committed: false,
            bytes_buffered: 0,
            num_attempts_completed: 0,
            next_attempt: 0,
            backoff: None,
            retry_at: None,
            batches: PendingBatchQueue::new(),
            send_initial: None,
            messages: MessageCache::default(),
            send_trailing: false,
            attempt: None,
            cancelled: None,
            final_trailers: None,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.final_trailers.is_some()
    }

    pub(crate) fn next_timer(&self) -> Option<Instant> {
        self.retry_at
    }

    pub(crate) fn start_batch(&mut self, batch: Batch) {
        if let Some(trailers) = &self.final_trailers {
            let mut pending = PendingBatch::new(batch);
            complete_from_trailers(&mut pending, trailers);
            pending.finish();
            return;
        }
        let Some(kind) = batch.ops.first_op() else {
            batch.on_complete.complete(BatchResult::ok());
            return;
        };

        let mut pending = PendingBatch::new(batch);
        let send_initial = pending.ops.send_initial_metadata.clone();
        let message = pending.ops.send_message.clone();
        let send_trailing = pending.ops.send_trailing_metadata;
        if message.is_some() {
            pending.send_message_index = Some(self.messages.end());
        }
        if let Err(pending) = self.batches.add(kind, pending) {
            pending.fail(&Status::internal(format!(
                "a batch starting with {kind:?} is already pending"
            )));
            return;
        }
        if let Some(op) = send_initial {
            self.bytes_buffered += metadata_size(&op.metadata);
            self.send_initial = Some(op);
        }
        if let Some(message) = message {
            self.bytes_buffered += message.len();
            self.messages.push(message);
        }
        if send_trailing {
            self.send_trailing = true;
        }

        if !self.committed && self.bytes_buffered > self.ctx.shared.per_rpc_retry_buffer_size {
            trace!(
                call = self.ctx.id,
                bytes = self.bytes_buffered,
                "retry buffer limit exceeded"
            );
            if self.num_attempts_completed == 0 {
                self.enable_retries = false;
            }
            self.commit();
        }

        if self.attempt.is_none() && self.retry_at.is_none() {
            self.start_attempt();
        } else {
            self.start_attempt_ops();
        }
        self.batches.finish_done();
    }

    fn start_attempt(&mut self) {
        self.next_attempt += 1;
        trace!(
            call = self.ctx.id,
            attempt = self.next_attempt,
            previous_attempts = self.num_attempts_completed,
            "starting call attempt"
        );
        let lb_call = LbCall::new(
            self.ctx.clone(),
            self.next_attempt,
            self.deadline,
            self.wait_for_ready,
        );
        self.attempt = Some(Attempt::new(lb_call));
        self.start_attempt_ops();
    }

    /// Starts whatever the current attempt has not sent yet: cached sends in
    /// their original order, then the caller's outstanding recv ops.
    fn start_attempt_ops(&mut self) {
        let messages_end = self.messages.end();
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        if !attempt.started_send_initial {
            let Some(op) = &self.send_initial else {
                return;
            };
            let mut op = op.clone();
            if self.num_attempts_completed > 0 {
                op.metadata.insert(
                    PREVIOUS_RPC_ATTEMPTS,
                    MetadataValue::from(self.num_attempts_completed),
                );
            }
            attempt.started_send_initial = true;
            attempt.start(
                AttemptOp::SendInitialMetadata,
                BatchOps::new().send_initial_metadata(op),
            );
        }
        // One message at a time keeps them in order.
        if !attempt.message_in_flight && attempt.started_messages < messages_end {
            let index = attempt.started_messages;
            if let Some(message) = self.messages.get(index) {
                attempt.started_messages += 1;
                attempt.message_in_flight = true;
                attempt.start(
                    AttemptOp::SendMessage(index),
                    BatchOps::new().send_message(message.clone()),
                );
            }
        }
        if self.send_trailing
            && !attempt.started_send_trailing
            && attempt.started_messages == messages_end
        {
            attempt.started_send_trailing = true;
            attempt.start(
                AttemptOp::SendTrailingMetadata,
                BatchOps::new().send_trailing_metadata(),
            );
        }

        let wants = |kind: OpKind| self.batches.iter().any(|p| p.is_outstanding(kind));
        if !attempt.started_recv_initial && wants(OpKind::RecvInitialMetadata) {
            attempt.started_recv_initial = true;
            attempt.start(
                AttemptOp::RecvInitialMetadata,
                BatchOps::new().recv_initial_metadata(),
            );
        }
        if !attempt.recv_message_in_flight
            && attempt.deferred_recv_message.is_none()
            && wants(OpKind::RecvMessage)
        {
            attempt.recv_message_in_flight = true;
            attempt.start(AttemptOp::RecvMessage, BatchOps::new().recv_message());
        }
        if !attempt.started_recv_trailing && wants(OpKind::RecvTrailingMetadata) {
            attempt.started_recv_trailing = true;
            attempt.start(
                AttemptOp::RecvTrailingMetadata,
                BatchOps::new().recv_trailing_metadata(),
            );
        }
    }

    pub(crate) fn on_pick_done(
        &mut self,
        attempt: u32,
        metadata: MetadataMap,
        result: Result<PickedSubchannel, Status>,
    ) {
        if let Some(current) = self.attempt.as_mut().filter(|a| a.number() == attempt) {
            current.lb_call.on_pick_done(metadata, result);
        }
    }

    pub(crate) fn on_transport_batch_done(&mut self, attempt: u32, tag: u64, result: BatchResult) {
        // Results of abandoned attempts are dropped.
        let Some(current) = self.attempt.as_mut().filter(|a| a.number() == attempt) else {
            return;
        };
        current.lb_call.on_batch_done(&result);
        let Some(op) = current.ops.remove(&tag) else {
            return;
        };
        match op {
            AttemptOp::SendInitialMetadata => {
                self.complete_caller_send(OpKind::SendInitialMetadata, None, &result.status)
            }
            AttemptOp::SendMessage(index) => {
                current.message_in_flight = false;
                current.completed_messages += 1;
                self.complete_caller_send(OpKind::SendMessage, Some(index), &result.status);
            }
            AttemptOp::SendTrailingMetadata => {
                self.complete_caller_send(OpKind::SendTrailingMetadata, None, &result.status)
            }
            AttemptOp::RecvInitialMetadata => {
                let received = result.recv_initial_metadata.unwrap_or_else(|| {
                    Err(Status::internal("transport returned no initial metadata"))
                });
                if self.committed || matches!(&received, Ok(md) if !md.trailers_only) {
                    self.commit();
                    self.deliver_recv_initial(received);
                } else {
                    current.deferred_recv_initial = Some(received);
                    current.start_internal_recv_trailing();
                }
            }
            AttemptOp::RecvMessage => {
                current.recv_message_in_flight = false;
                let received = result.recv_message.unwrap_or_else(|| {
                    Err(Status::internal("transport returned no message result"))
                });
                if self.committed || matches!(&received, Ok(Some(_))) {
                    self.commit();
                    self.deliver_recv_message(received);
                } else {
                    current.deferred_recv_message = Some(received);
                    current.start_internal_recv_trailing();
                }
            }
            AttemptOp::RecvTrailingMetadata => {
                let trailers = result.recv_trailing_metadata.unwrap_or_else(|| {
                    Trailers::new(Status::internal("transport returned no trailers"))
                });
                self.on_attempt_finished(trailers);
            }
        }
        self.start_attempt_ops();
        self.batches.finish_done();
    }

    fn complete_caller_send(&mut self, kind: OpKind, index: Option<usize>, status: &Status) {
        // Until commit a failed send is hidden; the attempt's status decides.
        let status = if self.committed {
            status.clone()
        } else {
            Status::ok()
        };
        if let Some(pending) = self
            .batches
            .find_mut(|p| p.is_outstanding(kind) && (index.is_none() || p.send_message_index == index))
        {
            pending.complete_send(kind, &status);
        }
        if let Some(index) = index.filter(|_| self.committed) {
            self.messages.release(index);
        }
    }

    fn deliver_recv_initial(&mut self, received: Result<RecvInitialMetadata, Status>) {
        if let Some(pending) = self
            .batches
            .find_mut(|p| p.is_outstanding(OpKind::RecvInitialMetadata))
        {
            pending.complete_recv_initial_metadata(received);
        }
    }

    fn deliver_recv_message(&mut self, received: Result<Option<Bytes>, Status>) {
        if let Some(pending) = self
            .batches
            .find_mut(|p| p.is_outstanding(OpKind::RecvMessage))
        {
            pending.complete_recv_message(received);
        }
    }

    fn commit(&mut self) {
        if self.committed {
            return;
        }
        self.committed = true;
        trace!(
            call = self.ctx.id,
            attempt = self.next_attempt,
            "call committed"
        );
        // Messages already sent on the committed attempt are never replayed.
        let sent = self.attempt.as_ref().map_or(0, |a| a.completed_messages);
        self.messages.release_before(sent);
    }

    fn on_attempt_finished(&mut self, trailers: Trailers) {
        match self.retry_delay(&trailers) {
            Some(delay) => {
                trace!(
                    call = self.ctx.id,
                    attempt = self.next_attempt,
                    status = %trailers.status,
                    ?delay,
                    "retrying call"
                );
                self.attempt = None;
                self.retry_at = Some(Instant::now() + delay);
            }
            None => self.finish(trailers),
        }
    }

    /// Returns the delay before the next attempt, or None if the attempt's
    /// status is final.
    fn retry_delay(&mut self, trailers: &Trailers) -> Option<Duration> {
        let status = &trailers.status;
        if !self.enable_retries {
            trace!(call = self.ctx.id, "retries disabled for call");
            return None;
        }
        if status.is_ok() {
            if let Some(throttler) = &self.throttler {
                throttler.record_success();
            }
            return None;
        }
        if !self.policy.is_retryable(status.code()) {
            trace!(call = self.ctx.id, code = ?status.code(), "status is not retryable");
            return None;
        }
        if let Some(throttler) = &self.throttler {
            if !throttler.record_failure() {
                trace!(call = self.ctx.id, "retries throttled");
                return None;
            }
        }
        if self.committed {
            trace!(call = self.ctx.id, "call already committed");
            return None;
        }
        self.num_attempts_completed += 1;
        if self.num_attempts_completed >= self.policy.max_attempts {
            trace!(
                call = self.ctx.id,
                attempts = self.num_attempts_completed,
                "retry attempts exhausted"
            );
            return None;
        }
        if self.cancelled.is_some() {
            return None;
        }
        if let Some(value) = trailers.metadata.get(RETRY_PUSHBACK_MS) {
            let Some(ms) = value.to_str().ok().and_then(|v| v.parse::<u32>().ok()) else {
                trace!(call = self.ctx.id, "server pushback prevents retry");
                return None;
            };
            // The next computed delay starts over from the initial backoff.
            self.backoff = None;
            return Some(Duration::from_millis(u64::from(ms)));
        }
        let policy = &self.policy;
        let backoff = self.backoff.get_or_insert_with(|| {
            ExponentialBackoff::new(BackoffConfig {
                base_delay: policy.initial_backoff.min(policy.max_backoff),
                multiplier: policy.backoff_multiplier,
                jitter: RETRY_BACKOFF_JITTER,
                max_delay: policy.max_backoff,
            })
            .unwrap_or_default()
        });
        Some(backoff.backoff_duration())
    }

    pub(crate) fn on_timer(&mut self, now: Instant) {
        if self.retry_at.is_some_and(|at| at <= now) {
            self.retry_at = None;
            self.start_attempt();
            self.batches.finish_done();
        }
    }

    /// Ends the call with `trailers`, completing every outstanding caller op.
    fn finish(&mut self, trailers: Trailers) {
        self.commit();
        self.retry_at = None;
        if let Some(attempt) = self.attempt.take() {
            if self.cancelled.is_none() {
                if let Some(received) = attempt.deferred_recv_initial {
                    self.deliver_recv_initial(received);
                }
                if let Some(received) = attempt.deferred_recv_message {
                    self.deliver_recv_message(received);
                }
            }
        }
        for pending in self.batches.iter_mut() {
            complete_from_trailers(pending, &trailers);
        }
        self.batches.finish_done();
        self.final_trailers = Some(trailers);
    }

    pub(crate) fn cancel(&mut self, status: Status) {
        if self.final_trailers.is_some() {
            return;
        }
        trace!(call = self.ctx.id, %status, "cancelling call");
        self.cancelled = Some(status.clone());
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.lb_call.cancel(status.clone());
        }
        self.finish(Trailers::new(status));
    }
}

// Fills every op of `pending` that has no result yet from the call's final
// status.
fn complete_from_trailers(pending: &mut PendingBatch, trailers: &Trailers) {
    let status = &trailers.status;
    for kind in OpKind::ALL {
        if !pending.is_outstanding(kind) {
            continue;
        }
        match kind {
            OpKind::SendInitialMetadata | OpKind::SendMessage | OpKind::SendTrailingMetadata => {
                pending.complete_send(kind, status)
            }
            OpKind::RecvInitialMetadata => {
                pending.complete_recv_initial_metadata(if status.is_ok() {
                    Ok(RecvInitialMetadata::default())
                } else {
                    Err(status.clone())
                })
            }
            OpKind::RecvMessage => pending.complete_recv_message(if status.is_ok() {
                Ok(None)
            } else {
                Err(status.clone())
            }),
            OpKind::RecvTrailingMetadata => pending.complete_recv_trailing_metadata(trailers.clone()),
        }
    }
}

// Counts the bytes the metadata occupies on the wire, keys and values.
fn metadata_size(metadata: &MetadataMap) -> usize {
    let headers: http::HeaderMap = metadata.clone().into_headers();
    headers
        .iter()
        .map(|(name, value)| name.as_str().len() + value.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_size_counts_keys_and_values() {
        let mut md = MetadataMap::new();
        assert_eq!(metadata_size(&md), 0);
        md.insert("key", "value".parse().unwrap());
        md.insert("other", "v".parse().unwrap());
        assert_eq!(metadata_size(&md), 3 + 5 + 5 + 1);
    }

    #[test]
    fn message_cache_drops_released_prefix() {
        let mut cache = MessageCache::default();
        for m in ["a", "b", "c"] {
            cache.push(Bytes::from_static(m.as_bytes()));
        }
        assert_eq!(cache.end(), 3);

        // A release past the front leaves a hole until the front goes too.
        cache.release(1);
        assert_eq!(cache.messages.len(), 3);
        assert_eq!(cache.get(1), None);
        cache.release(0);
        assert_eq!(cache.messages.len(), 1);
        assert_eq!(cache.get(2), Some(&Bytes::from_static(b"c")));

        cache.push(Bytes::from_static(b"d"));
        assert_eq!(cache.end(), 4);
        cache.release(2);
        cache.release(3);
        assert!(cache.messages.is_empty());
        assert_eq!(cache.end(), 4);
        assert_eq!(cache.get(0), None);
    }

    #[test]
    fn commit_releases_messages_already_sent() {
        let mut cache = MessageCache::default();
        for _ in 0..4 {
            cache.push(Bytes::from_static(b"m"));
        }
        cache.release_before(3);
        assert_eq!(cache.messages.len(), 1);
        assert_eq!(cache.base, 3);
        cache.release_before(10);
        assert!(cache.messages.is_empty());
        assert_eq!(cache.end(), 4);
    }

    #[test]
    fn late_batches_complete_from_trailers() {
        let (c, mut rx) = crate::client::call::Completion::channel();
        let mut pending = PendingBatch::new(Batch::new(
            BatchOps::new()
                .recv_message()
                .recv_trailing_metadata(),
            c,
        ));
        complete_from_trailers(&mut pending, &Trailers::new(Status::unavailable("gone")));
        assert!(pending.is_done());
        pending.finish();
        let result = rx.try_recv().unwrap();
        assert!(matches!(result.recv_message, Some(Err(_))));
        assert_eq!(
            result.recv_trailing_metadata.unwrap().status,
            Status::unavailable("gone")
        );
    }
}
