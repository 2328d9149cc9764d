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

//! Stream operation batches: the vocabulary shared by callers, the retry
//! stage and transports.

use std::fmt;

use bytes::Bytes;
use tokio::sync::oneshot;
use tonic::metadata::MetadataMap;

use crate::status::Status;

/// The kinds of operation a batch may carry, in the order they are
/// dispatched.  Each kind owns one slot in a [`PendingBatchQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OpKind {
    SendInitialMetadata = 0,
    SendMessage = 1,
    SendTrailingMetadata = 2,
    RecvInitialMetadata = 3,
    RecvMessage = 4,
    RecvTrailingMetadata = 5,
}

impl OpKind {
    pub(crate) const ALL: [OpKind; 6] = [
        OpKind::SendInitialMetadata,
        OpKind::SendMessage,
        OpKind::SendTrailingMetadata,
        OpKind::RecvInitialMetadata,
        OpKind::RecvMessage,
        OpKind::RecvTrailingMetadata,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Request headers for a call.
#[derive(Debug, Clone, Default)]
pub struct SendInitialMetadata {
    pub metadata: MetadataMap,
    /// If set, overrides the method config's `waitForReady`.
    pub wait_for_ready: Option<bool>,
}

impl SendInitialMetadata {
    pub fn new(metadata: MetadataMap) -> Self {
        Self {
            metadata,
            wait_for_ready: None,
        }
    }

    pub fn with_wait_for_ready(mut self, wait_for_ready: bool) -> Self {
        self.wait_for_ready = Some(wait_for_ready);
        self
    }
}

/// The operations of one batch.  A batch may carry any combination of ops,
/// but at most one of each kind.
#[derive(Debug, Clone, Default)]
pub struct BatchOps {
    pub send_initial_metadata: Option<SendInitialMetadata>,
    pub send_message: Option<Bytes>,
    pub send_trailing_metadata: bool,
    pub recv_initial_metadata: bool,
    pub recv_message: bool,
    pub recv_trailing_metadata: bool,
    /// Cancels the stream with the given status.  A cancel batch carries no
    /// other ops.
    pub cancel: Option<Status>,
}

impl BatchOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send_initial_metadata(mut self, op: SendInitialMetadata) -> Self {
        self.send_initial_metadata = Some(op);
        self
    }

    pub fn send_message(mut self, message: Bytes) -> Self {
        self.send_message = Some(message);
        self
    }

    pub fn send_trailing_metadata(mut self) -> Self {
        self.send_trailing_metadata = true;
        self
    }

    pub fn recv_initial_metadata(mut self) -> Self {
        self.recv_initial_metadata = true;
        self
    }

    pub fn recv_message(mut self) -> Self {
        self.recv_message = true;
        self
    }

    pub fn recv_trailing_metadata(mut self) -> Self {
        self.recv_trailing_metadata = true;
        self
    }

    pub fn cancel(status: Status) -> Self {
        Self {
            cancel: Some(status),
            ..Default::default()
        }
    }

    pub(crate) fn contains(&self, kind: OpKind) -> bool {
        match kind {
            OpKind::SendInitialMetadata => self.send_initial_metadata.is_some(),
            OpKind::SendMessage => self.send_message.is_some(),
            OpKind::SendTrailingMetadata => self.send_trailing_metadata,
            OpKind::RecvInitialMetadata => self.recv_initial_metadata,
            OpKind::RecvMessage => self.recv_message,
            OpKind::RecvTrailingMetadata => self.recv_trailing_metadata,
        }
    }

    /// The kind of the first op in dispatch order, or None for an empty or
    /// cancel-only batch.
    pub(crate) fn first_op(&self) -> Option<OpKind> {
        OpKind::ALL.into_iter().find(|kind| self.contains(*kind))
    }

    pub(crate) fn kinds(&self) -> impl Iterator<Item = OpKind> + '_ {
        OpKind::ALL.into_iter().filter(|kind| self.contains(*kind))
    }
}

/// Response headers.
#[derive(Debug, Clone, Default)]
pub struct RecvInitialMetadata {
    pub metadata: MetadataMap,
    /// Set when the server answered with trailers only, so no messages will
    /// follow.
    pub trailers_only: bool,
}

/// The final status of a stream and its trailing metadata.
#[derive(Debug, Clone)]
pub struct Trailers {
    pub status: Status,
    pub metadata: MetadataMap,
}

impl Trailers {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            metadata: MetadataMap::new(),
        }
    }
}

/// The outcome of a batch.  Fields for recv ops are populated only if the
/// batch requested them.
#[derive(Debug, Clone)]
pub struct BatchResult {
    /// Whether the batch's send ops were accepted.
    pub status: Status,
    pub recv_initial_metadata: Option<Result<RecvInitialMetadata, Status>>,
    /// `Ok(None)` means the server will send no more messages.
    pub recv_message: Option<Result<Option<Bytes>, Status>>,
    pub recv_trailing_metadata: Option<Trailers>,
}

impl BatchResult {
    pub fn ok() -> Self {
        Self::from_status(Status::ok())
    }

    pub fn from_status(status: Status) -> Self {
        Self {
            status,
            recv_initial_metadata: None,
            recv_message: None,
            recv_trailing_metadata: None,
        }
    }

    /// A result failing every op in `ops` with `status`.
    pub fn failure(ops: &BatchOps, status: Status) -> Self {
        let mut result = Self::ok();
        for kind in ops.kinds() {
            result.fail_op(kind, &status);
        }
        result.status = status;
        result
    }

    pub(crate) fn fail_op(&mut self, kind: OpKind, status: &Status) {
        match kind {
            OpKind::SendInitialMetadata | OpKind::SendMessage | OpKind::SendTrailingMetadata => {
                if self.status.is_ok() {
                    self.status = status.clone();
                }
            }
            OpKind::RecvInitialMetadata => self.recv_initial_metadata = Some(Err(status.clone())),
            OpKind::RecvMessage => self.recv_message = Some(Err(status.clone())),
            OpKind::RecvTrailingMetadata => {
                self.recv_trailing_metadata = Some(Trailers::new(status.clone()))
            }
        }
    }
}

/// Invoked exactly once with the outcome of a batch.
///
/// A completion dropped without being invoked reports CANCELLED, so a caller
/// awaiting a batch is never left hanging.
pub struct Completion {
    f: Option<Box<dyn FnOnce(BatchResult) + Send>>,
}

impl Completion {
    pub fn new(f: impl FnOnce(BatchResult) + Send + 'static) -> Self {
        Self {
            f: Some(Box::new(f)),
        }
    }

    /// A completion that delivers the result to the returned receiver.
    pub fn channel() -> (Self, oneshot::Receiver<BatchResult>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::new(move |result| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    pub fn noop() -> Self {
        Self { f: None }
    }

    pub fn complete(mut self, result: BatchResult) {
        if let Some(f) = self.f.take() {
            f(result);
        }
    }

    /// Runs `hook` right before the wrapped completion.
    pub(crate) fn before(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        let inner = self.f.take();
        Self::new(move |result| {
            hook();
            if let Some(f) = inner {
                f(result);
            }
        })
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f(BatchResult::from_status(Status::cancelled(
                "batch dropped before completion",
            )));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// A set of operations together with the callback to run when all of them
/// are done.
#[derive(Debug)]
pub struct Batch {
    pub ops: BatchOps,
    pub on_complete: Completion,
}

impl Batch {
    pub fn new(ops: BatchOps, on_complete: Completion) -> Self {
        Self { ops, on_complete }
    }

    /// Fails every op in the batch with `status`.
    pub fn fail(self, status: Status) {
        let result = BatchResult::failure(&self.ops, status);
        self.on_complete.complete(result);
    }
}

/// A caller batch whose ops are delivered one at a time, possibly from
/// different attempts, and which completes once every op has a result.
pub(crate) struct PendingBatch {
    pub(crate) ops: BatchOps,
    outstanding: [bool; 6],
    result: BatchResult,
    on_complete: Completion,
    /// Position of this batch's message among all messages sent on the call.
    pub(crate) send_message_index: Option<usize>,
}

impl PendingBatch {
    pub(crate) fn new(batch: Batch) -> Self {
        let mut outstanding = [false; 6];
        for kind in batch.ops.kinds() {
            outstanding[kind.index()] = true;
        }
        Self {
            ops: batch.ops,
            outstanding,
            result: BatchResult::ok(),
            on_complete: batch.on_complete,
            send_message_index: None,
        }
    }

    pub(crate) fn is_outstanding(&self, kind: OpKind) -> bool {
        self.outstanding[kind.index()]
    }

    pub(crate) fn is_done(&self) -> bool {
        !self.outstanding.iter().any(|o| *o)
    }

    pub(crate) fn complete_send(&mut self, kind: OpKind, status: &Status) {
        self.outstanding[kind.index()] = false;
        if !status.is_ok() && self.result.status.is_ok() {
            self.result.status = status.clone();
        }
    }

    pub(crate) fn complete_recv_initial_metadata(
        &mut self,
        result: Result<RecvInitialMetadata, Status>,
    ) {
        self.outstanding[OpKind::RecvInitialMetadata.index()] = false;
        self.result.recv_initial_metadata = Some(result);
    }

    pub(crate) fn complete_recv_message(&mut self, result: Result<Option<Bytes>, Status>) {
        self.outstanding[OpKind::RecvMessage.index()] = false;
        self.result.recv_message = Some(result);
    }

    pub(crate) fn complete_recv_trailing_metadata(&mut self, trailers: Trailers) {
        self.outstanding[OpKind::RecvTrailingMetadata.index()] = false;
        self.result.recv_trailing_metadata = Some(trailers);
    }

    pub(crate) fn fail_op(&mut self, kind: OpKind, status: &Status) {
        if self.is_outstanding(kind) {
            self.outstanding[kind.index()] = false;
            self.result.fail_op(kind, status);
        }
    }

    /// Fails every op that has no result yet and completes the batch.
    pub(crate) fn fail(mut self, status: &Status) {
        for kind in OpKind::ALL {
            self.fail_op(kind, status);
        }
        self.finish();
    }

    pub(crate) fn finish(self) {
        self.on_complete.complete(self.result);
    }
}

/// Holds batches until they can be sent downstream.  There is one slot per
/// op kind and a batch occupies the slot of its first op, so a caller may
/// have at most one outstanding batch starting with each kind.
pub(crate) struct PendingBatchQueue<T> {
    slots: [Option<T>; 6],
}

impl<T> PendingBatchQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Stores `item` in the slot for `kind`.  Returns the item back if the
    /// slot is taken.
    pub(crate) fn add(&mut self, kind: OpKind, item: T) -> Result<(), T> {
        let slot = &mut self.slots[kind.index()];
        if slot.is_some() {
            return Err(item);
        }
        *slot = Some(item);
        Ok(())
    }

    /// Removes every item, in slot order.
    pub(crate) fn take_all(&mut self) -> Vec<T> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Returns the first item matching `pred`.
    pub(crate) fn find_mut(&mut self, mut pred: impl FnMut(&T) -> bool) -> Option<&mut T> {
        self.slots.iter_mut().flatten().find(|item| pred(item))
    }

    /// Removes and returns every item matching `pred`, in slot order.
    pub(crate) fn remove_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(&mut pred) {
                removed.extend(slot.take());
            }
        }
        removed
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().flatten()
    }
}

impl PendingBatchQueue<PendingBatch> {
    /// Completes every batch whose ops all have results.
    pub(crate) fn finish_done(&mut self) {
        for pending in self.remove_where(PendingBatch::is_done) {
            pending.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusCode;

    #[test]
    fn first_op_follows_dispatch_order() {
        let ops = BatchOps::new().recv_trailing_metadata().send_message(Bytes::from("m"));
        assert_eq!(ops.first_op(), Some(OpKind::SendMessage));
        assert_eq!(
            ops.kinds().collect::<Vec<_>>(),
            vec![OpKind::SendMessage, OpKind::RecvTrailingMetadata]
        );
        assert_eq!(BatchOps::cancel(Status::cancelled("x")).first_op(), None);
    }

    fn pending(ops: BatchOps, on_complete: Completion) -> PendingBatch {
        PendingBatch::new(Batch::new(ops, on_complete))
    }

    #[test]
    fn conflicting_batch_is_handed_back() {
        let mut queue = PendingBatchQueue::new();
        let (c1, mut rx1) = Completion::channel();
        let (c2, mut rx2) = Completion::channel();
        let kind = OpKind::RecvMessage;
        assert!(queue.add(kind, pending(BatchOps::new().recv_message(), c1)).is_ok());
        let Err(rejected) = queue.add(kind, pending(BatchOps::new().recv_message(), c2)) else {
            panic!("second recv_message batch was accepted");
        };
        rejected.fail(&Status::internal("conflict"));

        assert!(rx1.try_recv().is_err());
        let result = rx2.try_recv().unwrap();
        assert_eq!(result.status.code(), StatusCode::Internal);
        assert!(matches!(result.recv_message, Some(Err(_))));
    }

    #[test]
    fn batch_completes_after_every_op() {
        let mut queue = PendingBatchQueue::new();
        let (c, mut rx) = Completion::channel();
        let ops = BatchOps::new()
            .recv_initial_metadata()
            .recv_trailing_metadata();
        assert!(queue.add(OpKind::RecvInitialMetadata, pending(ops, c)).is_ok());

        queue
            .find_mut(|p| p.is_outstanding(OpKind::RecvInitialMetadata))
            .unwrap()
            .complete_recv_initial_metadata(Ok(RecvInitialMetadata::default()));
        queue.finish_done();
        assert!(rx.try_recv().is_err());

        queue
            .find_mut(|p| p.is_outstanding(OpKind::RecvTrailingMetadata))
            .unwrap()
            .complete_recv_trailing_metadata(Trailers::new(Status::ok()));
        queue.finish_done();
        let result = rx.try_recv().unwrap();
        assert!(result.recv_initial_metadata.unwrap().is_ok());
        assert!(result.recv_trailing_metadata.unwrap().status.is_ok());
        assert!(queue.take_all().is_empty());
    }

    #[test]
    fn take_all_is_in_slot_order() {
        let mut queue = PendingBatchQueue::new();
        queue.add(OpKind::RecvTrailingMetadata, 5).unwrap();
        queue.add(OpKind::SendInitialMetadata, 0).unwrap();
        queue.add(OpKind::RecvMessage, 4).unwrap();
        assert_eq!(queue.add(OpKind::RecvMessage, 9), Err(9));
        assert_eq!(queue.take_all(), vec![0, 4, 5]);
    }

    #[test]
    fn dropped_completion_reports_cancelled() {
        let (c, mut rx) = Completion::channel();
        drop(c);
        assert_eq!(rx.try_recv().unwrap().status.code(), StatusCode::Cancelled);

        let (c, mut rx) = Completion::channel();
        let fired = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let fired2 = fired.clone();
        c.before(move || fired2.store(true, std::sync::atomic::Ordering::SeqCst))
            .complete(BatchResult::ok());
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(rx.try_recv().unwrap().status.is_ok());
    }
}
