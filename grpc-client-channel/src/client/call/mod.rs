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

//! Calls.
//!
//! A call is a task with its own mailbox.  Caller batches, resolver and
//! picker wake-ups, transport completions and timers are all delivered as
//! [`CallEvent`]s, so the three call stages never run concurrently with each
//! other.
//!
//! The stages nest: [`call_data`] waits for a resolver result and applies the
//! per-call config, [`retry`] caches send ops and replays them on new
//! attempts, and [`lb_call`] picks a subchannel and drives one transport
//! stream.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::metadata::MetadataMap;

use crate::client::channel::{ChannelShared, PickedSubchannel};
use crate::status::Status;

mod batch;
mod call_data;
mod lb_call;
mod retry;

pub use batch::{
    Batch, BatchOps, BatchResult, Completion, RecvInitialMetadata, SendInitialMetadata, Trailers,
};
pub(crate) use batch::{OpKind, PendingBatch, PendingBatchQueue};

use call_data::CallData;

pub(crate) type CallTx = mpsc::UnboundedSender<CallEvent>;

pub(crate) enum CallEvent {
    Batch(Batch),
    /// The channel's resolution state changed; re-check it.
    ResolutionChanged,
    /// A queued pick for `attempt` finished.  `metadata` is the initial
    /// metadata handed to the picker.
    PickDone {
        attempt: u32,
        metadata: MetadataMap,
        result: Result<PickedSubchannel, Status>,
    },
    TransportBatchDone {
        attempt: u32,
        tag: u64,
        result: BatchResult,
    },
}

/// Parameters of a call.
#[derive(Debug, Clone)]
pub struct CallArgs {
    path: String,
    deadline: Option<Instant>,
}

impl CallArgs {
    /// `path` is the method path, e.g. `/pkg.Service/Method`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// State every stage of a call needs.
#[derive(Clone)]
pub(crate) struct CallContext {
    pub(crate) id: u64,
    pub(crate) shared: Arc<ChannelShared>,
    pub(crate) tx: CallTx,
    pub(crate) path: Arc<str>,
}

/// One RPC on a [`Channel`](crate::client::Channel).
///
/// Ops are started with [`Call::start_batch`].  Dropping the call cancels it.
pub struct Call {
    id: u64,
    tx: CallTx,
    _cancel_on_drop: DropGuard,
}

impl Call {
    pub(crate) fn new(shared: Arc<ChannelShared>, args: CallArgs) -> Self {
        let id = shared.next_call_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let runtime = shared.runtime.clone();
        let ctx = CallContext {
            id,
            shared,
            tx: tx.clone(),
            path: args.path.into(),
        };
        let call_data = CallData::new(ctx, args.deadline);
        let _ = runtime.spawn(Box::pin(call_data.run(rx, token.clone())));
        Self {
            id,
            tx,
            _cancel_on_drop: token.drop_guard(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Starts a batch of ops.  Its completion runs once every op is done.
    pub fn start_batch(&self, batch: Batch) {
        if let Err(mpsc::error::SendError(CallEvent::Batch(batch))) =
            self.tx.send(CallEvent::Batch(batch))
        {
            batch.fail(Status::cancelled("call already finished"));
        }
    }

    /// Cancels the call.  Outstanding ops fail with CANCELLED.
    pub fn cancel(&self) {
        self.start_batch(Batch::new(
            BatchOps::cancel(Status::cancelled("call cancelled by the application")),
            Completion::noop(),
        ));
    }

    /// Sends `request` and returns the single response message.
    pub async fn unary(
        &self,
        initial_metadata: SendInitialMetadata,
        request: Bytes,
    ) -> Result<Bytes, Status> {
        let (send_done, send_rx) = Completion::channel();
        self.start_batch(Batch::new(
            BatchOps::new()
                .send_initial_metadata(initial_metadata)
                .send_message(request)
                .send_trailing_metadata(),
            send_done,
        ));
        let (recv_done, recv_rx) = Completion::channel();
        self.start_batch(Batch::new(
            BatchOps::new()
                .recv_initial_metadata()
                .recv_message()
                .recv_trailing_metadata(),
            recv_done,
        ));

        let response = recv_rx
            .await
            .map_err(|_| Status::cancelled("call dropped"))?;
        // The final status is in the trailers; the send result adds nothing.
        let _ = send_rx.await;
        let trailers = response
            .recv_trailing_metadata
            .ok_or_else(|| Status::internal("no trailing metadata"))?;
        if !trailers.status.is_ok() {
            return Err(trailers.status);
        }
        match response.recv_message {
            Some(Ok(Some(message))) => Ok(message),
            Some(Err(status)) => Err(status),
            _ => Err(Status::internal("server sent no response message")),
        }
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("id", &self.id).finish()
    }
}
