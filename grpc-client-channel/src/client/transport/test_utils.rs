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

//! A scripted in-memory transport for tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tonic::async_trait;
use tonic::metadata::MetadataMap;

use super::{
    ConnectedTransport, DisconnectReason, StreamArgs, Transport, TransportConnection,
    TransportOptions, TransportStream,
};
use crate::client::call::{Batch, BatchOps, BatchResult, Completion, RecvInitialMetadata, Trailers};
use crate::client::name_resolution::Address;
use crate::status::Status;

/// How a fake stream answers recv ops.
#[derive(Debug, Clone)]
pub(crate) enum StreamScript {
    /// Headers, then the given messages, then the trailers.
    Respond {
        messages: Vec<Bytes>,
        trailers: Trailers,
    },
    /// A trailers-only response.
    TrailersOnly(Trailers),
    /// Recv ops never complete on their own; a cancel finishes them.
    Hang,
}

impl StreamScript {
    pub(crate) fn ok(messages: Vec<Bytes>) -> Self {
        StreamScript::Respond {
            messages,
            trailers: Trailers::new(Status::ok()),
        }
    }

    pub(crate) fn fail(status: Status) -> Self {
        StreamScript::TrailersOnly(Trailers::new(status))
    }

    /// A trailers-only failure carrying `grpc-retry-pushback-ms`.
    pub(crate) fn fail_with_pushback(status: Status, pushback: &'static str) -> Self {
        let mut trailers = Trailers::new(status);
        trailers
            .metadata
            .insert("grpc-retry-pushback-ms", pushback.parse().unwrap());
        StreamScript::TrailersOnly(trailers)
    }
}

/// What a fake stream saw from the channel.
#[derive(Debug, Clone)]
pub(crate) struct StreamRecord {
    pub(crate) address: Address,
    pub(crate) path: String,
    pub(crate) created_at: Instant,
    pub(crate) initial_metadata: Option<MetadataMap>,
    pub(crate) messages: Vec<Bytes>,
    pub(crate) half_closed: bool,
    pub(crate) cancelled: Option<Status>,
}

#[derive(Default)]
struct FakeState {
    connect_results: VecDeque<Result<(), Status>>,
    connects: Vec<(Address, TransportOptions)>,
    disconnect_senders: Vec<oneshot::Sender<DisconnectReason>>,
    scripts: VecDeque<StreamScript>,
    streams: Vec<Arc<Mutex<StreamRecord>>>,
}

/// Connections succeed unless a failure was scripted.  Streams follow the
/// scripts pushed with [`FakeTransport::push_stream`], in creation order,
/// and answer with a single `"response"` message once the scripts run out.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_connect_result(&self, result: Result<(), Status>) {
        self.state.lock().connect_results.push_back(result);
    }

    pub(crate) fn push_stream(&self, script: StreamScript) {
        self.state.lock().scripts.push_back(script);
    }

    /// Addresses of every connection attempt, in order.
    pub(crate) fn connects(&self) -> Vec<Address> {
        self.state
            .lock()
            .connects
            .iter()
            .map(|(a, _)| a.clone())
            .collect()
    }

    pub(crate) fn keepalive_times(&self) -> Vec<Option<Duration>> {
        self.state
            .lock()
            .connects
            .iter()
            .map(|(_, o)| o.keepalive_time)
            .collect()
    }

    /// Drops every live connection with `reason`.
    pub(crate) fn disconnect_all(&self, reason: DisconnectReason) {
        let senders = std::mem::take(&mut self.state.lock().disconnect_senders);
        for tx in senders {
            let _ = tx.send(reason.clone());
        }
    }

    pub(crate) fn streams(&self) -> Vec<StreamRecord> {
        self.state
            .lock()
            .streams
            .iter()
            .map(|s| s.lock().clone())
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        address: &Address,
        options: &TransportOptions,
    ) -> Result<ConnectedTransport, Status> {
        let mut state = self.state.lock();
        state.connects.push((address.clone(), options.clone()));
        state.connect_results.pop_front().unwrap_or(Ok(()))?;
        let (tx, rx) = oneshot::channel();
        state.disconnect_senders.push(tx);
        Ok(ConnectedTransport {
            connection: Arc::new(FakeConnection {
                address: address.clone(),
                state: self.state.clone(),
            }),
            disconnection_listener: rx,
        })
    }
}

struct FakeConnection {
    address: Address,
    state: Arc<Mutex<FakeState>>,
}

impl TransportConnection for FakeConnection {
    fn create_stream(&self, args: StreamArgs) -> Box<dyn TransportStream> {
        let mut state = self.state.lock();
        let script = state
            .scripts
            .pop_front()
            .unwrap_or_else(|| StreamScript::ok(vec![Bytes::from_static(b"response")]));
        let record = Arc::new(Mutex::new(StreamRecord {
            address: self.address.clone(),
            path: args.path,
            created_at: Instant::now(),
            initial_metadata: None,
            messages: Vec::new(),
            half_closed: false,
            cancelled: None,
        }));
        state.streams.push(record.clone());
        let messages = match &script {
            StreamScript::Respond { messages, .. } => messages.iter().cloned().collect(),
            _ => VecDeque::new(),
        };
        Box::new(FakeStream {
            record,
            script,
            messages,
            held: Vec::new(),
            cancelled: None,
        })
    }
}

struct FakeStream {
    record: Arc<Mutex<StreamRecord>>,
    script: StreamScript,
    messages: VecDeque<Bytes>,
    held: Vec<(BatchOps, Completion)>,
    cancelled: Option<Status>,
}

impl FakeStream {
    fn record_sends(&self, ops: &BatchOps) {
        let mut record = self.record.lock();
        if let Some(op) = &ops.send_initial_metadata {
            record.initial_metadata = Some(op.metadata.clone());
        }
        if let Some(message) = &ops.send_message {
            record.messages.push(message.clone());
        }
        if ops.send_trailing_metadata {
            record.half_closed = true;
        }
    }

    fn recv_failure(ops: &BatchOps, status: Status) -> BatchResult {
        let mut result = BatchResult::failure(ops, status);
        result.status = Status::ok();
        result
    }
}

impl TransportStream for FakeStream {
    fn start_batch(&mut self, batch: Batch) {
        let Batch { ops, on_complete } = batch;
        if let Some(status) = ops.cancel.clone() {
            self.record.lock().cancelled = Some(status.clone());
            self.cancelled = Some(status.clone());
            for (ops, c) in std::mem::take(&mut self.held) {
                c.complete(Self::recv_failure(&ops, status.clone()));
            }
            on_complete.complete(BatchResult::ok());
            return;
        }
        self.record_sends(&ops);
        if let Some(status) = &self.cancelled {
            on_complete.complete(Self::recv_failure(&ops, status.clone()));
            return;
        }
        let mut result = BatchResult::ok();
        match &self.script {
            StreamScript::Hang => {
                if ops.recv_initial_metadata || ops.recv_message || ops.recv_trailing_metadata {
                    self.held.push((ops, on_complete));
                    return;
                }
            }
            StreamScript::Respond { trailers, .. } => {
                if ops.recv_initial_metadata {
                    result.recv_initial_metadata = Some(Ok(RecvInitialMetadata::default()));
                }
                if ops.recv_message {
                    result.recv_message = Some(Ok(self.messages.pop_front()));
                }
                if ops.recv_trailing_metadata {
                    result.recv_trailing_metadata = Some(trailers.clone());
                }
            }
            StreamScript::TrailersOnly(trailers) => {
                if ops.recv_initial_metadata {
                    result.recv_initial_metadata = Some(Ok(RecvInitialMetadata {
                        metadata: MetadataMap::new(),
                        trailers_only: true,
                    }));
                }
                if ops.recv_message {
                    result.recv_message = Some(Ok(None));
                }
                if ops.recv_trailing_metadata {
                    result.recv_trailing_metadata = Some(trailers.clone());
                }
            }
        }
        on_complete.complete(result);
    }
}
