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

//! The interface between the channel and the wire.
//!
//! A [`Transport`] turns an address into a live connection.  Connections
//! create one [`TransportStream`] per call attempt, and streams accept the
//! same operation batches callers issue on the channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tonic::async_trait;

use crate::client::call::Batch;
use crate::client::channel_args::ChannelArgs;
use crate::client::name_resolution::Address;
use crate::status::Status;

mod registry;
#[cfg(test)]
pub(crate) mod test_utils;

pub use registry::TransportRegistry;

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The connection was closed gracefully.
    Closed,
    /// The peer closed the connection because the client sent keepalive
    /// pings too often.
    TooManyPings,
    Error(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "connection closed"),
            DisconnectReason::TooManyPings => write!(f, "too many pings"),
            DisconnectReason::Error(e) => write!(f, "connection error: {e}"),
        }
    }
}

/// A connection returned by [`Transport::connect`].
pub struct ConnectedTransport {
    pub connection: Arc<dyn TransportConnection>,
    /// Fires once when the connection is lost.  Dropping the sender is
    /// treated as [`DisconnectReason::Closed`].
    pub disconnection_listener: oneshot::Receiver<DisconnectReason>,
}

/// Settings a subchannel passes when it connects.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct TransportOptions {
    /// Interval between keepalive pings, if enabled.
    pub keepalive_time: Option<Duration>,
    /// The subchannel's args.
    pub channel_args: ChannelArgs,
}

/// Establishes connections for one network type.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        address: &Address,
        options: &TransportOptions,
    ) -> Result<ConnectedTransport, Status>;
}

/// Per-stream parameters.
#[derive(Debug, Clone)]
pub struct StreamArgs {
    pub path: String,
    pub deadline: Option<tokio::time::Instant>,
}

/// A live connection that can carry streams.
pub trait TransportConnection: Send + Sync {
    fn create_stream(&self, args: StreamArgs) -> Box<dyn TransportStream>;
}

/// One stream on a connection.
///
/// Each batch's completion is invoked once every op in it is done.  A
/// cancel batch completes immediately and makes all outstanding ops finish
/// with the cancel status.  Completions may run synchronously inside
/// `start_batch`.
pub trait TransportStream: Send {
    fn start_batch(&mut self, batch: Batch);
}
