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


use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use super::Transport;

/// Maps an address's network type (`"tcp"`, `"unix"`, ...) to the transport
/// that dials it.  Subchannels look their transport up once, when created.
#[derive(Default)]
pub struct TransportRegistry {
    by_network_type: RwLock<HashMap<String, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `transport` for addresses of `network_type`, replacing any
    /// transport previously registered for it.
    pub fn add_transport(&self, network_type: &str, transport: impl Transport + 'static) {
        self.by_network_type
            .write()
            .insert(network_type.to_string(), Arc::new(transport));
    }

    pub fn get_transport(&self, network_type: &str) -> Option<Arc<dyn Transport>> {
        self.by_network_type.read().get(network_type).cloned()
    }
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let transports = self.by_network_type.read();
        let mut types: Vec<_> = transports.keys().collect();
        types.sort();
        f.debug_struct("TransportRegistry")
            .field("network_types", &types)
            .finish()
    }
}
