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

//! A resolver that uses the target's path as the single address.

use super::{
    Address, ChannelController, Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate,
    Target,
};

/// Builds resolvers for `passthrough:///host:port` targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolverBuilder;

impl ResolverBuilder for PassthroughResolverBuilder {
    fn build(&self, target: &Target, _options: ResolverOptions) -> Box<dyn Resolver> {
        Box::new(PassthroughResolver {
            address: Address::tcp(target.server_name().to_string()),
            sent: false,
        })
    }

    fn scheme(&self) -> &str {
        "passthrough"
    }

    fn is_valid_uri(&self, uri: &Target) -> bool {
        !uri.server_name().is_empty()
    }
}

struct PassthroughResolver {
    address: Address,
    sent: bool,
}

impl Resolver for PassthroughResolver {
    // The address never changes.
    fn resolve_now(&mut self) {}

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.sent {
            return;
        }
        self.sent = true;
        let _ = channel_controller.update(ResolverUpdate::from_addresses([self.address.clone()]));
    }
}
