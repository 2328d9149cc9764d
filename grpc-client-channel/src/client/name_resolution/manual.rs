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

//! A resolver whose results are pushed by the application, for tests and
//! for integrations that discover addresses out of band.

use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    ChannelController, Resolver, ResolverBuilder, ResolverOptions, ResolverUpdate, Target,
    WorkScheduler,
};

#[derive(Default)]
struct Shared {
    last_update: Option<ResolverUpdate>,
    pending: bool,
    work_scheduler: Option<Arc<dyn WorkScheduler>>,
    build_count: usize,
    resolve_now_count: usize,
    last_update_result: Option<Result<(), String>>,
}

/// Builds resolvers for a custom scheme that report whatever the paired
/// [`ManualResolverHandle`] pushes.
///
/// The most recent update is replayed to every newly built resolver, so a
/// channel that goes idle and reconnects sees the same result again.
#[derive(Clone)]
pub struct ManualResolverBuilder {
    scheme: String,
    shared: Arc<Mutex<Shared>>,
}

/// Pushes results into the resolver built by a [`ManualResolverBuilder`].
#[derive(Clone)]
pub struct ManualResolverHandle {
    shared: Arc<Mutex<Shared>>,
}

impl ManualResolverBuilder {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            shared: Arc::default(),
        }
    }

    pub fn handle(&self) -> ManualResolverHandle {
        ManualResolverHandle {
            shared: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for ManualResolverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualResolverBuilder")
            .field("scheme", &self.scheme)
            .finish()
    }
}

impl ManualResolverHandle {
    /// Sends `update` to the channel.
    pub fn update(&self, update: ResolverUpdate) {
        let scheduler = {
            let mut shared = self.shared.lock();
            shared.last_update = Some(update);
            shared.pending = true;
            shared.work_scheduler.clone()
        };
        if let Some(scheduler) = scheduler {
            scheduler.schedule_work();
        }
    }

    /// Reports a resolution failure to the channel.
    pub fn report_error(&self, error: impl Into<String>) {
        self.update(ResolverUpdate::from_error(error));
    }

    /// Number of resolvers built so far.
    pub fn build_count(&self) -> usize {
        self.shared.lock().build_count
    }

    /// Number of times the channel asked for re-resolution.
    pub fn resolve_now_count(&self) -> usize {
        self.shared.lock().resolve_now_count
    }

    /// What the channel returned for the most recently delivered update.
    pub fn last_update_result(&self) -> Option<Result<(), String>> {
        self.shared.lock().last_update_result.clone()
    }
}

impl ResolverBuilder for ManualResolverBuilder {
    fn build(&self, _target: &Target, options: ResolverOptions) -> Box<dyn Resolver> {
        let mut shared = self.shared.lock();
        shared.build_count += 1;
        shared.pending = shared.last_update.is_some();
        shared.work_scheduler = Some(options.work_scheduler);
        Box::new(ManualResolver {
            shared: self.shared.clone(),
        })
    }

    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn is_valid_uri(&self, _uri: &Target) -> bool {
        true
    }
}

struct ManualResolver {
    shared: Arc<Mutex<Shared>>,
}

impl Resolver for ManualResolver {
    fn resolve_now(&mut self) {
        self.shared.lock().resolve_now_count += 1;
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        let update = {
            let mut shared = self.shared.lock();
            if !shared.pending {
                return;
            }
            shared.pending = false;
            shared.last_update.clone()
        };
        if let Some(update) = update {
            let result = channel_controller.update(update);
            self.shared.lock().last_update_result = Some(result);
        }
    }
}

impl Drop for ManualResolver {
    fn drop(&mut self) {
        self.shared.lock().work_scheduler = None;
    }
}
