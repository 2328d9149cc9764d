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

use std::fmt::Debug;
use std::sync::Arc;

use tonic::metadata::MetadataMap;

use crate::client::service_config::{MethodConfig, ServiceConfig};
use crate::status::Status;

/// The per-call inputs available when selecting a call's config.
#[derive(Debug)]
pub struct CallConfigArgs<'a> {
    pub path: &'a str,
    pub initial_metadata: &'a MetadataMap,
}

/// The effective configuration of one call.
pub struct CallConfig {
    pub service_config: Arc<ServiceConfig>,
    pub method_config: Option<Arc<MethodConfig>>,
    /// Runs once, when the call receives response headers or ends.
    pub on_call_committed: Option<Box<dyn FnOnce() + Send>>,
}

impl Debug for CallConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallConfig")
            .field("method_config", &self.method_config)
            .field("on_call_committed", &self.on_call_committed.is_some())
            .finish()
    }
}

/// Maps an outbound call to its configuration.
///
/// Resolvers may supply their own selector alongside a resolution result;
/// otherwise the channel uses a [`DefaultConfigSelector`] over the current
/// service config.
pub trait ConfigSelector: Send + Sync + Debug {
    /// A name identifying the selector implementation.
    fn name(&self) -> &'static str;

    /// Reports whether `other` would select the same configs as `self`.  Only
    /// called when both selectors have the same name.
    fn equals(&self, other: &dyn ConfigSelector) -> bool;

    fn call_config(&self, args: CallConfigArgs<'_>) -> Result<CallConfig, Status>;
}

/// Compares two optional selectors the way the channel does when deciding
/// whether a resolver update changed the call-visible configuration.
pub(crate) fn selectors_equal(
    a: Option<&Arc<dyn ConfigSelector>>,
    b: Option<&Arc<dyn ConfigSelector>>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.name() == b.name() && a.equals(b.as_ref()),
        _ => false,
    }
}

/// Selects method configs from a service config by method path.
#[derive(Debug)]
pub struct DefaultConfigSelector {
    service_config: Arc<ServiceConfig>,
}

impl DefaultConfigSelector {
    pub fn new(service_config: Arc<ServiceConfig>) -> Self {
        Self { service_config }
    }
}

impl ConfigSelector for DefaultConfigSelector {
    fn name(&self) -> &'static str {
        "default"
    }

    fn equals(&self, _other: &dyn ConfigSelector) -> bool {
        // The service configs themselves are compared separately.
        true
    }

    fn call_config(&self, args: CallConfigArgs<'_>) -> Result<CallConfig, Status> {
        Ok(CallConfig {
            service_config: self.service_config.clone(),
            method_config: self.service_config.method_config(args.path),
            on_call_committed: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::load_balancing::LbPolicyRegistry;

    #[test]
    fn default_selector_uses_method_config() {
        let sc = Arc::new(
            ServiceConfig::parse(
                r#"{"methodConfig": [{"name": [{"service": "svc"}], "timeout": "3s"}]}"#,
                &LbPolicyRegistry::with_builtin_policies(),
            )
            .unwrap(),
        );
        let selector = DefaultConfigSelector::new(sc);
        let md = MetadataMap::new();
        let config = selector
            .call_config(CallConfigArgs {
                path: "/svc/Method",
                initial_metadata: &md,
            })
            .unwrap();
        assert_eq!(
            config.method_config.unwrap().timeout,
            Some(std::time::Duration::from_secs(3))
        );
        let config = selector
            .call_config(CallConfigArgs {
                path: "/other/Method",
                initial_metadata: &md,
            })
            .unwrap();
        assert!(config.method_config.is_none());
    }

    #[test]
    fn selector_equality() {
        let sc = Arc::new(ServiceConfig::default());
        let a: Arc<dyn ConfigSelector> = Arc::new(DefaultConfigSelector::new(sc.clone()));
        let b: Arc<dyn ConfigSelector> = Arc::new(DefaultConfigSelector::new(sc));
        assert!(selectors_equal(None, None));
        assert!(selectors_equal(Some(&a), Some(&b)));
        assert!(!selectors_equal(Some(&a), None));
    }
}
