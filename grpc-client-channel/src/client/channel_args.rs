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

//! Channel arguments: an opaque key/value blob threaded through resolvers,
//! LB policies and subchannel creation.
//!
//! Keys the channel does not understand are carried along untouched.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// LB policy used when the service config does not select one.
pub const LB_POLICY_NAME: &str = "grpc.lb_policy_name";
/// Default service config JSON for the channel.
pub const SERVICE_CONFIG: &str = "grpc.service_config";
/// Whether retries are enabled (int, non-zero means enabled).
pub const ENABLE_RETRIES: &str = "grpc.enable_retries";
/// Per-RPC retry buffer size in bytes.
pub const PER_RPC_RETRY_BUFFER_SIZE: &str = "grpc.per_rpc_retry_buffer_size";
/// The target URI the channel was created with.
pub const SERVER_URI: &str = "grpc.server_uri";
/// Health check service name injected into subchannel args.
pub const HEALTH_CHECK_SERVICE_NAME: &str = "grpc.health_check_service_name";
/// Keepalive time in milliseconds used by transports.
pub const KEEPALIVE_TIME_MS: &str = "grpc.keepalive_time_ms";
/// Use a subchannel pool private to the channel instead of the shared one.
pub const USE_LOCAL_SUBCHANNEL_POOL: &str = "grpc.use_local_subchannel_pool";

/// A single channel argument value.
#[derive(Clone)]
pub enum ChannelArgValue {
    Str(String),
    Int(i64),
    /// An arbitrary shared object. Compared by identity.
    Pointer(Arc<dyn Any + Send + Sync>),
}

impl ChannelArgValue {
    fn rank(&self) -> u8 {
        match self {
            ChannelArgValue::Str(_) => 0,
            ChannelArgValue::Int(_) => 1,
            ChannelArgValue::Pointer(_) => 2,
        }
    }

    fn pointer_addr(p: &Arc<dyn Any + Send + Sync>) -> usize {
        Arc::as_ptr(p) as *const () as usize
    }
}

impl PartialEq for ChannelArgValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ChannelArgValue {}

impl PartialOrd for ChannelArgValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChannelArgValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ChannelArgValue::Str(a), ChannelArgValue::Str(b)) => a.cmp(b),
            (ChannelArgValue::Int(a), ChannelArgValue::Int(b)) => a.cmp(b),
            (ChannelArgValue::Pointer(a), ChannelArgValue::Pointer(b)) => {
                Self::pointer_addr(a).cmp(&Self::pointer_addr(b))
            }
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for ChannelArgValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            ChannelArgValue::Str(s) => s.hash(state),
            ChannelArgValue::Int(i) => i.hash(state),
            ChannelArgValue::Pointer(p) => Self::pointer_addr(p).hash(state),
        }
    }
}

impl fmt::Debug for ChannelArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelArgValue::Str(s) => write!(f, "{s:?}"),
            ChannelArgValue::Int(i) => write!(f, "{i}"),
            ChannelArgValue::Pointer(p) => write!(f, "<pointer {:#x}>", Self::pointer_addr(p)),
        }
    }
}

impl From<&str> for ChannelArgValue {
    fn from(s: &str) -> Self {
        ChannelArgValue::Str(s.to_string())
    }
}

impl From<String> for ChannelArgValue {
    fn from(s: String) -> Self {
        ChannelArgValue::Str(s)
    }
}

impl From<i64> for ChannelArgValue {
    fn from(i: i64) -> Self {
        ChannelArgValue::Int(i)
    }
}

impl From<bool> for ChannelArgValue {
    fn from(b: bool) -> Self {
        ChannelArgValue::Int(b as i64)
    }
}

/// An immutable, ordered set of channel arguments.
///
/// Setters consume and return the args so they chain naturally. Equality is
/// structural, which lets args take part in subchannel keys.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelArgs {
    args: BTreeMap<String, ChannelArgValue>,
}

impl ChannelArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key`, replacing any existing value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<ChannelArgValue>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    pub fn set_pointer(mut self, key: impl Into<String>, value: Arc<dyn Any + Send + Sync>) -> Self {
        self.args
            .insert(key.into(), ChannelArgValue::Pointer(value));
        self
    }

    /// Sets `key` only if it is not already present.
    pub fn set_if_unset(self, key: impl Into<String>, value: impl Into<ChannelArgValue>) -> Self {
        let key = key.into();
        if self.args.contains_key(&key) {
            return self;
        }
        self.set(key, value)
    }

    pub fn remove(mut self, key: &str) -> Self {
        self.args.remove(key);
        self
    }

    /// Returns the union of both sets of args. Values already present in
    /// `self` win.
    pub fn union_with(&self, other: &ChannelArgs) -> Self {
        let mut args = other.args.clone();
        for (k, v) in &self.args {
            args.insert(k.clone(), v.clone());
        }
        ChannelArgs { args }
    }

    pub fn get(&self, key: &str) -> Option<&ChannelArgValue> {
        self.args.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.args.get(key)? {
            ChannelArgValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.args.get(key)? {
            ChannelArgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Interprets an int argument as a boolean.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get_int(key).map(|i| i != 0)
    }

    pub fn get_pointer<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.args.get(key)? {
            ChannelArgValue::Pointer(p) => p.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.args.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ChannelArgValue)> {
        self.args.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Debug for ChannelArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.args.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_getters() {
        let args = ChannelArgs::new()
            .set(LB_POLICY_NAME, "round_robin")
            .set(PER_RPC_RETRY_BUFFER_SIZE, 1024i64)
            .set(ENABLE_RETRIES, false);
        assert_eq!(args.get_str(LB_POLICY_NAME), Some("round_robin"));
        assert_eq!(args.get_int(PER_RPC_RETRY_BUFFER_SIZE), Some(1024));
        assert_eq!(args.get_bool(ENABLE_RETRIES), Some(false));
        // Wrong type reads as absent.
        assert_eq!(args.get_int(LB_POLICY_NAME), None);
        assert_eq!(args.get_str("unknown"), None);
    }

    #[test]
    fn union_prefers_self() {
        let a = ChannelArgs::new().set("a", 1i64).set("shared", "mine");
        let b = ChannelArgs::new().set("b", 2i64).set("shared", "theirs");
        let u = a.union_with(&b);
        assert_eq!(u.get_int("a"), Some(1));
        assert_eq!(u.get_int("b"), Some(2));
        assert_eq!(u.get_str("shared"), Some("mine"));
    }

    #[test]
    fn pointers_compare_by_identity() {
        let p1: Arc<dyn Any + Send + Sync> = Arc::new(5u32);
        let p2: Arc<dyn Any + Send + Sync> = Arc::new(5u32);
        let a = ChannelArgs::new().set_pointer("p", p1.clone());
        assert_eq!(a, ChannelArgs::new().set_pointer("p", p1));
        assert_ne!(a, ChannelArgs::new().set_pointer("p", p2));
        assert_eq!(a.get_pointer::<u32>("p").as_deref(), Some(&5));
        assert!(a.get_pointer::<String>("p").is_none());
    }

    #[test]
    fn set_if_unset_keeps_existing() {
        let args = ChannelArgs::new()
            .set(KEEPALIVE_TIME_MS, 1000i64)
            .set_if_unset(KEEPALIVE_TIME_MS, 2000i64)
            .set_if_unset(SERVER_URI, "dns:///foo");
        assert_eq!(args.get_int(KEEPALIVE_TIME_MS), Some(1000));
        assert_eq!(args.get_str(SERVER_URI), Some("dns:///foo"));
        assert!(args.remove(SERVER_URI).get(SERVER_URI).is_none());
    }
}
