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

//! Service config parsing.
//!
//! A service config is a JSON document supplied by the resolver or as the
//! channel default. It selects the LB policy, configures retry throttling
//! and health checking, and carries per-method settings such as timeouts and
//! retry policies. See https://github.com/grpc/grpc/blob/master/doc/service_config.md.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::client::load_balancing::{LbPolicyRegistry, ParsedJsonLbConfig};
use crate::status::StatusCode;

/// The highest number of attempts a retry policy may configure. Larger values
/// are clamped.
pub const MAX_RETRY_ATTEMPTS: u32 = 5;

/// An error encountered while parsing a service config.
#[derive(Debug, Error)]
pub enum ServiceConfigError {
    #[error("service config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ServiceConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ServiceConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// A convenience wrapper for an LB policy's configuration object.
#[derive(Clone)]
pub struct LbConfig {
    config: Arc<dyn Any + Send + Sync>,
}

impl LbConfig {
    /// Create a new LbConfig wrapper containing the provided config.
    pub fn new(config: impl Any + Send + Sync) -> Self {
        LbConfig {
            config: Arc::new(config),
        }
    }

    /// Convenience method to extract the LB policy's configuration object.
    pub fn convert_to<T: 'static + Send + Sync>(&self) -> Option<Arc<T>> {
        self.config.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for LbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LbConfig")
    }
}

/// The LB policy selected by a `loadBalancingConfig` entry.
#[derive(Debug, Clone)]
pub struct LbPolicySelection {
    pub name: String,
    pub config: Option<LbConfig>,
}

/// The retry policy for a method, per gRFC A6.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: HashSet<StatusCode>,
}

impl RetryPolicy {
    pub fn is_retryable(&self, code: StatusCode) -> bool {
        self.retryable_status_codes.contains(&code)
    }
}

/// Per-method settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodConfig {
    pub timeout: Option<Duration>,
    pub wait_for_ready: Option<bool>,
    pub retry_policy: Option<RetryPolicy>,
}

/// Retry throttling parameters, stored in thousandths of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryThrottleConfig {
    pub max_milli_tokens: u64,
    pub milli_token_ratio: u64,
}

/// An immutable, parsed service config.
#[derive(Debug, Default)]
pub struct ServiceConfig {
    json_string: String,
    lb_policy: Option<LbPolicySelection>,
    deprecated_lb_policy_name: Option<String>,
    retry_throttling: Option<RetryThrottleConfig>,
    health_check_service_name: Option<String>,
    method_configs: HashMap<String, Arc<MethodConfig>>,
    default_method_config: Option<Arc<MethodConfig>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    load_balancing_config: Option<Vec<serde_json::Map<String, Value>>>,
    load_balancing_policy: Option<String>,
    #[serde(default)]
    method_config: Vec<RawMethodConfig>,
    retry_throttling: Option<RawRetryThrottling>,
    health_check_config: Option<RawHealthCheckConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMethodConfig {
    #[serde(default)]
    name: Vec<RawMethodName>,
    wait_for_ready: Option<bool>,
    timeout: Option<String>,
    retry_policy: Option<RawRetryPolicy>,
}

#[derive(Deserialize)]
struct RawMethodName {
    service: Option<String>,
    method: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryPolicy {
    max_attempts: Option<u32>,
    initial_backoff: Option<String>,
    max_backoff: Option<String>,
    backoff_multiplier: Option<f64>,
    retryable_status_codes: Option<Vec<Value>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRetryThrottling {
    max_tokens: Option<f64>,
    token_ratio: Option<f64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHealthCheckConfig {
    service_name: Option<String>,
}

impl ServiceConfig {
    /// Parses a JSON service config. LB policy configs are validated by the
    /// builders registered in `lb_registry`.
    pub fn parse(json: &str, lb_registry: &LbPolicyRegistry) -> Result<Self, ServiceConfigError> {
        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(ServiceConfigError::invalid(
                "serviceConfig",
                "must be a JSON object",
            ));
        }
        // Map keys are sorted, so this is a canonical form that ignores
        // formatting differences.
        let json_string = value.to_string();
        let raw: RawServiceConfig = serde_json::from_value(value)?;

        let lb_policy = match raw.load_balancing_config {
            Some(list) => Some(parse_lb_config_list(list, lb_registry)?),
            None => None,
        };
        let deprecated_lb_policy_name = match raw.load_balancing_policy {
            Some(name) => {
                let name = name.to_ascii_lowercase();
                if lb_registry.get_policy(&name).is_none() {
                    return Err(ServiceConfigError::invalid(
                        "loadBalancingPolicy",
                        format!("unknown LB policy {name:?}"),
                    ));
                }
                Some(name)
            }
            None => None,
        };
        let retry_throttling = raw
            .retry_throttling
            .map(parse_retry_throttling)
            .transpose()?;
        let health_check_service_name = raw.health_check_config.and_then(|h| h.service_name);

        let mut method_configs = HashMap::new();
        let mut default_method_config = None;
        for raw_method in raw.method_config {
            let config = Arc::new(MethodConfig {
                timeout: raw_method
                    .timeout
                    .as_deref()
                    .map(parse_duration)
                    .transpose()
                    .map_err(|e| ServiceConfigError::invalid("methodConfig.timeout", e))?,
                wait_for_ready: raw_method.wait_for_ready,
                retry_policy: raw_method.retry_policy.map(parse_retry_policy).transpose()?,
            });
            for name in raw_method.name {
                match method_key(name)? {
                    None => {
                        if default_method_config.is_some() {
                            return Err(ServiceConfigError::invalid(
                                "methodConfig.name",
                                "multiple default method configs",
                            ));
                        }
                        default_method_config = Some(config.clone());
                    }
                    Some(key) => {
                        if method_configs.insert(key.clone(), config.clone()).is_some() {
                            return Err(ServiceConfigError::invalid(
                                "methodConfig.name",
                                format!("duplicate entry for {key}"),
                            ));
                        }
                    }
                }
            }
        }

        Ok(ServiceConfig {
            json_string,
            lb_policy,
            deprecated_lb_policy_name,
            retry_throttling,
            health_check_service_name,
            method_configs,
            default_method_config,
        })
    }

    /// Canonical JSON text of the config, used to detect changes.
    pub fn json_string(&self) -> &str {
        &self.json_string
    }

    /// The policy chosen by `loadBalancingConfig`, if present.
    pub fn lb_policy(&self) -> Option<&LbPolicySelection> {
        self.lb_policy.as_ref()
    }

    /// The lowercased `loadBalancingPolicy` field, if present.
    pub fn deprecated_lb_policy_name(&self) -> Option<&str> {
        self.deprecated_lb_policy_name.as_deref()
    }

    pub fn retry_throttling(&self) -> Option<RetryThrottleConfig> {
        self.retry_throttling
    }

    pub fn health_check_service_name(&self) -> Option<&str> {
        self.health_check_service_name.as_deref()
    }

    /// Finds the config for a method path of the form `/service/method`,
    /// falling back to the service-wide entry and then the default entry.
    pub fn method_config(&self, path: &str) -> Option<Arc<MethodConfig>> {
        if let Some(config) = self.method_configs.get(path) {
            return Some(config.clone());
        }
        if let Some(idx) = path.rfind('/') {
            if let Some(config) = self.method_configs.get(&path[..=idx]) {
                return Some(config.clone());
            }
        }
        self.default_method_config.clone()
    }
}

fn method_key(name: RawMethodName) -> Result<Option<String>, ServiceConfigError> {
    let service = name.service.unwrap_or_default();
    let method = name.method.unwrap_or_default();
    if service.is_empty() {
        if !method.is_empty() {
            return Err(ServiceConfigError::invalid(
                "methodConfig.name",
                "method name populated without service name",
            ));
        }
        return Ok(None);
    }
    Ok(Some(format!("/{service}/{method}")))
}

fn parse_lb_config_list(
    list: Vec<serde_json::Map<String, Value>>,
    lb_registry: &LbPolicyRegistry,
) -> Result<LbPolicySelection, ServiceConfigError> {
    for entry in list {
        if entry.len() != 1 {
            return Err(ServiceConfigError::invalid(
                "loadBalancingConfig",
                "each entry must have exactly one key",
            ));
        }
        let Some((name, config)) = entry.into_iter().next() else {
            continue;
        };
        let Some(builder) = lb_registry.get_policy(&name) else {
            continue;
        };
        let config = builder
            .parse_config(&ParsedJsonLbConfig::new(config))
            .map_err(|e| {
                ServiceConfigError::invalid("loadBalancingConfig", format!("{name}: {e}"))
            })?;
        return Ok(LbPolicySelection { name, config });
    }
    Err(ServiceConfigError::invalid(
        "loadBalancingConfig",
        "no supported policy found",
    ))
}

fn parse_retry_policy(raw: RawRetryPolicy) -> Result<RetryPolicy, ServiceConfigError> {
    const FIELD: &str = "retryPolicy";
    let max_attempts = raw
        .max_attempts
        .ok_or_else(|| ServiceConfigError::invalid(FIELD, "maxAttempts is required"))?;
    if max_attempts < 2 {
        return Err(ServiceConfigError::invalid(
            FIELD,
            "maxAttempts must be at least 2",
        ));
    }
    let backoff = |s: Option<String>, name: &str| -> Result<Duration, ServiceConfigError> {
        let s = s.ok_or_else(|| ServiceConfigError::invalid(FIELD, format!("{name} is required")))?;
        let d = parse_duration(&s)
            .map_err(|e| ServiceConfigError::invalid(FIELD, format!("{name}: {e}")))?;
        if d.is_zero() {
            return Err(ServiceConfigError::invalid(
                FIELD,
                format!("{name} must be greater than 0"),
            ));
        }
        Ok(d)
    };
    let initial_backoff = backoff(raw.initial_backoff, "initialBackoff")?;
    let max_backoff = backoff(raw.max_backoff, "maxBackoff")?;
    let backoff_multiplier = raw
        .backoff_multiplier
        .ok_or_else(|| ServiceConfigError::invalid(FIELD, "backoffMultiplier is required"))?;
    if backoff_multiplier <= 0.0 {
        return Err(ServiceConfigError::invalid(
            FIELD,
            "backoffMultiplier must be greater than 0",
        ));
    }
    let mut retryable_status_codes = HashSet::new();
    for code in raw.retryable_status_codes.unwrap_or_default() {
        retryable_status_codes.insert(parse_status_code(&code)?);
    }
    if retryable_status_codes.is_empty() {
        return Err(ServiceConfigError::invalid(
            FIELD,
            "retryableStatusCodes must be non-empty",
        ));
    }
    Ok(RetryPolicy {
        max_attempts: max_attempts.min(MAX_RETRY_ATTEMPTS),
        initial_backoff,
        max_backoff,
        backoff_multiplier,
        retryable_status_codes,
    })
}

fn parse_status_code(value: &Value) -> Result<StatusCode, ServiceConfigError> {
    const FIELD: &str = "retryPolicy.retryableStatusCodes";
    match value {
        Value::String(name) => name
            .parse()
            .map_err(|e: String| ServiceConfigError::invalid(FIELD, e)),
        Value::Number(n) => match n.as_i64() {
            Some(i @ 0..=16) => Ok(StatusCode::from(i as i32)),
            _ => Err(ServiceConfigError::invalid(
                FIELD,
                format!("invalid status code {n}"),
            )),
        },
        other => Err(ServiceConfigError::invalid(
            FIELD,
            format!("unexpected value {other}"),
        )),
    }
}

fn parse_retry_throttling(
    raw: RawRetryThrottling,
) -> Result<RetryThrottleConfig, ServiceConfigError> {
    const FIELD: &str = "retryThrottling";
    let max_tokens = raw
        .max_tokens
        .ok_or_else(|| ServiceConfigError::invalid(FIELD, "maxTokens is required"))?;
    if max_tokens <= 0.0 || max_tokens > 1000.0 {
        return Err(ServiceConfigError::invalid(
            FIELD,
            "maxTokens must be in the range (0, 1000]",
        ));
    }
    let token_ratio = raw
        .token_ratio
        .ok_or_else(|| ServiceConfigError::invalid(FIELD, "tokenRatio is required"))?;
    if token_ratio <= 0.0 {
        return Err(ServiceConfigError::invalid(
            FIELD,
            "tokenRatio must be greater than 0",
        ));
    }
    // Only three decimal places are significant.
    Ok(RetryThrottleConfig {
        max_milli_tokens: (max_tokens * 1000.0 + 1e-6).floor() as u64,
        milli_token_ratio: (token_ratio * 1000.0 + 1e-6).floor() as u64,
    })
}

/// Parses a protobuf JSON duration such as `"1.5s"`.
pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
    let digits = s
        .strip_suffix('s')
        .ok_or_else(|| format!("duration {s:?} must end with 's'"))?;
    let (secs, frac) = match digits.split_once('.') {
        Some((secs, frac)) => (secs, frac),
        None => (digits, ""),
    };
    if secs.is_empty() || frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("invalid duration {s:?}"));
    }
    let secs: u64 = secs.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    let nanos = if frac.is_empty() {
        0
    } else {
        let padded = format!("{frac:0<9}");
        padded
            .parse::<u32>()
            .map_err(|_| format!("invalid duration {s:?}"))?
    };
    Ok(Duration::new(secs, nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LbPolicyRegistry {
        LbPolicyRegistry::with_builtin_policies()
    }

    #[test]
    fn parse_durations() {
        assert_eq!(parse_duration("1s"), Ok(Duration::from_secs(1)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("0.000000001s"), Ok(Duration::from_nanos(1)));
        assert!(parse_duration("1").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration(".5s").is_err());
        assert!(parse_duration("1.1234567891s").is_err());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "loadBalancingConfig": [{"unknown_policy": {}}, {"round_robin": {}}],
            "retryThrottling": {"maxTokens": 10, "tokenRatio": 0.1},
            "healthCheckConfig": {"serviceName": "health"},
            "methodConfig": [{
                "name": [{"service": "pkg.Echo", "method": "Unary"}],
                "timeout": "2.5s",
                "waitForReady": true,
                "retryPolicy": {
                    "maxAttempts": 10,
                    "initialBackoff": "0.1s",
                    "maxBackoff": "1s",
                    "backoffMultiplier": 2,
                    "retryableStatusCodes": ["UNAVAILABLE", 8]
                }
            }, {
                "name": [{"service": "pkg.Echo"}],
                "timeout": "10s"
            }, {
                "name": [{}],
                "waitForReady": false
            }]
        }"#;
        let sc = ServiceConfig::parse(json, &registry()).unwrap();
        assert_eq!(sc.lb_policy().unwrap().name, "round_robin");
        assert_eq!(
            sc.retry_throttling(),
            Some(RetryThrottleConfig {
                max_milli_tokens: 10_000,
                milli_token_ratio: 100,
            })
        );
        assert_eq!(sc.health_check_service_name(), Some("health"));

        let unary = sc.method_config("/pkg.Echo/Unary").unwrap();
        assert_eq!(unary.timeout, Some(Duration::from_millis(2500)));
        assert_eq!(unary.wait_for_ready, Some(true));
        let retry = unary.retry_policy.as_ref().unwrap();
        assert_eq!(retry.max_attempts, MAX_RETRY_ATTEMPTS);
        assert!(retry.is_retryable(StatusCode::Unavailable));
        assert!(retry.is_retryable(StatusCode::ResourceExhausted));
        assert!(!retry.is_retryable(StatusCode::InvalidArgument));

        let stream = sc.method_config("/pkg.Echo/Stream").unwrap();
        assert_eq!(stream.timeout, Some(Duration::from_secs(10)));
        assert!(stream.retry_policy.is_none());

        let other = sc.method_config("/pkg.Other/Call").unwrap();
        assert_eq!(other.wait_for_ready, Some(false));
    }

    #[test]
    fn canonical_json_ignores_formatting() {
        let a = ServiceConfig::parse(r#"{"loadBalancingPolicy":"round_robin","methodConfig":[]}"#, &registry()).unwrap();
        let b = ServiceConfig::parse(
            "{ \"methodConfig\": [],\n  \"loadBalancingPolicy\": \"round_robin\" }",
            &registry(),
        )
        .unwrap();
        assert_eq!(a.json_string(), b.json_string());
    }

    #[test]
    fn deprecated_policy_name_is_lowercased() {
        let sc = ServiceConfig::parse(r#"{"loadBalancingPolicy": "ROUND_ROBIN"}"#, &registry())
            .unwrap();
        assert_eq!(sc.deprecated_lb_policy_name(), Some("round_robin"));
        assert!(sc.lb_policy().is_none());

        let err = ServiceConfig::parse(r#"{"loadBalancingPolicy": "nope"}"#, &registry());
        assert!(err.is_err());
    }

    #[test]
    fn rejects_invalid_configs() {
        let cases = [
            "[]",
            "not json",
            r#"{"loadBalancingConfig": [{"a": {}, "b": {}}]}"#,
            r#"{"loadBalancingConfig": [{"unknown": {}}]}"#,
            r#"{"retryThrottling": {"maxTokens": 0, "tokenRatio": 1}}"#,
            r#"{"retryThrottling": {"maxTokens": 1001, "tokenRatio": 1}}"#,
            r#"{"retryThrottling": {"maxTokens": 10}}"#,
            r#"{"methodConfig": [{"name": [{"method": "m"}]}]}"#,
            r#"{"methodConfig": [{"name": [{}]}, {"name": [{}]}]}"#,
            r#"{"methodConfig": [{"name": [{"service": "s"}]}, {"name": [{"service": "s"}]}]}"#,
            r#"{"methodConfig": [{"name": [{}], "timeout": "5"}]}"#,
        ];
        for json in cases {
            assert!(
                ServiceConfig::parse(json, &registry()).is_err(),
                "expected {json} to be rejected"
            );
        }
    }

    #[test]
    fn rejects_invalid_retry_policies() {
        let policy = |body: &str| {
            format!(r#"{{"methodConfig": [{{"name": [{{}}], "retryPolicy": {body}}}]}}"#)
        };
        let cases = [
            r#"{"maxAttempts": 1, "initialBackoff": "1s", "maxBackoff": "1s", "backoffMultiplier": 1, "retryableStatusCodes": ["UNAVAILABLE"]}"#,
            r#"{"maxAttempts": 2, "initialBackoff": "0s", "maxBackoff": "1s", "backoffMultiplier": 1, "retryableStatusCodes": ["UNAVAILABLE"]}"#,
            r#"{"maxAttempts": 2, "initialBackoff": "1s", "maxBackoff": "1s", "backoffMultiplier": 0, "retryableStatusCodes": ["UNAVAILABLE"]}"#,
            r#"{"maxAttempts": 2, "initialBackoff": "1s", "maxBackoff": "1s", "backoffMultiplier": 1, "retryableStatusCodes": []}"#,
            r#"{"maxAttempts": 2, "initialBackoff": "1s", "maxBackoff": "1s", "backoffMultiplier": 1, "retryableStatusCodes": ["NOT_A_CODE"]}"#,
            r#"{"initialBackoff": "1s", "maxBackoff": "1s", "backoffMultiplier": 1, "retryableStatusCodes": ["UNAVAILABLE"]}"#,
        ];
        for body in cases {
            let json = policy(body);
            assert!(
                ServiceConfig::parse(&json, &registry()).is_err(),
                "expected {json} to be rejected"
            );
        }
    }

    #[test]
    fn empty_config_has_no_method_configs() {
        let sc = ServiceConfig::parse("{}", &registry()).unwrap();
        assert!(sc.method_config("/a/b").is_none());
        assert!(sc.lb_policy().is_none());
        assert_eq!(sc.json_string(), "{}");
    }
}
