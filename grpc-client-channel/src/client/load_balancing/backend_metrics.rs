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

//! Backend metrics reported by servers in call trailers.

use std::collections::HashMap;

use tonic::metadata::MetadataMap;

/// The trailer carrying per-call load reports.
pub(crate) const ENDPOINT_LOAD_METRICS_KEY: &str = "endpoint-load-metrics";

const TEXT_PREFIX: &str = "TEXT ";

/// Load metrics a server attached to a call, in the text encoding:
/// `TEXT cpu_utilization=0.5, mem_utilization=0.2, request_cost.db=12`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackendMetricData {
    pub cpu_utilization: f64,
    pub mem_utilization: f64,
    pub qps: f64,
    pub eps: f64,
    pub request_cost: HashMap<String, f64>,
    pub utilization: HashMap<String, f64>,
}

impl BackendMetricData {
    /// Parses the load report from call trailers.  Returns None if the
    /// trailer is absent or not in the text encoding.
    pub fn from_metadata(metadata: &MetadataMap) -> Option<Self> {
        let value = metadata.get(ENDPOINT_LOAD_METRICS_KEY)?.to_str().ok()?;
        Self::parse(value)
    }

    pub fn parse(value: &str) -> Option<Self> {
        let body = value.trim().strip_prefix(TEXT_PREFIX)?;
        let mut data = BackendMetricData::default();
        for pair in body.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, raw)) = pair.split_once('=') else {
                continue;
            };
            let Ok(v) = raw.trim().parse::<f64>() else {
                continue;
            };
            match key.trim() {
                "cpu_utilization" => data.cpu_utilization = v,
                "mem_utilization" => data.mem_utilization = v,
                "rps_fractional" => data.qps = v,
                "eps" => data.eps = v,
                key => {
                    if let Some(name) = key.strip_prefix("request_cost.") {
                        data.request_cost.insert(name.to_string(), v);
                    } else if let Some(name) = key.strip_prefix("utilization.") {
                        data.utilization.insert(name.to_string(), v);
                    }
                }
            }
        }
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_report() {
        let data = BackendMetricData::parse(
            "TEXT cpu_utilization=0.5, mem_utilization=0.25, rps_fractional=10, \
             request_cost.db=3, utilization.gpu=0.75, bogus=1, broken",
        )
        .unwrap();
        assert_eq!(data.cpu_utilization, 0.5);
        assert_eq!(data.mem_utilization, 0.25);
        assert_eq!(data.qps, 10.0);
        assert_eq!(data.request_cost.get("db"), Some(&3.0));
        assert_eq!(data.utilization.get("gpu"), Some(&0.75));
    }

    #[test]
    fn ignores_other_encodings() {
        assert!(BackendMetricData::parse("BIN abcd").is_none());
        assert!(BackendMetricData::from_metadata(&MetadataMap::new()).is_none());
    }

    #[test]
    fn reads_trailer() {
        let mut md = MetadataMap::new();
        md.insert(ENDPOINT_LOAD_METRICS_KEY, "TEXT eps=2".parse().unwrap());
        let data = BackendMetricData::from_metadata(&md).unwrap();
        assert_eq!(data.eps, 2.0);
    }
}
