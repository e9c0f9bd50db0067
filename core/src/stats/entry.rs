//! Per-endpoint counters and error buckets

use std::collections::HashMap;

use serde_json::{json, Value};

/// Histogram bucket for a response time: two significant digits.
///
/// Values below 100 keep their exact value; larger values are rounded to
/// the nearest multiple of `10^(digits - 2)`, so 147 buckets at 150 and
/// 3432 at 3400.
pub fn round_to_significant(value: u64) -> u64 {
    if value < 100 {
        return value;
    }
    let digits = value.ilog10() + 1;
    let scale = 10u64.pow(digits - 2);
    (value + scale / 2) / scale * scale
}

/// Rolling and cumulative counters for one `(name, method)` pair,
/// or for the worker-wide "Total" entry.
#[derive(Debug, Clone)]
pub struct StatsEntry {
    /// Request name, e.g. a URL path
    pub name: String,
    /// Request method, e.g. an HTTP verb
    pub method: String,
    /// Requests observed since the last reset (failures included)
    pub num_requests: u64,
    /// Failures observed since the last reset
    pub num_failures: u64,
    /// Sum of response times, milliseconds
    pub total_response_time: u64,
    /// Smallest observed response time; `None` until the first request
    pub min_response_time: Option<u64>,
    /// Largest observed response time
    pub max_response_time: u64,
    /// Sum of response body sizes, bytes
    pub total_content_length: u64,
    /// Unix second this entry started counting
    pub start_time: i64,
    /// Unix second of the most recent request
    pub last_request_timestamp: i64,
    /// Response-time histogram keyed by [`round_to_significant`] bucket
    pub response_times: HashMap<u64, u64>,
    /// Requests per unix second
    pub num_reqs_per_sec: HashMap<i64, u64>,
    /// Failures per unix second
    pub num_fail_per_sec: HashMap<i64, u64>,
}

impl StatsEntry {
    /// Create a fresh entry
    pub fn new(name: impl Into<String>, method: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            name: name.into(),
            method: method.into(),
            num_requests: 0,
            num_failures: 0,
            total_response_time: 0,
            min_response_time: None,
            max_response_time: 0,
            total_content_length: 0,
            start_time: now,
            last_request_timestamp: now,
            response_times: HashMap::new(),
            num_reqs_per_sec: HashMap::new(),
            num_fail_per_sec: HashMap::new(),
        }
    }

    /// The worker-wide aggregate entry
    pub fn total() -> Self {
        Self::new("Total", "")
    }

    /// Record one request outcome
    pub fn log(&mut self, response_time: u64, content_length: u64) {
        let now = chrono::Utc::now().timestamp();
        self.num_requests += 1;
        self.total_response_time += response_time;
        self.total_content_length += content_length;
        self.last_request_timestamp = now;

        self.min_response_time = Some(match self.min_response_time {
            Some(min) => min.min(response_time),
            None => response_time,
        });
        self.max_response_time = self.max_response_time.max(response_time);

        *self
            .response_times
            .entry(round_to_significant(response_time))
            .or_insert(0) += 1;
        *self.num_reqs_per_sec.entry(now).or_insert(0) += 1;
    }

    /// Record one failure
    ///
    /// The response time of a failed request is fed through [`log`]
    /// separately, so failures also count into `num_requests`.
    ///
    /// [`log`]: StatsEntry::log
    pub fn log_error(&mut self) {
        self.num_failures += 1;
        *self
            .num_fail_per_sec
            .entry(chrono::Utc::now().timestamp())
            .or_insert(0) += 1;
    }

    /// Whether this entry has anything to report
    pub fn is_empty(&self) -> bool {
        self.num_requests == 0 && self.num_failures == 0
    }

    /// The stripped wire form sent to the master
    pub fn report(&self) -> Value {
        json!({
            "name": self.name,
            "method": self.method,
            "last_request_timestamp": self.last_request_timestamp,
            "start_time": self.start_time,
            "num_requests": self.num_requests,
            "num_none_requests": 0,
            "num_failures": self.num_failures,
            "total_response_time": self.total_response_time,
            "max_response_time": self.max_response_time,
            "min_response_time": self.min_response_time.unwrap_or(0),
            "total_content_length": self.total_content_length,
            "response_times": bucket_map(&self.response_times),
            "num_reqs_per_sec": second_map(&self.num_reqs_per_sec),
            "num_fail_per_sec": second_map(&self.num_fail_per_sec),
        })
    }
}

fn bucket_map(map: &HashMap<u64, u64>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect(),
    )
}

fn second_map(map: &HashMap<i64, u64>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect(),
    )
}

/// One distinct error, keyed by [`fingerprint`]
#[derive(Debug, Clone)]
pub struct StatsError {
    /// Request name the error was observed on
    pub name: String,
    /// Request method the error was observed on
    pub method: String,
    /// Stringified error
    pub error: String,
    /// How many times this exact error occurred
    pub occurrences: u64,
}

impl StatsError {
    /// Create a bucket with zero occurrences
    pub fn new(name: impl Into<String>, method: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.into(),
            error: error.into(),
            occurrences: 0,
        }
    }

    /// Count one occurrence
    pub fn occurred(&mut self) {
        self.occurrences += 1;
    }

    /// The wire form sent to the master
    pub fn report(&self) -> Value {
        json!({
            "name": self.name,
            "method": self.method,
            "error": self.error,
            "occurrences": self.occurrences,
        })
    }
}

/// Identity of a distinct error: `md5(method + name + error)`, hex encoded
pub fn fingerprint(method: &str, name: &str, error: &str) -> String {
    format!("{:x}", md5::compute(format!("{method}{name}{error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_to_significant_small_values_exact() {
        assert_eq!(round_to_significant(0), 0);
        assert_eq!(round_to_significant(7), 7);
        assert_eq!(round_to_significant(99), 99);
    }

    #[test]
    fn test_round_to_significant_two_digits_kept() {
        assert_eq!(round_to_significant(100), 100);
        assert_eq!(round_to_significant(147), 150);
        assert_eq!(round_to_significant(154), 150);
        assert_eq!(round_to_significant(155), 160);
        assert_eq!(round_to_significant(3432), 3400);
        assert_eq!(round_to_significant(58760), 59000);
    }

    #[test]
    fn test_log_updates_counters() {
        let mut entry = StatsEntry::new("/users", "GET");
        entry.log(30, 512);
        entry.log(10, 256);
        entry.log(70, 0);

        assert_eq!(entry.num_requests, 3);
        assert_eq!(entry.total_response_time, 110);
        assert_eq!(entry.total_content_length, 768);
        assert_eq!(entry.min_response_time, Some(10));
        assert_eq!(entry.max_response_time, 70);
        assert_eq!(entry.response_times.len(), 3);
    }

    #[test]
    fn test_min_max_bracket_every_sample() {
        let mut entry = StatsEntry::new("/users", "GET");
        for rt in [250, 40, 900, 40, 120] {
            entry.log(rt, 0);
            assert!(entry.min_response_time.unwrap() <= rt);
            assert!(entry.max_response_time >= rt);
        }
    }

    #[test]
    fn test_per_second_counts_bounded_by_requests() {
        let mut entry = StatsEntry::new("/users", "GET");
        for _ in 0..50 {
            entry.log(5, 0);
        }
        for count in entry.num_reqs_per_sec.values() {
            assert!(*count <= entry.num_requests);
        }
    }

    #[test]
    fn test_log_error_does_not_touch_requests() {
        let mut entry = StatsEntry::new("/users", "GET");
        entry.log_error();
        entry.log_error();

        assert_eq!(entry.num_failures, 2);
        assert_eq!(entry.num_requests, 0);
        assert!(!entry.is_empty());
    }

    #[test]
    fn test_report_uses_wire_names() {
        let mut entry = StatsEntry::new("/users", "GET");
        entry.log(42, 100);
        let report = entry.report();

        assert_eq!(report["name"], "/users");
        assert_eq!(report["method"], "GET");
        assert_eq!(report["num_requests"], 1);
        assert_eq!(report["min_response_time"], 42);
        assert_eq!(report["response_times"]["42"], 1);
        assert_eq!(report["num_none_requests"], 0);
    }

    #[test]
    fn test_unset_min_serializes_as_zero() {
        let entry = StatsEntry::new("/users", "GET");
        assert_eq!(entry.report()["min_response_time"], 0);
    }

    #[test]
    fn test_fingerprint_distinguishes_errors() {
        let a = fingerprint("GET", "/users", "connection refused");
        let b = fingerprint("GET", "/users", "timeout");
        let c = fingerprint("POST", "/users", "connection refused");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, fingerprint("GET", "/users", "connection refused"));
    }

    #[test]
    fn test_stats_error_counts_occurrences() {
        let mut error = StatsError::new("/users", "GET", "boom");
        error.occurred();
        error.occurred();
        assert_eq!(error.occurrences, 2);
        assert_eq!(error.report()["occurrences"], 2);
    }
}
