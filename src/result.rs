//! Per-query outcomes
//!
//! `ResultAggregate` is the telemetry unit produced for every executed query.
//! Bulk loads wrap it in `BulkResult` (success) or `ErrorResult` (failure).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::{GizmoError, GizmoResult};

/// Something the shell can print: a one-line message and optional details
pub trait OperationResult {
    fn message(&self) -> String;

    fn details(&self) -> String {
        String::new()
    }
}

/// Outcome of one executed query. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultAggregate {
    query: String,
    records: Vec<serde_json::Value>,
    elapsed: Duration,
    request_charge: f64,
    retry_count: u32,
    attributes: BTreeMap<String, serde_json::Value>,
}

impl ResultAggregate {
    pub fn new(
        query: impl Into<String>,
        records: Vec<serde_json::Value>,
        elapsed: Duration,
        request_charge: f64,
        retry_count: u32,
        attributes: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            query: query.into(),
            records,
            elapsed,
            request_charge,
            retry_count,
            attributes,
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn records(&self) -> &[serde_json::Value] {
        &self.records
    }

    /// Deserialize records into a caller-chosen type
    pub fn records_as<T: DeserializeOwned>(&self) -> GizmoResult<Vec<T>> {
        self.records
            .iter()
            .map(|r| serde_json::from_value(r.clone()).map_err(GizmoError::from))
            .collect()
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Back-end cost metric (request units)
    pub fn request_charge(&self) -> f64 {
        self.request_charge
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Protocol-specific status attributes
    pub fn attributes(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records rendered as indented JSON
    pub fn records_json(&self) -> String {
        serde_json::to_string_pretty(&self.records).unwrap_or_default()
    }
}

impl fmt::Display for ResultAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.4}s, RUs {:.2}, retries {}, {} results] {}",
            self.elapsed.as_secs_f64(),
            self.request_charge,
            self.retry_count,
            self.len(),
            self.query
        )
    }
}

impl OperationResult for ResultAggregate {
    fn message(&self) -> String {
        self.to_string()
    }

    fn details(&self) -> String {
        self.records_json()
    }
}

/// Plain text outcome of a shell command
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub message: String,
    pub details: String,
}

impl CommandResult {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

impl OperationResult for CommandResult {
    fn message(&self) -> String {
        self.message.clone()
    }

    fn details(&self) -> String {
        self.details.clone()
    }
}

/// Where a bulk query came from and how far the load had progressed when it finished
#[derive(Debug, Clone)]
pub struct BulkContext {
    /// Worker that executed the query
    pub worker: usize,
    pub file_name: String,
    /// 1-based line number in the source file (skip offset included)
    pub line_number: usize,
    /// Queries finished in the current file, this one included
    pub completed: usize,
    /// Queries scheduled for the current file
    pub total: usize,
    pub file_elapsed: Duration,
    pub bulk_elapsed: Duration,
}

impl BulkContext {
    /// Fraction of the current file completed, 0.0..=1.0
    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }

    pub fn queries_per_second(&self) -> f64 {
        let secs = self.file_elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.completed as f64 / secs
    }

    /// `elapsed / completed * remaining`
    pub fn remaining(&self) -> Duration {
        if self.completed == 0 {
            return Duration::ZERO;
        }
        let remaining = self.total.saturating_sub(self.completed) as u32;
        self.file_elapsed / self.completed as u32 * remaining
    }
}

/// Successful bulk query
#[derive(Debug, Clone)]
pub struct BulkResult {
    pub result: ResultAggregate,
    pub context: BulkContext,
}

impl fmt::Display for BulkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = &self.context;
        write!(
            f,
            "{:>2}:{:>6.1}% qps:{:.2} eta: {} query: {:.4}s, {:07.2} RUs, retries {}, {} results, {}/{}, {} @ {}:{}",
            ctx.worker,
            ctx.percent_complete() * 100.0,
            ctx.queries_per_second(),
            format_hms(ctx.remaining()),
            self.result.elapsed().as_secs_f64(),
            self.result.request_charge(),
            self.result.retry_count(),
            self.result.len(),
            ctx.completed,
            ctx.total,
            format_hms(ctx.file_elapsed),
            ctx.file_name,
            ctx.line_number,
        )
    }
}

impl OperationResult for BulkResult {
    fn message(&self) -> String {
        self.to_string()
    }

    fn details(&self) -> String {
        self.result.records_json()
    }
}

/// Failed query, captured instead of aborting the batch
#[derive(Debug)]
pub struct ErrorResult {
    pub query: String,
    pub error: GizmoError,
    pub context: BulkContext,
}

impl ErrorResult {
    pub fn retries(&self) -> u32 {
        self.error.retries()
    }
}

impl fmt::Display for ErrorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>2}: FAILED @ {}:{}: {} :: {}",
            self.context.worker, self.context.file_name, self.context.line_number, self.error, self.query
        )
    }
}

impl OperationResult for ErrorResult {
    fn message(&self) -> String {
        self.error.to_string()
    }

    fn details(&self) -> String {
        format!("{:?}", self.error)
    }
}

/// `hh:mm:ss`
pub fn format_hms(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn sample() -> ResultAggregate {
        ResultAggregate::new(
            "MATCH (n) RETURN n.name AS name",
            vec![serde_json::json!({"name": "Alice"}), serde_json::json!({"name": "Bob"})],
            Duration::from_millis(1500),
            12.5,
            2,
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_summary_line() {
        let line = sample().to_string();
        assert_eq!(
            line,
            "[1.5000s, RUs 12.50, retries 2, 2 results] MATCH (n) RETURN n.name AS name"
        );
    }

    #[test]
    fn test_records_as() {
        #[derive(Deserialize)]
        struct Row {
            name: String,
        }
        let rows: Vec<Row> = sample().records_as().unwrap();
        assert_eq!(rows[1].name, "Bob");
    }

    #[test]
    fn test_eta_and_throughput() {
        let ctx = BulkContext {
            worker: 1,
            file_name: "q.txt".to_string(),
            line_number: 5,
            completed: 4,
            total: 10,
            file_elapsed: Duration::from_secs(8),
            bulk_elapsed: Duration::from_secs(8),
        };
        assert_eq!(ctx.remaining(), Duration::from_secs(12));
        assert!((ctx.queries_per_second() - 0.5).abs() < f64::EPSILON);
        assert!((ctx.percent_complete() - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bulk_line_mentions_location() {
        let ctx = BulkContext {
            worker: 3,
            file_name: "load.gremlin".to_string(),
            line_number: 42,
            completed: 1,
            total: 2,
            file_elapsed: Duration::from_secs(1),
            bulk_elapsed: Duration::from_secs(1),
        };
        let line = BulkResult {
            result: sample(),
            context: ctx.clone(),
        }
        .to_string();
        assert!(line.starts_with(" 3:  50.0%"));
        assert!(line.contains("retries 2"));
        assert!(line.ends_with("@ load.gremlin:42"));

        let err = ErrorResult {
            query: "bad".to_string(),
            error: GizmoError::remote("syntax"),
            context: ctx,
        };
        assert!(err.to_string().contains("FAILED @ load.gremlin:42"));
        assert!(err.to_string().ends_with(":: bad"));
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(3725)), "01:02:05");
    }
}
