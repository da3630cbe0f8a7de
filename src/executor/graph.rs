//! GraphExecutor: dedicated graph protocol server
//!
//! Speaks RESP over TCP. Session parameters (user, credential, partition key)
//! are fixed at construction. Idle sessions are pooled so concurrent callers
//! each get their own socket; a session that hits a transport fault is dropped.

use async_trait::async_trait;
use bytes::BytesMut;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ConnectionProfile;
use crate::error::{GizmoError, GizmoResult};
use crate::executor::{probe_outcome, ExecutorKind, QueryExecutor};
use crate::protocol::{FrameScanner, RespValue};
use crate::result::ResultAggregate;
use crate::retry::RetryPolicy;

/// One authenticated TCP session
struct RespSession {
    stream: TcpStream,
    buffer: BytesMut,
    scanner: FrameScanner,
}

impl RespSession {
    async fn open(address: &str, user: &str, password: &str) -> GizmoResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| GizmoError::Transient(format!("Failed to connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;

        let mut session = Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            scanner: FrameScanner::default(),
        };

        if !password.is_empty() {
            match session.request(&RespValue::command(&["AUTH", user, password])).await? {
                RespValue::SimpleString(ok) if ok.eq_ignore_ascii_case("OK") => {}
                RespValue::Error(msg) => return Err(reply_error(&msg)),
                other => {
                    return Err(GizmoError::Protocol(format!("Unexpected AUTH reply: {:?}", other)));
                }
            }
        }

        debug!("Opened graph session to {}", address);
        Ok(session)
    }

    async fn request(&mut self, command: &RespValue) -> GizmoResult<RespValue> {
        let mut out = Vec::new();
        command.encode(&mut out)?;
        self.stream.write_all(&out).await?;

        loop {
            if let Some(len) = self.scanner.scan(&self.buffer)? {
                let frame = self.buffer.split_to(len);
                return match RespValue::parse(&frame)? {
                    Some((value, _)) => Ok(value),
                    None => Err(GizmoError::Protocol("Truncated reply frame".to_string())),
                };
            }
            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(GizmoError::Transient("Connection closed by server".to_string()));
            }
        }
    }
}

/// TCP executor for the graph protocol back end
pub struct GraphExecutor {
    profile: ConnectionProfile,
    address: String,
    user: String,
    retry: RetryPolicy,
    timeout: Duration,
    idle: Mutex<Vec<RespSession>>,
    closed: AtomicBool,
}

impl GraphExecutor {
    pub fn new(profile: ConnectionProfile, retry: RetryPolicy) -> GizmoResult<Self> {
        if profile.graph_endpoint.trim().is_empty() {
            return Err(GizmoError::Configuration(
                "graph_endpoint is required for the graph back end".to_string(),
            ));
        }

        Ok(Self {
            address: format!("{}:{}", profile.graph_endpoint.trim(), profile.graph_port),
            user: profile.resource_path(),
            timeout: Duration::from_secs(profile.request_timeout_secs),
            profile,
            retry,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Arguments of the query command for `query`
    fn query_command(&self, query: &str) -> RespValue {
        let mut args = vec!["GRAPH.QUERY", self.profile.graph_id.as_str(), query];
        if let Some(pk) = &self.profile.partition_key {
            args.push("PARTITION");
            args.push(pk.as_str());
        }
        RespValue::command(&args)
    }

    async fn checkout(&self) -> GizmoResult<RespSession> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GizmoError::Connection(format!("{} is closed", self.remote_message())));
        }
        if let Some(session) = self.idle.lock().await.pop() {
            return Ok(session);
        }
        RespSession::open(&self.address, &self.user, &self.profile.auth_key).await
    }

    async fn checkin(&self, session: RespSession) {
        if !self.closed.load(Ordering::Acquire) {
            self.idle.lock().await.push(session);
        }
    }

    /// Single attempt: send the command on a pooled session
    async fn run_once(&self, command: &RespValue) -> GizmoResult<RespValue> {
        let mut session = self.checkout().await?;

        let reply = match tokio::time::timeout(self.timeout, session.request(command)).await {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(GizmoError::Transient(format!(
                    "No reply from {} within {:?}",
                    self.address, self.timeout
                )))
            }
        };

        // the session is healthy whenever a full reply was read
        self.checkin(session).await;

        match reply {
            RespValue::Error(msg) => Err(reply_error(&msg)),
            value => Ok(value),
        }
    }

    async fn run(&self, query: &str, retry: &RetryPolicy, cancel: &CancellationToken) -> GizmoResult<ResultAggregate> {
        let started = Instant::now();
        let command = self.query_command(query);

        let out = retry.execute(cancel, |_| self.run_once(&command)).await?;
        let (columns, records) = rows_from_reply(&out.value)?;
        let elapsed = started.elapsed();

        let mut attributes = BTreeMap::new();
        attributes.insert("columns".to_string(), serde_json::json!(columns));
        attributes.insert("endpoint".to_string(), serde_json::json!(self.address));
        attributes.insert("elapsed_ms".to_string(), serde_json::json!(elapsed.as_millis() as u64));

        Ok(ResultAggregate::new(query, records, elapsed, 0.0, out.retries, attributes))
    }
}

#[async_trait]
impl QueryExecutor for GraphExecutor {
    async fn test_connection(&self, cancel: &CancellationToken) -> bool {
        let outcome = self.run(&self.profile.probe_query, &RetryPolicy::none(), cancel).await;
        probe_outcome(&self.remote_message(), outcome)
    }

    async fn execute_query(&self, query: &str, cancel: &CancellationToken) -> GizmoResult<ResultAggregate> {
        self.run(query, &self.retry, cancel).await
    }

    fn remote_message(&self) -> String {
        format!("graph: {}@{}", self.user, self.address)
    }

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Graph
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let dropped = {
                let mut idle = self.idle.lock().await;
                let n = idle.len();
                idle.clear();
                n
            };
            debug!("Closed {} ({} sessions)", self.remote_message(), dropped);
        }
    }
}

/// Map an error reply onto the retry taxonomy.
///
/// `THROTTLED <ms>` and `BUSY` are rate limits, `LOADING`/`TRYAGAIN` are
/// transient, anything else (including `NOAUTH`/`WRONGPASS`) is terminal.
fn reply_error(msg: &str) -> GizmoError {
    let mut parts = msg.split_whitespace();
    let code = parts.next().unwrap_or_default().to_ascii_uppercase();
    match code.as_str() {
        "THROTTLED" => GizmoError::Throttled {
            message: msg.to_string(),
            retry_after: parts
                .next()
                .and_then(|ms| ms.parse::<u64>().ok())
                .map(Duration::from_millis),
        },
        "BUSY" => GizmoError::Throttled {
            message: msg.to_string(),
            retry_after: None,
        },
        "LOADING" | "TRYAGAIN" => GizmoError::Transient(msg.to_string()),
        _ => GizmoError::remote(msg.to_string()),
    }
}

/// `[header, row...]` into column names and one JSON object per row
fn rows_from_reply(reply: &RespValue) -> GizmoResult<(Vec<String>, Vec<serde_json::Value>)> {
    let items = match reply {
        RespValue::Array(items) => items,
        RespValue::Null | RespValue::BulkString(None) => return Ok((Vec::new(), Vec::new())),
        other => return Ok((Vec::new(), vec![other.to_json()])),
    };

    let Some((header, rows)) = items.split_first() else {
        return Ok((Vec::new(), Vec::new()));
    };

    let columns: Vec<String> = header
        .as_array()?
        .iter()
        .enumerate()
        .map(|(i, c)| c.as_text().unwrap_or_else(|| format!("_{}", i)))
        .collect();

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let mut record = serde_json::Map::new();
        for (i, value) in row.as_array()?.iter().enumerate() {
            let key = columns.get(i).cloned().unwrap_or_else(|| format!("_{}", i));
            record.insert(key, value.to_json());
        }
        records.push(serde_json::Value::Object(record));
    }

    Ok((columns, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Some(s.as_bytes().to_vec()))
    }

    #[test]
    fn test_reply_error_mapping() {
        let err = reply_error("THROTTLED 120");
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(120)));

        assert!(reply_error("BUSY server overloaded").is_retryable());
        assert!(reply_error("LOADING dataset").is_retryable());
        assert!(!reply_error("WRONGPASS invalid credentials").is_retryable());
        assert!(!reply_error("ERR syntax error").is_retryable());
    }

    #[test]
    fn test_rows_from_reply() {
        let reply = RespValue::Array(vec![
            RespValue::Array(vec![bulk("name"), bulk("age")]),
            RespValue::Array(vec![bulk("Alice"), RespValue::Integer(30)]),
            RespValue::Array(vec![bulk("Bob"), RespValue::Null]),
        ]);
        let (columns, records) = rows_from_reply(&reply).unwrap();
        assert_eq!(columns, vec!["name", "age"]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], serde_json::json!({"name": "Alice", "age": 30}));
        assert_eq!(records[1]["age"], serde_json::Value::Null);
    }

    #[test]
    fn test_rows_from_status_reply() {
        let (columns, records) = rows_from_reply(&RespValue::SimpleString("OK".to_string())).unwrap();
        assert!(columns.is_empty());
        assert_eq!(records, vec![serde_json::json!("OK")]);

        let (_, records) = rows_from_reply(&RespValue::Array(vec![])).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_query_command_embeds_partition_key() {
        let profile = ConnectionProfile {
            graph_endpoint: "localhost".to_string(),
            graph_id: "social".to_string(),
            partition_key: Some("tenant-a".to_string()),
            ..Default::default()
        };
        let executor = GraphExecutor::new(profile, RetryPolicy::default()).unwrap();
        assert_eq!(
            executor.query_command("MATCH (n) RETURN n"),
            RespValue::command(&["GRAPH.QUERY", "social", "MATCH (n) RETURN n", "PARTITION", "tenant-a"])
        );
    }
}
