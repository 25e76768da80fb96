//! Streaming query transport collaborator interface.
//!
//! The orchestrator issues cancellable streaming requests through this
//! trait; production implementations wrap the platform's HTTP/WebSocket
//! search APIs, tests use an in-memory fake. Events are delivered through a
//! bounded channel until `End` or `Error`.

use crate::types::TimeRange;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Server-reported ordering of returned hits; drives the orchestrator's
/// prepend-vs-append policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Per-query metadata reported at stream start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResultMetadata {
    pub order_by: SortOrder,
    /// Raw function/histogram metadata echoed by the server.
    #[serde(default)]
    pub extra: Option<Value>,
}

/// One event on a streaming search.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Metadata(ResultMetadata),
    /// A batch of result rows.
    Hits(Vec<Value>),
    /// Completion percentage, 0..=100.
    Progress(u8),
    Error {
        message: String,
        status_code: Option<u16>,
    },
    End,
    /// Server asked the client to restart the stream from scratch.
    Reset,
}

/// Request descriptor for one streaming search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Identifier tracked for best-effort cancellation.
    pub trace_id: String,
    pub query: String,
    pub time_range: TimeRange,
    pub size: i64,
    pub org_id: String,
    /// Dashboard/panel identifiers and anything else the backend wants
    /// echoed back, opaque to the orchestrator.
    #[serde(default)]
    pub metadata: Value,
}

#[async_trait]
pub trait StreamingTransport: Send + Sync {
    /// Issue a streaming search. Implementations send events into `sink`
    /// and finish with `End` (or `Error`); dropping the sink early means
    /// the consumer went away and remaining events may be discarded.
    async fn search(&self, request: SearchRequest, sink: mpsc::Sender<StreamEvent>);

    /// Best-effort cancellation of an in-flight request.
    async fn cancel(&self, trace_id: &str);
}
