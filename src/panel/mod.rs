//! Panel load orchestrator.
//!
//! One orchestrator per mounted panel. A load run walks a fixed gate
//! sequence — debounce, visibility, variable readiness — then issues one
//! cancellable streaming request per configured query (plus time-shift
//! variants), feeding incremental results into panel state and persisting a
//! snapshot to the local cache after every meaningful event.
//!
//! Cancellation is cooperative: every suspension point selects against the
//! run's abort signal, and starting a new run supersedes the previous one
//! by replacing its signal.

pub mod fingerprint;
pub mod interval;
pub mod substitute;

use crate::cache::{PanelCacheKey, PanelCacheStore};
use crate::config::DashvarConfig;
use crate::engine::VariableResolutionEngine;
use crate::error::PanelError;
use crate::graph::refs::extract_references;
use crate::transport::{ResultMetadata, SearchRequest, SortOrder, StreamEvent, StreamingTransport};
use crate::types::{TimeRange, VariableInstance, VariableValue};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Default debounce applied to coalesce rapid successive triggers.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// Displayed error messages are trimmed to this many characters.
const MAX_ERROR_LEN: usize = 300;

const EVENT_BUFFER: usize = 32;

/// AbortHandle/AbortSignal pair. The handle aborts; clones of the signal
/// are checked at every suspension point. Dropping the handle (a new run
/// replacing the old) also reads as aborted.
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the run is aborted or superseded.
    pub async fn aborted(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        loop {
            if self.rx.changed().await.is_err() {
                return;
            }
            if *self.rx.borrow() {
                return;
            }
        }
    }
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// Where a run currently sits in the gate sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    #[default]
    Idle,
    WaitingDebounce,
    WaitingVisible,
    WaitingVariables,
    Running,
    Completed,
    Cancelled,
    Errored,
}

/// Bounded, display-ready failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelErrorDetail {
    pub message: String,
    pub status_code: Option<u16>,
}

/// Mutable panel load state, mutated exclusively by the orchestrator's
/// response handlers and snapshotted into the cache.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PanelLoadState {
    /// Accumulated rows, one slot per (query, time-shift variant).
    pub data: Vec<Vec<Value>>,
    pub loading: bool,
    pub phase: RunPhase,
    /// True whenever displayed data may not reflect the final complete
    /// result: after cancellation, a streaming partial, or teardown
    /// mid-flight.
    pub is_partial_data: bool,
    pub is_operation_cancelled: bool,
    pub result_meta: Vec<Option<ResultMetadata>>,
    /// Epoch milliseconds of the most recent trigger.
    pub last_triggered_at: Option<i64>,
    /// In-flight request identifiers, tracked for cancellation.
    pub search_request_trace_ids: Vec<String>,
    pub error_detail: Option<PanelErrorDetail>,
    /// Completion percentage, 0..=100.
    pub progress: u8,
    /// Set when a cache hit was restored for a different time window than
    /// the currently selected one; the data is kept regardless.
    pub is_cached_data_differ_with_current_time_range: bool,
}

/// One configured query, optionally with time-shifted comparison variants
/// (each an independent copy of the query translated by an offset).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelQuery {
    pub query: String,
    /// Offsets in microseconds, one extra variant per entry.
    #[serde(default)]
    pub time_shifts: Vec<i64>,
}

/// Static panel configuration the orchestrator runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PanelSchema {
    pub panel_id: String,
    pub tab_id: String,
    pub queries: Vec<PanelQuery>,
    /// Rendered width, drives interval bucketing.
    pub width_px: u32,
    #[serde(default = "default_timestamp_column")]
    pub timestamp_column: String,
    /// Full schema document, fingerprinted for cache invalidation.
    pub raw: Value,
}

fn default_timestamp_column() -> String {
    "_timestamp".to_string()
}

/// Per-panel load controller.
pub struct PanelLoadOrchestrator {
    schema: PanelSchema,
    folder_id: String,
    dashboard_id: String,
    org_id: String,
    debounce: Duration,
    engine: Arc<RwLock<VariableResolutionEngine>>,
    transport: Arc<dyn StreamingTransport>,
    cache: Arc<dyn PanelCacheStore>,
    state: Arc<RwLock<PanelLoadState>>,
    run_counter: AtomicU64,
    abort: Mutex<Option<AbortHandle>>,
    visibility: watch::Sender<bool>,
    trace_seq: AtomicU64,
}

impl PanelLoadOrchestrator {
    pub fn new(
        schema: PanelSchema,
        folder_id: impl Into<String>,
        dashboard_id: impl Into<String>,
        org_id: impl Into<String>,
        engine: Arc<RwLock<VariableResolutionEngine>>,
        transport: Arc<dyn StreamingTransport>,
        cache: Arc<dyn PanelCacheStore>,
    ) -> Self {
        Self {
            schema,
            folder_id: folder_id.into(),
            dashboard_id: dashboard_id.into(),
            org_id: org_id.into(),
            debounce: DEFAULT_DEBOUNCE,
            engine,
            transport,
            cache,
            state: Arc::new(RwLock::new(PanelLoadState::default())),
            run_counter: AtomicU64::new(0),
            abort: Mutex::new(None),
            visibility: watch::channel(false).0,
            trace_seq: AtomicU64::new(0),
        }
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// [`Self::new`] tuned by [`DashvarConfig`].
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        schema: PanelSchema,
        folder_id: impl Into<String>,
        dashboard_id: impl Into<String>,
        org_id: impl Into<String>,
        engine: Arc<RwLock<VariableResolutionEngine>>,
        transport: Arc<dyn StreamingTransport>,
        cache: Arc<dyn PanelCacheStore>,
        config: &DashvarConfig,
    ) -> Self {
        Self::new(schema, folder_id, dashboard_id, org_id, engine, transport, cache)
            .with_debounce(config.engine.debounce())
    }

    /// Snapshot of the current panel state.
    pub fn state(&self) -> PanelLoadState {
        self.state.read().clone()
    }

    pub fn set_visible(&self, visible: bool) {
        // send_replace stores the value even when no run is subscribed yet,
        // so a mount-time set_visible(true) is observed by a later run.
        self.visibility.send_replace(visible);
    }

    /// Explicit user cancel: the running task observes the signal and
    /// performs the cancellation bookkeeping.
    pub fn cancel(&self) {
        if let Some(handle) = self.abort.lock().as_ref() {
            handle.abort();
        }
    }

    /// Component teardown: abort the active run and best-effort cancel all
    /// tracked request identifiers against the transport.
    pub async fn teardown(&self) {
        self.cancel();
        let (mid_flight, trace_ids) = {
            let mut state = self.state.write();
            let mid_flight = state.loading;
            if mid_flight {
                state.loading = false;
                state.is_partial_data = true;
                state.is_operation_cancelled = true;
                state.phase = RunPhase::Cancelled;
            }
            (mid_flight, state.search_request_trace_ids.clone())
        };
        if mid_flight {
            for trace_id in trace_ids {
                self.transport.cancel(&trace_id).await;
            }
        }
    }

    /// Variable names referenced by any configured query.
    pub fn referenced_variable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for panel_query in &self.schema.queries {
            for name in extract_references(&panel_query.query) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// Run the full load sequence for one trigger.
    ///
    /// Any prior in-flight run is superseded immediately. Returns once the
    /// run completes, errors, or is cancelled; state carries the outcome.
    pub async fn load_data(&self, time_range: TimeRange, force_load: bool) {
        let run_index = self.run_counter.fetch_add(1, Ordering::SeqCst);
        let mut signal = self.install_abort();

        {
            let mut state = self.state.write();
            state.loading = true;
            state.phase = RunPhase::WaitingDebounce;
            state.last_triggered_at = Some(Utc::now().timestamp_millis());
            state.error_detail = None;
        }
        debug!(panel_id = %self.schema.panel_id, run_index, "panel load triggered");

        // Debounce: coalesce rapid successive triggers.
        tokio::select! {
            _ = sleep(self.debounce) => {}
            _ = signal.aborted() => {
                self.finish_cancelled(run_index).await;
                return;
            }
        }

        // Visibility gate, skipped on force reload.
        if !force_load && !self.wait_visible(&mut signal, run_index).await {
            return;
        }

        // Variable readiness gate.
        if !self.wait_variables_ready(&mut signal, run_index).await {
            return;
        }

        // Queries execute against committed state; take the per-panel
        // commit now.
        {
            let mut engine = self.engine.write();
            engine.store_mut().commit_panel(&self.schema.panel_id);
        }
        let committed: Vec<VariableInstance> = {
            let engine = self.engine.read();
            let store = engine.store();
            store
                .committed_for_panel(&self.schema.panel_id, &self.schema.tab_id)
                .into_iter()
                .cloned()
                .collect()
        };

        let variable_values: Vec<(String, VariableValue)> = committed
            .iter()
            .map(|instance| (instance.name.clone(), instance.value.deep_clone()))
            .collect();
        let cache_fingerprint = fingerprint::panel_fingerprint(
            &self.schema.raw,
            &variable_values,
            force_load,
            &self.folder_id,
            &self.dashboard_id,
        );

        // Warm start: on the very first run, a fingerprint match restores
        // the cached snapshot and short-circuits the network entirely.
        if run_index == 0 && self.try_restore_from_cache(&cache_fingerprint, &time_range) {
            return;
        }

        let slots: usize = self
            .schema
            .queries
            .iter()
            .map(|q| 1 + q.time_shifts.len())
            .sum();
        {
            let mut state = self.state.write();
            state.phase = RunPhase::Running;
            state.data = vec![Vec::new(); slots];
            state.result_meta = vec![None; slots];
            state.search_request_trace_ids.clear();
            state.progress = 0;
            state.is_operation_cancelled = false;
        }

        let mut slot = 0;
        for panel_query in self.schema.queries.clone() {
            if let Err(err) = validate_query(&panel_query.query, &self.schema.timestamp_column) {
                // A bad query skips itself, not the whole panel.
                warn!(panel_id = %self.schema.panel_id, error = %err, "query validation failed, skipping");
                self.state.write().error_detail = Some(PanelErrorDetail {
                    message: trim_error(&err.to_string()),
                    status_code: None,
                });
                slot += 1 + panel_query.time_shifts.len();
                continue;
            }

            let mut offsets = vec![0_i64];
            offsets.extend(&panel_query.time_shifts);
            for offset in offsets {
                let shifted = TimeRange::new(time_range.start_time - offset, time_range.end_time - offset);
                let query_text = self.build_query_text(&panel_query.query, &shifted, &committed);
                let request = self.build_request(query_text, shifted);
                self.state
                    .write()
                    .search_request_trace_ids
                    .push(request.trace_id.clone());

                match self
                    .run_streaming_query(slot, request, &cache_fingerprint, &time_range, &mut signal)
                    .await
                {
                    Ok(()) => {}
                    Err(PanelError::Cancelled) => {
                        self.finish_cancelled(run_index).await;
                        return;
                    }
                    Err(err) => {
                        // Recorded in state already; remaining queries
                        // still run.
                        warn!(panel_id = %self.schema.panel_id, error = %err, "streaming query failed");
                    }
                }
                slot += 1;
            }
        }

        {
            let mut state = self.state.write();
            state.loading = false;
            state.progress = 100;
            state.is_operation_cancelled = false;
            if state.error_detail.is_some() {
                // Some query was skipped or failed; whatever streamed in is
                // not the complete result.
                state.is_partial_data = true;
                state.phase = RunPhase::Errored;
            } else {
                state.is_partial_data = false;
                state.phase = RunPhase::Completed;
            }
        }
        self.write_cache_snapshot(&cache_fingerprint, &time_range);
        debug!(panel_id = %self.schema.panel_id, run_index, "panel load finished");
    }

    /// Replace the active abort handle, superseding any previous run.
    fn install_abort(&self) -> AbortSignal {
        let (handle, signal) = abort_pair();
        let previous = self.abort.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        signal
    }

    async fn wait_visible(&self, signal: &mut AbortSignal, run_index: u64) -> bool {
        self.state.write().phase = RunPhase::WaitingVisible;
        let mut rx = self.visibility.subscribe();
        loop {
            if *rx.borrow() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = signal.aborted() => {
                    self.finish_cancelled(run_index).await;
                    return false;
                }
            }
        }
    }

    async fn wait_variables_ready(&self, signal: &mut AbortSignal, run_index: u64) -> bool {
        self.state.write().phase = RunPhase::WaitingVariables;
        let referenced = self.referenced_variable_names();
        loop {
            // Subscribe before checking so no event can slip between the
            // check and the wait.
            let (ready, mut events) = {
                let engine = self.engine.read();
                let events = engine.subscribe();
                let ready = engine.panel_variables_ready(
                    &self.schema.panel_id,
                    &self.schema.tab_id,
                    &referenced,
                );
                (ready, events)
            };
            if ready {
                return true;
            }
            tokio::select! {
                _ = events.recv() => {}
                _ = signal.aborted() => {
                    self.finish_cancelled(run_index).await;
                    return false;
                }
            }
        }
    }

    fn build_query_text(
        &self,
        query: &str,
        time_range: &TimeRange,
        committed: &[VariableInstance],
    ) -> String {
        let tokens = interval::compute_interval(time_range, self.schema.width_px);
        let committed_refs: Vec<&VariableInstance> = committed.iter().collect();

        let with_intervals =
            substitute::substitute_tokens(query, &substitute::interval_token_values(&tokens));
        let with_variables = substitute::substitute_tokens(
            &with_intervals,
            &substitute::token_values(&committed_refs),
        );
        let filters = substitute::dynamic_filters_from(&committed_refs);
        substitute::apply_dynamic_filters(&with_variables, &filters)
    }

    fn build_request(&self, query: String, time_range: TimeRange) -> SearchRequest {
        let trace_id = format!(
            "{}-{}",
            self.schema.panel_id,
            self.trace_seq.fetch_add(1, Ordering::Relaxed)
        );
        SearchRequest {
            trace_id,
            query,
            time_range,
            size: -1,
            org_id: self.org_id.clone(),
            metadata: json!({
                "folderId": self.folder_id,
                "dashboardId": self.dashboard_id,
                "panelId": self.schema.panel_id,
            }),
        }
    }

    /// Consume one streaming request to completion, cancellation, or error,
    /// checking the abort signal before every state mutation.
    async fn run_streaming_query(
        &self,
        slot: usize,
        request: SearchRequest,
        cache_fingerprint: &str,
        time_range: &TimeRange,
        signal: &mut AbortSignal,
    ) -> Result<(), PanelError> {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let transport = Arc::clone(&self.transport);
        let search_request = request.clone();
        let stream = tokio::spawn(async move { transport.search(search_request, tx).await });

        loop {
            tokio::select! {
                event = rx.recv() => {
                    if signal.is_aborted() {
                        stream.abort();
                        return Err(PanelError::Cancelled);
                    }
                    match event {
                        None => {
                            // Stream ended without a terminal event.
                            self.state.write().is_partial_data = true;
                            return Ok(());
                        }
                        Some(StreamEvent::Metadata(meta)) => {
                            if let Some(entry) = self.state.write().result_meta.get_mut(slot) {
                                *entry = Some(meta);
                            }
                            self.write_cache_snapshot(cache_fingerprint, time_range);
                        }
                        Some(StreamEvent::Hits(batch)) => {
                            {
                                let mut state = self.state.write();
                                let order = state
                                    .result_meta
                                    .get(slot)
                                    .and_then(|m| m.as_ref())
                                    .map(|m| m.order_by)
                                    .unwrap_or_default();
                                if let Some(data_slot) = state.data.get_mut(slot) {
                                    merge_hits(data_slot, batch, order);
                                }
                                state.is_partial_data = true;
                            }
                            self.write_cache_snapshot(cache_fingerprint, time_range);
                        }
                        Some(StreamEvent::Progress(progress)) => {
                            self.state.write().progress = progress.min(100);
                        }
                        Some(StreamEvent::Error { message, status_code }) => {
                            {
                                let mut state = self.state.write();
                                state.error_detail = Some(PanelErrorDetail {
                                    message: trim_error(&message),
                                    status_code,
                                });
                                state.is_partial_data = true;
                            }
                            self.write_cache_snapshot(cache_fingerprint, time_range);
                            return Err(PanelError::Transport { message, status_code });
                        }
                        Some(StreamEvent::End) => {
                            self.write_cache_snapshot(cache_fingerprint, time_range);
                            return Ok(());
                        }
                        Some(StreamEvent::Reset) => {
                            let mut state = self.state.write();
                            if let Some(data_slot) = state.data.get_mut(slot) {
                                data_slot.clear();
                            }
                            if let Some(entry) = state.result_meta.get_mut(slot) {
                                *entry = None;
                            }
                        }
                    }
                }
                _ = signal.aborted() => {
                    stream.abort();
                    return Err(PanelError::Cancelled);
                }
            }
        }
    }

    /// Cancellation bookkeeping. Skipped when a newer run has already taken
    /// over the state; its own lifecycle owns the flags from then on.
    async fn finish_cancelled(&self, run_index: u64) {
        if self.run_counter.load(Ordering::SeqCst) != run_index + 1 {
            return;
        }
        let trace_ids = {
            let mut state = self.state.write();
            state.loading = false;
            state.is_partial_data = true;
            state.is_operation_cancelled = true;
            state.phase = RunPhase::Cancelled;
            state.search_request_trace_ids.clone()
        };
        for trace_id in trace_ids {
            self.transport.cancel(&trace_id).await;
        }
        debug!(panel_id = %self.schema.panel_id, run_index, "panel load cancelled");
    }

    fn try_restore_from_cache(&self, cache_fingerprint: &str, time_range: &TimeRange) -> bool {
        let owner = self.cache_key();
        let Some(entry) = self.cache.get_entry(&owner) else {
            return false;
        };
        if entry.key != cache_fingerprint {
            return false;
        }
        let Ok(mut restored) = serde_json::from_value::<PanelLoadState>(entry.value) else {
            return false;
        };
        restored.loading = false;
        restored.phase = RunPhase::Completed;
        restored.is_cached_data_differ_with_current_time_range =
            entry.cache_time_range != *time_range;
        *self.state.write() = restored;
        debug!(panel_id = %self.schema.panel_id, "panel state restored from cache");
        true
    }

    /// Fire-and-forget snapshot write; the store swallows failures.
    fn write_cache_snapshot(&self, cache_fingerprint: &str, time_range: &TimeRange) {
        let Ok(snapshot) = serde_json::to_value(&*self.state.read()) else {
            return;
        };
        self.cache.put_entry(
            &self.cache_key(),
            cache_fingerprint.to_string(),
            snapshot,
            *time_range,
        );
    }

    fn cache_key(&self) -> PanelCacheKey {
        PanelCacheKey::new(
            self.folder_id.clone(),
            self.dashboard_id.clone(),
            self.schema.panel_id.clone(),
        )
    }
}

/// Merge one hits batch into a slot. Ascending streams deliver newest-last
/// context first, so a new batch goes in front; descending (the default)
/// appends.
fn merge_hits(data_slot: &mut Vec<Value>, mut batch: Vec<Value>, order: SortOrder) {
    match order {
        SortOrder::Asc => {
            batch.append(data_slot);
            *data_slot = batch;
        }
        SortOrder::Desc => data_slot.extend(batch),
    }
}

/// Reject a disallowed alias onto the timestamp column; the colliding query
/// is skipped, the panel's other queries still run.
fn validate_query(query: &str, timestamp_column: &str) -> Result<(), PanelError> {
    let lowered = query.to_lowercase();
    let needle = format!(" as {}", timestamp_column.to_lowercase());
    let mut search_from = 0;
    while let Some(pos) = lowered[search_from..].find(&needle) {
        let end = search_from + pos + needle.len();
        let boundary = lowered[end..]
            .chars()
            .next()
            .map(|c| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(true);
        if boundary {
            return Err(PanelError::Validation(format!(
                "column alias must not collide with the timestamp column '{}'",
                timestamp_column
            )));
        }
        search_from = end;
    }
    Ok(())
}

fn trim_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    message.chars().take(MAX_ERROR_LEN).collect()
}
