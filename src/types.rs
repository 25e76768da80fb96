//! Core data model for scoped dashboard variables.
//!
//! Definitions describe variables as authored in a dashboard configuration;
//! instances are the per-binding runtime records the engine operates on.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Scope a variable definition is declared at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionScope {
    /// One instance for the whole dashboard. Missing scope in older
    /// configurations is treated as global.
    #[default]
    Global,
    /// One instance per listed tab.
    Tabs,
    /// One instance per listed panel.
    Panels,
}

/// Concrete binding of one variable instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope")]
pub enum ScopeBinding {
    Global,
    Tab { tab_id: String },
    Panel { tab_id: String, panel_id: String },
}

impl ScopeBinding {
    /// Tab that owns this binding, if any. Panel bindings belong to the
    /// tab containing the panel.
    pub fn owning_tab(&self) -> Option<&str> {
        match self {
            ScopeBinding::Global => None,
            ScopeBinding::Tab { tab_id } => Some(tab_id),
            ScopeBinding::Panel { tab_id, .. } => Some(tab_id),
        }
    }

    pub fn panel_id(&self) -> Option<&str> {
        match self {
            ScopeBinding::Panel { panel_id, .. } => Some(panel_id),
            _ => None,
        }
    }
}

/// Stable identity of one variable instance: `name@scope[@tabId|@panelId]`.
///
/// Used for every graph lookup and readiness event; stable for the
/// instance's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(name: &str, binding: &ScopeBinding) -> Self {
        let rendered = match binding {
            ScopeBinding::Global => format!("{}@global", name),
            ScopeBinding::Tab { tab_id } => format!("{}@tab@{}", name, tab_id),
            ScopeBinding::Panel { panel_id, .. } => format!("{}@panel@{}", name, panel_id),
        };
        IdentityKey(rendered)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a variable definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    /// Options resolved by querying a stream field; the only kind that
    /// issues network requests.
    QueryValues,
    Custom,
    Constant,
    Textbox,
    DynamicFilters,
}

/// Policy applied to freshly resolved options to pick a default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    #[default]
    First,
    All,
    Custom,
    None,
}

/// A resolved candidate value presented for selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableOption {
    pub label: String,
    pub value: String,
}

impl VariableOption {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
        }
    }
}

/// Source descriptor for `query_values` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub stream: String,
    pub field: String,
    /// Filter expressions; may reference other variables via `$name` tokens.
    #[serde(default)]
    pub filters: Vec<String>,
    /// Maximum number of options to fetch.
    #[serde(default = "default_max_record_size")]
    pub max_record_size: u64,
}

fn default_max_record_size() -> u64 {
    10
}

/// Current value of a variable instance.
///
/// `Null` means "not yet resolved"; an empty `List` is a legitimate terminal
/// state meaning "no matching data upstream".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum VariableValue {
    #[default]
    Null,
    Scalar(String),
    List(Vec<String>),
}

impl VariableValue {
    /// Explicit deep-copy contract used at commit time. Committed state must
    /// never alias live list storage, so the copy is independent of
    /// reference identity.
    pub fn deep_clone(&self) -> Self {
        match self {
            VariableValue::Null => VariableValue::Null,
            VariableValue::Scalar(s) => VariableValue::Scalar(s.clone()),
            VariableValue::List(items) => VariableValue::List(items.to_vec()),
        }
    }

    /// True for null, an empty scalar, or an empty selection.
    pub fn is_empty(&self) -> bool {
        match self {
            VariableValue::Null => true,
            VariableValue::Scalar(s) => s.is_empty(),
            VariableValue::List(items) => items.is_empty(),
        }
    }

    /// Selected values as a list, regardless of arity.
    pub fn as_list(&self) -> Vec<String> {
        match self {
            VariableValue::Null => Vec::new(),
            VariableValue::Scalar(s) => vec![s.clone()],
            VariableValue::List(items) => items.clone(),
        }
    }
}

/// Lifecycle status of a variable instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableStatus {
    #[default]
    Idle,
    /// Visible but waiting for parent readiness.
    Pending,
    /// A resolution request is in flight.
    Loading,
    /// Terminal success: value is final for the current input set. An empty
    /// value still counts as loaded.
    PartiallyLoaded,
    /// Terminal failure, isolated to this instance and its descendants.
    Error,
}

/// A variable as authored in the dashboard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    pub kind: VariableKind,
    #[serde(default)]
    pub scope: DefinitionScope,
    #[serde(default)]
    pub multi_select: bool,
    #[serde(default)]
    pub query: Option<QueryDescriptor>,
    #[serde(default)]
    pub static_options: Vec<VariableOption>,
    #[serde(default)]
    pub selection_policy: SelectionPolicy,
    /// Preset selection applied when `selection_policy` is `Custom`.
    #[serde(default)]
    pub preset_selection: Vec<String>,
    /// Tab IDs this definition expands to when scope is `Tabs`.
    #[serde(default)]
    pub tabs: Vec<String>,
    /// Panel IDs this definition expands to when scope is `Panels`.
    #[serde(default)]
    pub panels: Vec<String>,
}

/// Runtime record for one (definition, binding) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInstance {
    pub key: IdentityKey,
    pub name: String,
    pub kind: VariableKind,
    pub binding: ScopeBinding,
    pub multi_select: bool,
    pub query: Option<QueryDescriptor>,
    pub static_options: Vec<VariableOption>,
    pub selection_policy: SelectionPolicy,
    pub preset_selection: Vec<String>,
    pub value: VariableValue,
    pub options: Vec<VariableOption>,
    pub status: VariableStatus,
    /// Derived from the owning tab/panel's visibility.
    pub visible: bool,
    pub error: Option<String>,
}

impl VariableInstance {
    pub fn from_definition(definition: &VariableDefinition, binding: ScopeBinding) -> Self {
        let key = IdentityKey::new(&definition.name, &binding);
        let mut instance = Self {
            key,
            name: definition.name.clone(),
            kind: definition.kind,
            binding,
            multi_select: definition.multi_select,
            query: definition.query.clone(),
            static_options: definition.static_options.clone(),
            selection_policy: definition.selection_policy,
            preset_selection: definition.preset_selection.clone(),
            value: VariableValue::Null,
            options: Vec::new(),
            status: VariableStatus::Idle,
            visible: false,
            error: None,
        };
        if instance.immediately_resolvable() {
            instance.settle_without_query();
        }
        instance
    }

    /// True when the value is fully determined without querying: every
    /// non-query kind, plus query kinds whose selection policy fixes the
    /// value up front (`all`, or `custom` with a non-empty preset).
    pub fn immediately_resolvable(&self) -> bool {
        match self.kind {
            VariableKind::Constant | VariableKind::Textbox | VariableKind::Custom
            | VariableKind::DynamicFilters => true,
            VariableKind::QueryValues => match self.selection_policy {
                SelectionPolicy::All => true,
                SelectionPolicy::Custom => !self.preset_selection.is_empty(),
                _ => false,
            },
        }
    }

    /// Settle to `PartiallyLoaded` from static configuration alone.
    fn settle_without_query(&mut self) {
        self.options = self.static_options.clone();
        self.value = match self.selection_policy {
            SelectionPolicy::All => {
                VariableValue::List(self.options.iter().map(|o| o.value.clone()).collect())
            }
            SelectionPolicy::Custom => VariableValue::List(self.preset_selection.clone()),
            SelectionPolicy::First => match self.options.first() {
                Some(first) if self.multi_select => VariableValue::List(vec![first.value.clone()]),
                Some(first) => VariableValue::Scalar(first.value.clone()),
                None => VariableValue::Null,
            },
            SelectionPolicy::None => VariableValue::Null,
        };
        self.status = VariableStatus::PartiallyLoaded;
    }

    /// Apply freshly resolved options and the default selection policy,
    /// transitioning to `PartiallyLoaded`.
    pub fn apply_resolved_options(&mut self, options: Vec<VariableOption>) {
        self.options = options;
        self.value = match self.selection_policy {
            SelectionPolicy::All => {
                VariableValue::List(self.options.iter().map(|o| o.value.clone()).collect())
            }
            SelectionPolicy::Custom => {
                // Keep only preset entries still present in the options.
                let available: Vec<String> = self
                    .preset_selection
                    .iter()
                    .filter(|preset| self.options.iter().any(|o| &o.value == *preset))
                    .cloned()
                    .collect();
                VariableValue::List(available)
            }
            SelectionPolicy::First => match self.options.first() {
                Some(first) if self.multi_select => VariableValue::List(vec![first.value.clone()]),
                Some(first) => VariableValue::Scalar(first.value.clone()),
                None => VariableValue::List(Vec::new()),
            },
            SelectionPolicy::None => VariableValue::Null,
        };
        self.status = VariableStatus::PartiallyLoaded;
        self.error = None;
    }

    pub fn is_resolved(&self) -> bool {
        self.status == VariableStatus::PartiallyLoaded
    }
}

/// Panel → owning tab lookup, built from the dashboard layout.
pub type PanelTabMap = HashMap<String, String>;

/// Inclusive time window in epoch microseconds, matching the query API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TimeRange {
    pub start_time: i64,
    pub end_time: i64,
}

impl TimeRange {
    pub fn new(start_time: i64, end_time: i64) -> Self {
        Self {
            start_time,
            end_time,
        }
    }

    pub fn duration_micros(&self) -> i64 {
        self.end_time - self.start_time
    }
}
