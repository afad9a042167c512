//! Freshness dependencies
//!
//! A [`Dependency`] snapshots some external condition when a value is
//! written ([`Dependency::evaluate`]) and re-checks it when the value is
//! read ([`Dependency::has_changed`]). The whole description, configuration
//! and snapshot, travels inside the cached envelope, so a reader never has
//! to supply the dependency again.
//!
//! Variants that read from the outside world go through collaborators held
//! by a [`DependencyContext`]: named expressions, a [`GlobalState`] handle and
//! named [`QueryRunner`]s.

use std::{
    collections::HashMap,
    fmt,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::UNIX_EPOCH,
};

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::{CacheError, Result};

/// Comparable data produced by a dependency
pub type DependentData = Value;

/// Connection name used when a query dependency does not name one
pub const DEFAULT_CONNECTION: &str = "db";

/// Closure backing an expression dependency
pub type ExpressionFn = dyn Fn() -> Value + Send + Sync;

/// Read access to named, process-wide state slots
pub trait GlobalState: Send + Sync {
    fn get_state(&self, name: &str) -> Option<Value>;
}

/// Runs a parametrized query and returns its first row
pub trait QueryRunner: Send + Sync {
    /// `Ok(None)` when the query produced no rows
    fn query_row(&self, sql: &str, params: &[Value]) -> Result<Option<Vec<Value>>>;
}

/// In-memory [`GlobalState`] shared between writers and the cache
#[derive(Debug, Default)]
pub struct SharedGlobalState {
    slots: RwLock<HashMap<String, Value>>,
}

impl SharedGlobalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, name: impl Into<String>, value: Value) {
        self.slots.write().insert(name.into(), value);
    }

    pub fn remove_state(&self, name: &str) -> Option<Value> {
        self.slots.write().remove(name)
    }
}

impl GlobalState for SharedGlobalState {
    fn get_state(&self, name: &str) -> Option<Value> {
        self.slots.read().get(name).cloned()
    }
}

/// Collaborators that dependencies evaluate against
#[derive(Clone, Default)]
pub struct DependencyContext {
    expressions: HashMap<String, Arc<ExpressionFn>>,
    global_state: Option<Arc<dyn GlobalState>>,
    connections: HashMap<String, Arc<dyn QueryRunner>>,
}

impl DependencyContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named expression
    pub fn with_expression<F>(mut self, name: impl Into<String>, expression: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.expressions.insert(name.into(), Arc::new(expression));
        self
    }

    pub fn with_global_state(mut self, state: Arc<dyn GlobalState>) -> Self {
        self.global_state = Some(state);
        self
    }

    /// Register a query runner under a connection name
    pub fn with_connection(mut self, name: impl Into<String>, runner: Arc<dyn QueryRunner>) -> Self {
        self.connections.insert(name.into(), runner);
        self
    }

    fn expression(&self, name: &str) -> Result<&Arc<ExpressionFn>> {
        self.expressions.get(name).ok_or_else(|| {
            CacheError::configuration(format!("no expression registered as '{}'", name))
        })
    }

    fn global_state(&self) -> Result<&Arc<dyn GlobalState>> {
        self.global_state
            .as_ref()
            .ok_or_else(|| CacheError::configuration("no global state registered"))
    }

    fn connection(&self, name: &str) -> Result<&Arc<dyn QueryRunner>> {
        self.connections.get(name).ok_or_else(|| {
            CacheError::configuration(format!("no query connection registered as '{}'", name))
        })
    }
}

impl fmt::Debug for DependencyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyContext")
            .field("expressions", &self.expressions.keys().collect::<Vec<_>>())
            .field("global_state", &self.global_state.is_some())
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn unbounded_depth() -> i32 {
    -1
}

fn default_connection() -> String {
    DEFAULT_CONNECTION.to_string()
}

/// Persisted configuration of a dependency
///
/// Required fields are optional here so that a description with a missing
/// field can exist; evaluating it fails with [`CacheError::Configuration`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencySpec {
    /// Result of a registered expression
    Expression { name: Option<String> },
    /// Modification time of one file
    FileTimestamp { path: Option<PathBuf> },
    /// Modification times of the files under a directory
    DirectoryTimestamps {
        path: Option<PathBuf>,
        /// Levels of sub-directories to descend; negative means unbounded
        #[serde(default = "unbounded_depth")]
        max_depth: i32,
        /// Regex matched against file names
        #[serde(default)]
        name_pattern: Option<String>,
    },
    /// First row of a query
    DatabaseQuery {
        #[serde(default = "default_connection")]
        connection: String,
        sql: Option<String>,
        #[serde(default)]
        params: Vec<Value>,
    },
    /// Value of a named global state slot
    GlobalStateValue { name: Option<String> },
    /// Changed as soon as any child changed
    Chained { children: Vec<Dependency> },
}

impl DependencySpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Expression { .. } => "expression",
            Self::FileTimestamp { .. } => "file_timestamp",
            Self::DirectoryTimestamps { .. } => "directory_timestamps",
            Self::DatabaseQuery { .. } => "database_query",
            Self::GlobalStateValue { .. } => "global_state_value",
            Self::Chained { .. } => "chained",
        }
    }

    /// Compute the current dependent data. Chains carry no data of their own.
    fn generate(&self, ctx: &DependencyContext) -> Result<DependentData> {
        match self {
            Self::Expression { name } => {
                let name = required(name.as_deref(), "expression", "name")?;
                let expression = ctx.expression(name)?;
                Ok(expression())
            }
            Self::FileTimestamp { path } => {
                let path = required(path.as_deref(), "file_timestamp", "path")?;
                Ok(match fs::metadata(path) {
                    Ok(meta) => modified_nanos(&meta),
                    Err(_) => Value::Null,
                })
            }
            Self::DirectoryTimestamps {
                path,
                max_depth,
                name_pattern,
            } => {
                let path = required(path.as_deref(), "directory_timestamps", "path")?;
                directory_timestamps(path, *max_depth, name_pattern.as_deref())
            }
            Self::DatabaseQuery {
                connection,
                sql,
                params,
            } => {
                let sql = required(sql.as_deref(), "database_query", "sql")?;
                let row = ctx.connection(connection)?.query_row(sql, params)?;
                Ok(row.map(Value::Array).unwrap_or(Value::Null))
            }
            Self::GlobalStateValue { name } => {
                let name = required(name.as_deref(), "global_state_value", "name")?;
                Ok(ctx.global_state()?.get_state(name).unwrap_or(Value::Null))
            }
            Self::Chained { .. } => Ok(Value::Null),
        }
    }
}

fn required<'a, T: ?Sized>(field: Option<&'a T>, kind: &str, name: &str) -> Result<&'a T> {
    field.ok_or_else(|| {
        CacheError::configuration(format!("{} dependency requires '{}'", kind, name))
    })
}

fn modified_nanos(meta: &fs::Metadata) -> Value {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|elapsed| Value::from(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)))
        .unwrap_or(Value::Null)
}

fn directory_timestamps(root: &Path, max_depth: i32, name_pattern: Option<&str>) -> Result<Value> {
    let meta = fs::metadata(root).map_err(|e| {
        CacheError::configuration(format!("directory '{}' is not readable: {}", root.display(), e))
    })?;
    if !meta.is_dir() {
        return Err(CacheError::configuration(format!(
            "'{}' is not a directory",
            root.display()
        )));
    }

    let pattern = name_pattern
        .map(Regex::new)
        .transpose()
        .map_err(|e| CacheError::configuration(format!("invalid name pattern: {}", e)))?;

    // Depth 1 holds the directory's own files; each level below adds one.
    let mut walker = WalkDir::new(root).min_depth(1);
    if let Ok(levels) = usize::try_from(max_depth) {
        walker = walker.max_depth(levels + 1);
    }

    let mut timestamps = Map::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(pattern) = &pattern {
            if !pattern.is_match(&entry.file_name().to_string_lossy()) {
                continue;
            }
        }
        let mtime = entry
            .metadata()
            .map(|meta| modified_nanos(&meta))
            .unwrap_or(Value::Null);
        timestamps.insert(entry.path().to_string_lossy().into_owned(), mtime);
    }

    Ok(Value::Object(timestamps))
}

/// A dependency description plus the snapshot taken at write time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    spec: DependencySpec,
    #[serde(default)]
    data: DependentData,
}

impl Dependency {
    pub fn from_spec(spec: DependencySpec) -> Self {
        Self {
            spec,
            data: Value::Null,
        }
    }

    /// Depends on the result of the expression registered as `name`
    pub fn expression(name: impl Into<String>) -> Self {
        Self::from_spec(DependencySpec::Expression {
            name: Some(name.into()),
        })
    }

    /// Depends on a file's modification time
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::from_spec(DependencySpec::FileTimestamp {
            path: Some(path.into()),
        })
    }

    /// Depends on every file below `path`, at any depth
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::directory_with(path, unbounded_depth(), None)
    }

    pub fn directory_with(
        path: impl Into<PathBuf>,
        max_depth: i32,
        name_pattern: Option<&str>,
    ) -> Self {
        Self::from_spec(DependencySpec::DirectoryTimestamps {
            path: Some(path.into()),
            max_depth,
            name_pattern: name_pattern.map(str::to_string),
        })
    }

    /// Depends on the first row of a query on the default connection
    pub fn query(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::query_on(DEFAULT_CONNECTION, sql, params)
    }

    pub fn query_on(connection: impl Into<String>, sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::from_spec(DependencySpec::DatabaseQuery {
            connection: connection.into(),
            sql: Some(sql.into()),
            params,
        })
    }

    /// Depends on a named global state slot
    pub fn global_state(name: impl Into<String>) -> Self {
        Self::from_spec(DependencySpec::GlobalStateValue {
            name: Some(name.into()),
        })
    }

    /// Changed when any of `children` changed
    pub fn chain(children: Vec<Dependency>) -> Self {
        Self::from_spec(DependencySpec::Chained { children })
    }

    pub fn spec(&self) -> &DependencySpec {
        &self.spec
    }

    /// Snapshot taken by the last [`evaluate`](Self::evaluate)
    pub fn data(&self) -> &DependentData {
        &self.data
    }

    /// Snapshot the current state.
    ///
    /// Chains evaluate every child so each one has a snapshot to compare later.
    pub fn evaluate(&mut self, ctx: &DependencyContext) -> Result<()> {
        match &mut self.spec {
            DependencySpec::Chained { children } => {
                for child in children.iter_mut() {
                    child.evaluate(ctx)?;
                }
            }
            spec => {
                self.data = spec.generate(ctx)?;
            }
        }
        Ok(())
    }

    /// Recompute the state and compare it with the snapshot.
    ///
    /// Chains stop at the first child reporting a change.
    pub fn has_changed(&self, ctx: &DependencyContext) -> Result<bool> {
        match &self.spec {
            DependencySpec::Chained { children } => {
                for child in children {
                    if child.has_changed(ctx)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            spec => Ok(spec.generate(ctx)? != self.data),
        }
    }
}
