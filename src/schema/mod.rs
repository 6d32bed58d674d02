//! Time-series schema derivation and registration.
//!
//! Every device kind gets one collection table and one values table, with
//! names derived deterministically from the kind identifier, so adding a new
//! kind never requires hand-written schema. Registration is idempotent and
//! fails fast when a derived name collides with an existing table of a
//! different shape.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;

use crate::store::TelemetryStore;

/// The derived storage locations for one device kind.
#[derive(Clone, Debug, PartialEq)]
pub struct KindSchema {
    /// Kind identifier the tables were derived from
    pub kind: String,
    /// Collection table: one row per committed update cycle
    pub data_table: String,
    /// Values table: one row per named value within a collection
    pub values_table: String,
}

impl KindSchema {
    pub(crate) fn derive(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            data_table: format!("{}_data", kind),
            values_table: format!("{}_data_values", kind),
        }
    }
}

/// Schema registration errors
#[derive(Debug)]
pub enum SchemaError {
    /// Kind identifier violates the naming rules
    InvalidKind(String),
    /// A derived table name already exists with an incompatible shape
    Conflict { table: String, detail: String },
    /// The underlying store failed during registration
    Storage(String),
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::InvalidKind(kind) => {
                write!(
                    f,
                    "invalid kind identifier '{}': must be lowercase letters, digits and \
                     underscores, starting with a letter",
                    kind
                )
            }
            SchemaError::Conflict { table, detail } => {
                write!(f, "table '{}' conflicts with an existing definition: {}", table, detail)
            }
            SchemaError::Storage(e) => write!(f, "schema registration failed: {}", e),
        }
    }
}

impl std::error::Error for SchemaError {}

/// Validates a kind identifier.
///
/// Valid identifiers:
/// - Lowercase letters (a-z), digits, underscores
/// - Must start with a letter
///
/// The character class doubles as SQL-injection safety for the derived table
/// names, which are interpolated into DDL/DML statements.
fn is_valid_kind(kind: &str) -> bool {
    let mut chars = kind.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Registers kind schemas against a telemetry store, at most once per kind.
pub struct SchemaRegistry {
    store: Arc<TelemetryStore>,
    registered: DashMap<String, KindSchema>,
}

impl SchemaRegistry {
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        Self {
            store,
            registered: DashMap::new(),
        }
    }

    /// Registers a kind, creating its table pair if needed.
    ///
    /// Calling this twice for the same kind returns the cached schema without
    /// touching storage again. If either derived table already exists with a
    /// different column set, registration fails with `SchemaError::Conflict`
    /// before any write path can hit the mismatch.
    pub fn register(&self, kind: &str) -> Result<KindSchema, SchemaError> {
        if let Some(existing) = self.registered.get(kind) {
            return Ok(existing.clone());
        }
        if !is_valid_kind(kind) {
            return Err(SchemaError::InvalidKind(kind.to_string()));
        }

        let schema = KindSchema::derive(kind);
        self.store.ensure_kind_tables(&schema)?;
        self.registered.insert(kind.to_string(), schema.clone());
        Ok(schema)
    }
}
