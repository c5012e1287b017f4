//! Operation catalog: `operationId -> (method, path)`.
//!
//! The catalog is plain data observed from the official app, not a contract.
//! It is loaded once and shared read-only; cloning a [`RouteCatalog`] is cheap.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaonisError};

const BUILTIN_MANIFEST: &str = include_str!("../data/http_routes.json");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
    pub operation_id: String,
    pub method: String,
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct RouteCatalog {
    routes: Arc<BTreeMap<String, RouteDefinition>>,
}

impl RouteCatalog {
    /// Catalog bundled with the crate.
    pub fn builtin() -> Result<Self> {
        Self::from_json_str(BUILTIN_MANIFEST)
    }

    /// Parses a JSON array of `{operationId, method, path}` entries.
    pub fn from_json_str(manifest: &str) -> Result<Self> {
        let entries: Vec<RouteDefinition> = serde_json::from_str(manifest)
            .map_err(|e| VaonisError::InvalidManifest(e.to_string()))?;
        Self::from_routes(entries)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let manifest = fs::read_to_string(path).map_err(|e| {
            VaonisError::InvalidManifest(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json_str(&manifest)
    }

    pub fn from_routes(entries: impl IntoIterator<Item = RouteDefinition>) -> Result<Self> {
        let mut routes = BTreeMap::new();
        for mut route in entries {
            route.method = route.method.to_ascii_uppercase();
            if route.operation_id.is_empty() {
                return Err(VaonisError::InvalidManifest("empty operationId".into()));
            }
            if routes.contains_key(&route.operation_id) {
                return Err(VaonisError::InvalidManifest(format!(
                    "duplicate operationId '{}'",
                    route.operation_id
                )));
            }
            routes.insert(route.operation_id.clone(), route);
        }
        Ok(Self {
            routes: Arc::new(routes),
        })
    }

    pub fn lookup(&self, operation_id: &str) -> Option<&RouteDefinition> {
        self.routes.get(operation_id)
    }

    /// Routes ordered by operation id.
    pub fn iter(&self) -> impl Iterator<Item = &RouteDefinition> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
