//! Context lookups: environmental facts read from a local cache file.
//!
//! Lookups never call out to the provider. A query missing from the cache is
//! recorded, a placeholder is returned so construction can continue, and
//! synthesis fails with `missing-context` listing every query key.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::app::App;
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult, MissingContext};

/// Default name of the context cache file.
pub const DEFAULT_CONTEXT_FILE: &str = ".context-cache.json";

/// A lookup request: provider name plus key/value properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextQuery {
    pub provider: String,
    pub props: BTreeMap<String, String>,
}

impl ContextQuery {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            props: BTreeMap::new(),
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Stable cache key: `provider:k1=v1:k2=v2` with keys sorted.
    pub fn key(&self) -> String {
        let mut key = self.provider.clone();
        for (k, v) in &self.props {
            key.push(':');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }
}

/// Source of cached context values.
#[cfg_attr(test, mockall::automock)]
pub trait ContextProvider {
    /// Cached value for a query key.
    fn get(&self, key: &str) -> Option<Value>;

    /// Every key in the cache.
    fn keys(&self) -> Vec<String>;
}

/// Context cache backed by a flat JSON object on disk.
#[derive(Debug, Clone, Default)]
pub struct FileContextProvider {
    path: Option<PathBuf>,
    values: BTreeMap<String, Value>,
}

impl FileContextProvider {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_values(values: BTreeMap<String, Value>) -> Self {
        Self { path: None, values }
    }

    /// Load a cache file. A missing file is an empty cache.
    pub fn load(path: &Path) -> CoreResult<Self> {
        if !path.exists() {
            debug!("No context cache at {}", path.display());
            return Ok(Self {
                path: Some(path.to_path_buf()),
                values: BTreeMap::new(),
            });
        }
        let content = fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&content).map_err(|e| {
            CoreError::Config(format!("invalid context file {}: {}", path.display(), e))
        })?;
        let Value::Object(map) = parsed else {
            return Err(CoreError::Config(format!(
                "context file {} must contain a JSON object",
                path.display()
            )));
        };
        debug!("Loaded {} context entries from {}", map.len(), path.display());
        Ok(Self {
            path: Some(path.to_path_buf()),
            values: map.into_iter().collect(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl ContextProvider for FileContextProvider {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

pub(crate) struct ContextStore {
    provider: Box<dyn ContextProvider>,
    missing: RefCell<Vec<MissingContext>>,
}

impl ContextStore {
    pub(crate) fn new(provider: Box<dyn ContextProvider>) -> Self {
        Self {
            provider,
            missing: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn missing(&self) -> Vec<MissingContext> {
        self.missing.borrow().clone()
    }
}

impl App {
    /// Look up a cached value for `query` in the environment of `scope`.
    ///
    /// `account` and `region` props are filled in from the stack. On a miss
    /// `placeholder` is returned and the query is recorded.
    pub fn lookup_context(
        &self,
        scope: ConstructId,
        query: ContextQuery,
        placeholder: Value,
    ) -> CoreResult<Value> {
        let env = self.require_concrete_env(scope, "a context lookup")?;
        let mut query = query;
        if let Some(account) = env.account {
            query.props.entry("account".to_string()).or_insert(account);
        }
        if let Some(region) = env.region {
            query.props.entry("region".to_string()).or_insert(region);
        }

        let key = query.key();
        if let Some(value) = self.context.provider.get(&key) {
            debug!("Context hit for {}", key);
            return Ok(value);
        }

        warn!("Context miss for {} at {}", key, self.path(scope));
        let mut missing = self.context.missing.borrow_mut();
        if !missing.iter().any(|m| m.key == key) {
            missing.push(MissingContext {
                path: self.path(scope),
                key,
                provider: query.provider,
                props: query.props,
            });
        }
        Ok(placeholder)
    }

    /// Context queries that missed the cache so far.
    pub fn missing_context(&self) -> Vec<MissingContext> {
        self.context.missing()
    }
}
