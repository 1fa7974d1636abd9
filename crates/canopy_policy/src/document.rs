//! Policy documents: ordered statements with minimization and validation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{PolicyError, PolicyResult};
use crate::statement::{Effect, PolicyStatement};

/// Policy language version written into every rendered document.
pub const POLICY_VERSION: &str = "2012-10-17";

/// An ordered collection of policy statements.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    statements: Vec<PolicyStatement>,
}

/// Outcome of validating a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyValidation {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl PolicyValidation {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn merge(&mut self, other: PolicyValidation) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

impl PolicyDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_statements(statements: impl IntoIterator<Item = PolicyStatement>) -> Self {
        let mut doc = Self::new();
        for statement in statements {
            doc.add_statement(statement);
        }
        doc
    }

    /// Append a statement. Returns `false` when an identical statement is
    /// already present, which makes repeated grants idempotent.
    pub fn add_statement(&mut self, statement: PolicyStatement) -> bool {
        if self.statements.iter().any(|s| *s == statement) {
            debug!("Skipping duplicate policy statement");
            return false;
        }
        self.statements.push(statement);
        true
    }

    /// Append all statements of `other`, skipping duplicates.
    pub fn merge(&mut self, other: &PolicyDocument) {
        for statement in &other.statements {
            self.add_statement(statement.clone());
        }
    }

    pub fn statements(&self) -> &[PolicyStatement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Coalesce statements whose non-action fields are identical and drop
    /// statements that grant nothing.
    pub fn minimized(&self) -> PolicyDocument {
        let mut merged: Vec<PolicyStatement> = Vec::with_capacity(self.statements.len());
        for statement in &self.statements {
            match merged.iter_mut().find(|kept| kept.same_scope(statement)) {
                Some(kept) => kept.add_actions(statement.actions.iter().cloned()),
                None => merged.push(statement.clone()),
            }
        }
        merged.retain(PolicyStatement::has_action);
        PolicyDocument { statements: merged }
    }

    /// Render the minimized document, or `None` when it has no statements.
    pub fn to_json(&self) -> Option<Value> {
        let minimized = self.minimized();
        if minimized.is_empty() {
            return None;
        }
        let statements: Vec<Value> = minimized.statements.iter().map(|s| s.to_json()).collect();
        Some(json!({
            "Statement": statements,
            "Version": POLICY_VERSION,
        }))
    }

    /// Parse a JSON policy document.
    pub fn from_json(value: &Value) -> PolicyResult<Self> {
        let statements = value
            .get("Statement")
            .ok_or_else(|| PolicyError::InvalidDocument("missing 'Statement'".to_string()))?;
        let statements = match statements {
            Value::Array(items) => items.clone(),
            single @ Value::Object(_) => vec![single.clone()],
            other => {
                return Err(PolicyError::InvalidDocument(format!(
                    "'Statement' must be a list, got {}",
                    other
                )))
            }
        };
        let mut doc = PolicyDocument::new();
        for (index, statement) in statements.iter().enumerate() {
            doc.add_statement(PolicyStatement::from_json(index, statement)?);
        }
        Ok(doc)
    }

    /// Checks that apply to every kind of policy.
    pub fn validate_for_any_policy(&self) -> PolicyValidation {
        let mut result = PolicyValidation::default();
        for (index, statement) in self.statements.iter().enumerate() {
            if !statement.has_action() {
                result.error(format!(
                    "Statement #{} must specify at least one action",
                    index
                ));
            }
            if !statement.has_principal() && !statement.has_resource() {
                result.error(format!(
                    "Statement #{} must specify at least one principal or resource",
                    index
                ));
            }
            if statement.effect == Effect::Deny
                && statement.principals.iter().any(|p| p.is_any())
                && statement.actions.iter().any(|a| is_broad_action(a))
            {
                result.warning(format!(
                    "Statement #{} denies broad actions to any principal",
                    index
                ));
            }
        }
        result
    }

    /// Resource policies must name principals on every statement.
    pub fn validate_for_resource_policy(&self) -> PolicyValidation {
        let mut result = self.validate_for_any_policy();
        for (index, statement) in self.statements.iter().enumerate() {
            if !statement.has_principal() {
                result.error(format!(
                    "Statement #{} in a resource-based policy must specify at least one principal",
                    index
                ));
            }
        }
        result
    }

    /// Identity policies must name resources and must not name principals.
    pub fn validate_for_identity_policy(&self) -> PolicyValidation {
        let mut result = self.validate_for_any_policy();
        for (index, statement) in self.statements.iter().enumerate() {
            if statement.has_principal() {
                result.error(format!(
                    "Statement #{} in an identity-based policy cannot specify any principals",
                    index
                ));
            }
            if !statement.has_resource() {
                result.error(format!(
                    "Statement #{} in an identity-based policy must specify at least one resource",
                    index
                ));
            }
        }
        result
    }
}

fn is_broad_action(action: &str) -> bool {
    action == "*" || action.ends_with(":*")
}
