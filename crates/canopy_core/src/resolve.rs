//! Token resolution.
//!
//! A [`Resolver`] is bound to one consuming stack. It substitutes every
//! encoded token in a value, memoizing per token, and reports cycles. In
//! discovery mode it never fails on an unlinked cross-stack reference; it
//! records the (token, consumer) pair for the linker instead.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};

use serde_json::{json, Value};

use crate::app::App;
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult};
use crate::token::{split, Fragment, TokenId, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Produce final template values; unlinked references are errors.
    Render,
    /// Collect unlinked cross-stack references.
    Discover,
}

/// What a lazy token sees while it is being resolved.
pub struct ResolveContext<'r> {
    pub app: &'r App,
    /// The stack whose template is being rendered.
    pub stack: ConstructId,
    resolver: &'r Resolver<'r>,
}

impl ResolveContext<'_> {
    /// Resolve a value in the same consuming stack.
    pub fn resolve(&self, value: &Value) -> CoreResult<Value> {
        self.resolver.resolve(value)
    }
}

pub struct Resolver<'a> {
    app: &'a App,
    stack: ConstructId,
    mode: ResolveMode,
    memo: RefCell<HashMap<TokenId, Value>>,
    in_progress: RefCell<Vec<TokenId>>,
    discovered: RefCell<BTreeSet<(TokenId, ConstructId)>>,
}

impl<'a> Resolver<'a> {
    pub fn new(app: &'a App, stack: ConstructId, mode: ResolveMode) -> Self {
        Self {
            app,
            stack,
            mode,
            memo: RefCell::new(HashMap::new()),
            in_progress: RefCell::new(Vec::new()),
            discovered: RefCell::new(BTreeSet::new()),
        }
    }

    pub fn stack(&self) -> ConstructId {
        self.stack
    }

    pub fn mode(&self) -> ResolveMode {
        self.mode
    }

    /// Unlinked references found so far.
    pub fn into_discovered(self) -> BTreeSet<(TokenId, ConstructId)> {
        self.discovered.into_inner()
    }

    /// Substitute every token in `value`.
    pub fn resolve(&self, value: &Value) -> CoreResult<Value> {
        match value {
            Value::String(s) => self.resolve_string(s),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<CoreResult<Vec<_>>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.resolve(item)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    fn resolve_string(&self, s: &str) -> CoreResult<Value> {
        let fragments = split(s);
        match fragments.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Fragment::Literal(text)] => Ok(Value::String(text.clone())),
            [Fragment::Token(id)] => self.resolve_token(*id),
            _ => {
                let mut parts: Vec<Value> = Vec::new();
                for fragment in fragments {
                    let resolved = match fragment {
                        Fragment::Literal(text) => Value::String(text),
                        Fragment::Token(id) => self.resolve_token(id)?,
                    };
                    match (parts.last_mut(), resolved) {
                        (Some(Value::String(prev)), Value::String(next)) => prev.push_str(&next),
                        (_, next) => parts.push(next),
                    }
                }
                if let [Value::String(single)] = parts.as_slice() {
                    return Ok(Value::String(single.clone()));
                }
                Ok(json!({ "Fn::Join": ["", parts] }))
            }
        }
    }

    fn resolve_token(&self, id: TokenId) -> CoreResult<Value> {
        if let Some(value) = self.memo.borrow().get(&id) {
            return Ok(value.clone());
        }

        if self.in_progress.borrow().contains(&id) {
            let path = self
                .app
                .token(id)
                .and_then(|t| t.producer)
                .map(|p| self.app.path(p))
                .unwrap_or_default();
            let chain: Vec<String> = self
                .in_progress
                .borrow()
                .iter()
                .map(|t| self.app.tokens.encoded(*t))
                .collect();
            return Err(CoreError::CyclicReference {
                path,
                message: format!(
                    "token {} depends on itself ({})",
                    self.app.tokens.encoded(id),
                    chain.join(" -> ")
                ),
            });
        }

        self.in_progress.borrow_mut().push(id);
        let result = self.compute(id);
        self.in_progress.borrow_mut().pop();

        let value = result?;
        if self.mode == ResolveMode::Render {
            self.memo.borrow_mut().insert(id, value.clone());
        }
        Ok(value)
    }

    fn compute(&self, id: TokenId) -> CoreResult<Value> {
        let token = self
            .app
            .token(id)
            .ok_or_else(|| CoreError::invalid("", format!("unknown {}", id)))?;

        match &token.kind {
            TokenKind::Intrinsic(value) => self.resolve(value),
            TokenKind::Lazy(f) => {
                let ctx = ResolveContext {
                    app: self.app,
                    stack: self.stack,
                    resolver: self,
                };
                let value = f(&ctx)?;
                self.resolve(&value)
            }
            TokenKind::Ref { resource } | TokenKind::GetAtt { resource, .. } => {
                let producer_stack = self.app.stack_of(*resource)?;
                if producer_stack == self.stack {
                    let logical_id = self.app.logical_id(*resource);
                    return Ok(match &token.kind {
                        TokenKind::GetAtt { attribute, .. } => {
                            json!({ "Fn::GetAtt": [logical_id, attribute] })
                        }
                        _ => json!({ "Ref": logical_id }),
                    });
                }
                self.resolve_remote(id, *resource)
            }
            TokenKind::Parameter { stack, name } => {
                if *stack == self.stack {
                    return Ok(json!({ "Ref": name }));
                }
                self.resolve_remote(id, *stack)
            }
        }
    }

    fn resolve_remote(&self, id: TokenId, producer: ConstructId) -> CoreResult<Value> {
        if let Some(replacement) = self.app.references.get(id, self.stack) {
            return self.resolve(&Value::String(replacement.to_string()));
        }
        match self.mode {
            ResolveMode::Discover => {
                self.discovered.borrow_mut().insert((id, self.stack));
                Ok(Value::Null)
            }
            ResolveMode::Render => Err(CoreError::invalid(
                self.app.path(producer),
                format!(
                    "reference {} used in stack '{}' was never linked",
                    self.app.tokens.encoded(id),
                    self.app.path(self.stack)
                ),
            )),
        }
    }
}
