//! Tokens: placeholders for values only known at synthesis time.
//!
//! A token is encoded as a string of the form `${Token[<hint>.<n>]}` so it can
//! travel through any property bag, policy statement or arn template. The
//! registry owns the token table; [`crate::resolve::Resolver`] turns encoded
//! strings back into template values.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::app::App;
use crate::construct::ConstructId;
use crate::error::CoreResult;
use crate::resolve::ResolveContext;

/// Handle to a registered token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub(crate) usize);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token {}", self.0)
    }
}

/// A closure producing a value when the token is resolved.
pub type LazyFn = Rc<dyn Fn(&ResolveContext<'_>) -> CoreResult<Value>>;

/// What a token stands for.
#[derive(Clone)]
pub enum TokenKind {
    /// `{"Ref": <logical id>}` of a resource.
    Ref { resource: ConstructId },
    /// `{"Fn::GetAtt": [<logical id>, <attribute>]}` of a resource.
    GetAtt {
        resource: ConstructId,
        attribute: String,
    },
    /// A literal template value, rendered as-is after resolving nested tokens.
    Intrinsic(Value),
    /// `{"Ref": <name>}` of a stack parameter.
    Parameter { stack: ConstructId, name: String },
    /// A value computed on demand.
    Lazy(LazyFn),
}

impl fmt::Debug for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ref { resource } => write!(f, "Ref({})", resource),
            TokenKind::GetAtt {
                resource,
                attribute,
            } => write!(f, "GetAtt({}, {})", resource, attribute),
            TokenKind::Intrinsic(value) => write!(f, "Intrinsic({})", value),
            TokenKind::Parameter { stack, name } => write!(f, "Parameter({}, {})", stack, name),
            TokenKind::Lazy(_) => f.write_str("Lazy"),
        }
    }
}

/// A registered token.
#[derive(Debug, Clone)]
pub struct Token {
    pub id: TokenId,
    /// Construct whose stack produces the value, if it belongs to one.
    pub producer: Option<ConstructId>,
    pub hint: String,
    pub kind: TokenKind,
}

impl Token {
    /// Encoded form embedded in strings.
    pub fn encoded(&self) -> String {
        encode(&self.hint, self.id)
    }

    /// Whether resolving this token from another stack needs linking.
    pub fn is_reference(&self) -> bool {
        matches!(
            self.kind,
            TokenKind::Ref { .. } | TokenKind::GetAtt { .. } | TokenKind::Parameter { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum MemoKey {
    Ref(ConstructId),
    GetAtt(ConstructId, String),
    Parameter(ConstructId, String),
    Pseudo(String),
}

/// Table of every token created in an app.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: Vec<Token>,
    memo: HashMap<MemoKey, TokenId>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(id.0)
    }

    fn push(&mut self, producer: Option<ConstructId>, hint: &str, kind: TokenKind) -> TokenId {
        let id = TokenId(self.tokens.len());
        self.tokens.push(Token {
            id,
            producer,
            hint: sanitize_hint(hint),
            kind,
        });
        id
    }

    fn memoized(
        &mut self,
        key: MemoKey,
        producer: Option<ConstructId>,
        hint: &str,
        kind: TokenKind,
    ) -> TokenId {
        if let Some(id) = self.memo.get(&key) {
            return *id;
        }
        let id = self.push(producer, hint, kind);
        self.memo.insert(key, id);
        id
    }

    pub(crate) fn reference(&mut self, resource: ConstructId, hint: &str) -> TokenId {
        self.memoized(
            MemoKey::Ref(resource),
            Some(resource),
            hint,
            TokenKind::Ref { resource },
        )
    }

    pub(crate) fn attribute(&mut self, resource: ConstructId, attribute: &str, hint: &str) -> TokenId {
        self.memoized(
            MemoKey::GetAtt(resource, attribute.to_string()),
            Some(resource),
            hint,
            TokenKind::GetAtt {
                resource,
                attribute: attribute.to_string(),
            },
        )
    }

    pub(crate) fn parameter(&mut self, stack: ConstructId, name: &str) -> TokenId {
        self.memoized(
            MemoKey::Parameter(stack, name.to_string()),
            Some(stack),
            name,
            TokenKind::Parameter {
                stack,
                name: name.to_string(),
            },
        )
    }

    /// A pseudo parameter such as `AWS::AccountId`; shared by every stack.
    pub(crate) fn pseudo(&mut self, name: &str) -> TokenId {
        let value = serde_json::json!({ "Ref": name });
        self.memoized(
            MemoKey::Pseudo(name.to_string()),
            None,
            name,
            TokenKind::Intrinsic(value),
        )
    }

    pub(crate) fn intrinsic(&mut self, producer: Option<ConstructId>, hint: &str, value: Value) -> TokenId {
        self.push(producer, hint, TokenKind::Intrinsic(value))
    }

    pub(crate) fn lazy(&mut self, producer: Option<ConstructId>, hint: &str, f: LazyFn) -> TokenId {
        self.push(producer, hint, TokenKind::Lazy(f))
    }

    /// Encoded string for a registered token.
    pub fn encoded(&self, id: TokenId) -> String {
        match self.get(id) {
            Some(token) => token.encoded(),
            None => encode("Unknown", id),
        }
    }
}

fn sanitize_hint(hint: &str) -> String {
    let cleaned: String = hint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "Token".to_string()
    } else {
        cleaned
    }
}

fn encode(hint: &str, id: TokenId) -> String {
    format!("${{Token[{}.{}]}}", hint, id.0)
}

fn token_regex() -> &'static Regex {
    static TOKEN_RE: OnceLock<Regex> = OnceLock::new();
    TOKEN_RE.get_or_init(|| {
        Regex::new(r"\$\{Token\[[^\]]*\.(\d+)\]\}").expect("token pattern is valid")
    })
}

/// A piece of a string split around tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Literal(String),
    Token(TokenId),
}

/// Split a string into literal and token fragments.
pub fn split(s: &str) -> Vec<Fragment> {
    let mut fragments = Vec::new();
    let mut last = 0;
    for captures in token_regex().captures_iter(s) {
        let (Some(whole), Some(number)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let Ok(index) = number.as_str().parse::<usize>() else {
            continue;
        };
        if whole.start() > last {
            fragments.push(Fragment::Literal(s[last..whole.start()].to_string()));
        }
        fragments.push(Fragment::Token(TokenId(index)));
        last = whole.end();
    }
    if last < s.len() {
        fragments.push(Fragment::Literal(s[last..].to_string()));
    }
    fragments
}

/// Whether a string contains at least one token.
pub fn contains_token(s: &str) -> bool {
    token_regex().is_match(s)
}

/// Whether a string is exactly one token.
pub fn is_token(s: &str) -> bool {
    matches!(split(s).as_slice(), [Fragment::Token(_)])
}

/// Every token appearing anywhere in a value, in encounter order.
pub fn tokens_in(value: &Value) -> Vec<TokenId> {
    let mut out = Vec::new();
    collect_tokens(value, &mut out);
    out
}

fn collect_tokens(value: &Value, out: &mut Vec<TokenId>) {
    match value {
        Value::String(s) => {
            for fragment in split(s) {
                if let Fragment::Token(id) = fragment {
                    if !out.contains(&id) {
                        out.push(id);
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_tokens(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_tokens(item, out)),
        _ => {}
    }
}

impl App {
    pub fn token(&self, id: TokenId) -> Option<&Token> {
        self.tokens.get(id)
    }

    /// Register a token whose value is computed during synthesis.
    pub fn lazy<F>(&mut self, producer: Option<ConstructId>, hint: &str, f: F) -> String
    where
        F: Fn(&ResolveContext<'_>) -> CoreResult<Value> + 'static,
    {
        let id = self.tokens.lazy(producer, hint, Rc::new(f));
        self.tokens.encoded(id)
    }

    /// Register a token standing for a literal template value.
    pub fn intrinsic(&mut self, producer: Option<ConstructId>, hint: &str, value: Value) -> String {
        let id = self.tokens.intrinsic(producer, hint, value);
        self.tokens.encoded(id)
    }

    /// Token for a pseudo parameter such as `AWS::Region`.
    pub fn pseudo(&mut self, name: &str) -> String {
        let id = self.tokens.pseudo(name);
        self.tokens.encoded(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_mixed_string() {
        let mut registry = TokenRegistry::new();
        let id = registry.intrinsic(None, "Key.Arn", Value::Null);
        let encoded = registry.encoded(id);
        let s = format!("arn:{}:suffix", encoded);

        assert_eq!(
            split(&s),
            vec![
                Fragment::Literal("arn:".to_string()),
                Fragment::Token(id),
                Fragment::Literal(":suffix".to_string()),
            ]
        );
        assert!(contains_token(&s));
        assert!(!is_token(&s));
        assert!(is_token(&encoded));
    }

    #[test]
    fn test_hint_with_dots_parses_last_number() {
        let mut registry = TokenRegistry::new();
        registry.intrinsic(None, "a", Value::Null);
        let id = registry.intrinsic(None, "Stack.Key.Arn", Value::Null);
        assert_eq!(split(&registry.encoded(id)), vec![Fragment::Token(id)]);
    }

    #[test]
    fn test_reference_tokens_are_memoized() {
        let mut registry = TokenRegistry::new();
        let a = registry.reference(ConstructId(3), "Key");
        let b = registry.reference(ConstructId(3), "Key");
        let c = registry.attribute(ConstructId(3), "Arn", "Key.Arn");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_hint_is_sanitized() {
        let mut registry = TokenRegistry::new();
        let id = registry.intrinsic(None, "bad]hint}", Value::Null);
        assert_eq!(registry.encoded(id), "${Token[bad_hint_.0]}");
    }

    #[test]
    fn test_tokens_in_nested_value() {
        let mut registry = TokenRegistry::new();
        let a = registry.intrinsic(None, "A", Value::Null);
        let b = registry.intrinsic(None, "B", Value::Null);
        let value = serde_json::json!({
            "x": [registry.encoded(a), {"y": registry.encoded(b)}],
            "z": registry.encoded(a),
        });
        let found = tokens_in(&value);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&a) && found.contains(&b));
    }
}
