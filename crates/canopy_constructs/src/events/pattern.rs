//! Event patterns.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Candidate lists matched against incoming events. Unset fields match
/// anything; an empty list matches nothing and is rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EventPattern {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail_type: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Map<String, Value>>,
}

fn strings<I, S>(values: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Some(values.into_iter().map(Into::into).collect())
}

fn union_list(target: &mut Option<Vec<String>>, other: &Option<Vec<String>>) {
    let Some(other) = other else {
        return;
    };
    let list = target.get_or_insert_with(Vec::new);
    for value in other {
        if !list.contains(value) {
            list.push(value.clone());
        }
    }
}

fn union_value(target: &mut Value, other: &Value) {
    match (target, other) {
        (Value::Object(ours), Value::Object(theirs)) => union_map(ours, theirs),
        (Value::Array(ours), Value::Array(theirs)) => {
            for item in theirs {
                if !ours.contains(item) {
                    ours.push(item.clone());
                }
            }
        }
        (target, other) => *target = other.clone(),
    }
}

fn union_map(target: &mut Map<String, Value>, other: &Map<String, Value>) {
    for (key, value) in other {
        match target.get_mut(key) {
            Some(existing) => union_value(existing, value),
            None => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

fn check_detail(path: &str, map: &Map<String, Value>, errors: &mut Vec<String>) {
    for (key, value) in map {
        let field = format!("{}.{}", path, key);
        match value {
            Value::Array(items) if items.is_empty() => {
                errors.push(format!("event pattern field '{}' must not be an empty list", field))
            }
            Value::Object(inner) => check_detail(&field, inner, errors),
            _ => {}
        }
    }
}

impl EventPattern {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.source = strings(sources);
        self
    }

    pub fn with_detail_type<I, S>(mut self, detail_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.detail_type = strings(detail_types);
        self
    }

    pub fn with_account<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.account = strings(accounts);
        self
    }

    pub fn with_region<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.region = strings(regions);
        self
    }

    pub fn with_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = strings(resources);
        self
    }

    /// Set the `detail` filter. Non-object values are ignored.
    pub fn with_detail(mut self, detail: Value) -> Self {
        if let Value::Object(map) = detail {
            self.detail = Some(map);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Union `other` into this pattern, keeping first-seen order.
    pub fn merge(&mut self, other: &EventPattern) {
        union_list(&mut self.account, &other.account);
        union_list(&mut self.region, &other.region);
        union_list(&mut self.source, &other.source);
        union_list(&mut self.detail_type, &other.detail_type);
        union_list(&mut self.resources, &other.resources);
        union_list(&mut self.id, &other.id);
        union_list(&mut self.time, &other.time);
        union_list(&mut self.version, &other.version);
        if let Some(detail) = &other.detail {
            union_map(self.detail.get_or_insert_with(Map::new), detail);
        }
    }

    /// Problems with this pattern; empty when it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let fields = [
            ("account", &self.account),
            ("region", &self.region),
            ("source", &self.source),
            ("detail-type", &self.detail_type),
            ("resources", &self.resources),
            ("id", &self.id),
            ("time", &self.time),
            ("version", &self.version),
        ];
        for (name, list) in fields {
            if list.as_ref().is_some_and(Vec::is_empty) {
                errors.push(format!("event pattern field '{}' must not be an empty list", name));
            }
        }
        if let Some(detail) = &self.detail {
            check_detail("detail", detail, &mut errors);
        }
        errors
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}
