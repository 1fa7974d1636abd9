//! Tag manager: tags set on any construct apply to taggable resources below it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult};

/// Default priority of a tag addition.
pub const DEFAULT_SET_PRIORITY: u32 = 100;
/// Default priority of a tag removal.
pub const DEFAULT_REMOVE_PRIORITY: u32 = 200;

const MAX_KEY_LENGTH: usize = 128;
const MAX_VALUE_LENGTH: usize = 256;
const RESERVED_PREFIX: &str = "aws:";

/// Options for [`App::set_tag`] and [`App::remove_tag`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagOptions {
    pub priority: Option<u32>,
    /// Only these resource types receive the tag (all when empty).
    pub include_resource_types: Vec<String>,
    /// These resource types never receive the tag.
    pub exclude_resource_types: Vec<String>,
}

impl TagOptions {
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn include(mut self, resource_type: impl Into<String>) -> Self {
        self.include_resource_types.push(resource_type.into());
        self
    }

    pub fn exclude(mut self, resource_type: impl Into<String>) -> Self {
        self.exclude_resource_types.push(resource_type.into());
        self
    }

    /// Exclusion wins when a type is both included and excluded.
    pub fn applies_to(&self, resource_type: &str) -> bool {
        if self.exclude_resource_types.iter().any(|t| t == resource_type) {
            return false;
        }
        self.include_resource_types.is_empty()
            || self.include_resource_types.iter().any(|t| t == resource_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAction {
    Set(String),
    Remove,
}

/// A tag addition or removal recorded on a construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagEntry {
    pub key: String,
    pub action: TagAction,
    pub priority: u32,
    pub options: TagOptions,
    pub(crate) sequence: u64,
}

fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("tag key cannot be empty".to_string());
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(format!("tag key '{}' exceeds {} characters", key, MAX_KEY_LENGTH));
    }
    if key.to_ascii_lowercase().starts_with(RESERVED_PREFIX) {
        return Err(format!("tag key '{}' uses the reserved prefix '{}'", key, RESERVED_PREFIX));
    }
    Ok(())
}

impl App {
    /// Apply a tag to every taggable resource at or below `scope`.
    pub fn set_tag(
        &mut self,
        scope: ConstructId,
        key: &str,
        value: &str,
        options: TagOptions,
    ) -> CoreResult<()> {
        validate_key(key).map_err(|msg| CoreError::invalid(self.path(scope), msg))?;
        if value.len() > MAX_VALUE_LENGTH {
            return Err(CoreError::invalid(
                self.path(scope),
                format!("value of tag '{}' exceeds {} characters", key, MAX_VALUE_LENGTH),
            ));
        }
        let priority = options.priority.unwrap_or(DEFAULT_SET_PRIORITY);
        self.push_tag(scope, key, TagAction::Set(value.to_string()), priority, options)
    }

    /// Remove a tag from every taggable resource at or below `scope`.
    pub fn remove_tag(&mut self, scope: ConstructId, key: &str, options: TagOptions) -> CoreResult<()> {
        validate_key(key).map_err(|msg| CoreError::invalid(self.path(scope), msg))?;
        let priority = options.priority.unwrap_or(DEFAULT_REMOVE_PRIORITY);
        self.push_tag(scope, key, TagAction::Remove, priority, options)
    }

    fn push_tag(
        &mut self,
        scope: ConstructId,
        key: &str,
        action: TagAction,
        priority: u32,
        options: TagOptions,
    ) -> CoreResult<()> {
        self.ensure_mutable(scope, "change tags")?;
        self.tag_sequence += 1;
        let sequence = self.tag_sequence;
        self.node_mut(scope).tags.push(TagEntry {
            key: key.to_string(),
            action,
            priority,
            options,
            sequence,
        });
        Ok(())
    }

    /// Effective tags of a resource. Empty for non-taggable resources.
    ///
    /// For each key the winning entry has the highest priority; ties go to
    /// the entry closest to the resource, then to the latest entry.
    pub fn tags_for(&self, resource: ConstructId) -> BTreeMap<String, String> {
        let Some(node) = self.resource(resource) else {
            return BTreeMap::new();
        };
        if !node.is_taggable() {
            return BTreeMap::new();
        }

        let chain = self.ancestors(resource);
        let mut winners: BTreeMap<&str, ((u32, usize, u64), &TagEntry)> = BTreeMap::new();
        for (distance, ancestor) in chain.iter().enumerate() {
            let depth = chain.len() - distance;
            for entry in &self.node(*ancestor).tags {
                if !entry.options.applies_to(node.resource_type()) {
                    continue;
                }
                let rank = (entry.priority, depth, entry.sequence);
                let replace = match winners.get(entry.key.as_str()) {
                    Some((current, _)) => rank > *current,
                    None => true,
                };
                if replace {
                    winners.insert(entry.key.as_str(), (rank, entry));
                }
            }
        }

        winners
            .into_iter()
            .filter_map(|(key, (_, entry))| match &entry.action {
                TagAction::Set(value) => Some((key.to_string(), value.clone())),
                TagAction::Remove => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceNode, TagFormat};
    use crate::stack::StackProps;

    fn tagged_app() -> (App, ConstructId, ConstructId, ConstructId) {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "Stack", StackProps::default()).unwrap();
        let group = app.add_construct(stack, "Group").unwrap();
        let queue = app
            .add_resource(
                group,
                "Queue",
                ResourceNode::new("AWS::SQS::Queue").taggable(TagFormat::Standard),
            )
            .unwrap();
        (app, stack, group, queue)
    }

    #[test]
    fn test_closer_ancestor_wins_on_equal_priority() {
        let (mut app, stack, group, queue) = tagged_app();
        app.set_tag(stack, "team", "platform", TagOptions::default()).unwrap();
        app.set_tag(group, "team", "orders", TagOptions::default()).unwrap();
        assert_eq!(app.tags_for(queue)["team"], "orders");
    }

    #[test]
    fn test_higher_priority_wins_over_closer() {
        let (mut app, stack, group, queue) = tagged_app();
        app.set_tag(stack, "team", "platform", TagOptions::default().with_priority(300))
            .unwrap();
        app.set_tag(group, "team", "orders", TagOptions::default()).unwrap();
        assert_eq!(app.tags_for(queue)["team"], "platform");
    }

    #[test]
    fn test_later_entry_on_same_node_wins() {
        let (mut app, _, group, queue) = tagged_app();
        app.set_tag(group, "env", "dev", TagOptions::default()).unwrap();
        app.set_tag(group, "env", "prod", TagOptions::default()).unwrap();
        assert_eq!(app.tags_for(queue)["env"], "prod");
    }

    #[test]
    fn test_removal_beats_default_addition() {
        let (mut app, stack, group, queue) = tagged_app();
        app.set_tag(group, "cost", "a", TagOptions::default()).unwrap();
        app.remove_tag(stack, "cost", TagOptions::default()).unwrap();
        assert!(!app.tags_for(queue).contains_key("cost"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let options = TagOptions::default()
            .include("AWS::SQS::Queue")
            .exclude("AWS::SQS::Queue");
        assert!(!options.applies_to("AWS::SQS::Queue"));

        let (mut app, stack, _, queue) = tagged_app();
        app.set_tag(stack, "x", "y", options).unwrap();
        assert!(app.tags_for(queue).is_empty());
    }

    #[test]
    fn test_include_filter_limits_types() {
        let (mut app, stack, _, queue) = tagged_app();
        app.set_tag(stack, "x", "y", TagOptions::default().include("AWS::KMS::Key"))
            .unwrap();
        assert!(app.tags_for(queue).is_empty());
    }

    #[test]
    fn test_reserved_prefix_rejected() {
        let (mut app, stack, _, _) = tagged_app();
        assert!(app
            .set_tag(stack, "aws:cloudformation:stack", "x", TagOptions::default())
            .is_err());
    }
}
