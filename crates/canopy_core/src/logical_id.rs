//! Logical ids: stable template identifiers derived from construct paths.

use sha2::{Digest, Sha256};

use crate::app::App;
use crate::construct::ConstructId;
use crate::error::{CoreError, CoreResult};

/// Provider limit on logical id length.
pub const MAX_LOGICAL_ID_LENGTH: usize = 255;

const HASH_LENGTH: usize = 8;
const HIDDEN_SEGMENTS: &[&str] = &["Resource", "Default"];

/// Logical id for a stack-relative path such as `Group/Key/Resource`.
pub fn make_logical_id(relative_path: &[&str]) -> String {
    let human = relative_path
        .iter()
        .rev()
        .find(|segment| !HIDDEN_SEGMENTS.contains(segment))
        .or_else(|| relative_path.last())
        .map(|segment| sanitize(segment))
        .unwrap_or_default();

    let digest = Sha256::digest(relative_path.join("/").as_bytes());
    let hash = hex::encode_upper(digest);
    let hash = &hash[..HASH_LENGTH];

    let max_human = MAX_LOGICAL_ID_LENGTH - HASH_LENGTH;
    let human: String = human.chars().take(max_human).collect();
    format!("{}{}", human, hash)
}

fn sanitize(segment: &str) -> String {
    segment.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Check a user-supplied logical id.
pub fn validate_logical_id(id: &str) -> Result<(), String> {
    if id.is_empty() || id.len() > MAX_LOGICAL_ID_LENGTH {
        return Err(format!(
            "logical id '{}' must be 1 to {} characters",
            id, MAX_LOGICAL_ID_LENGTH
        ));
    }
    let mut chars = id.chars();
    let starts_with_letter = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    if !starts_with_letter || !id.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!(
            "logical id '{}' must start with a letter and be alphanumeric",
            id
        ));
    }
    Ok(())
}

impl App {
    /// Logical id of a resource in its stack's template.
    pub fn logical_id(&self, resource: ConstructId) -> String {
        if let Some(id) = self
            .resource(resource)
            .and_then(|r| r.logical_id_override.clone())
        {
            return id;
        }
        let stack = self.stack_of(resource).unwrap_or(self.root());
        let segments: Vec<&str> = self
            .ancestors(resource)
            .into_iter()
            .take_while(|a| *a != stack)
            .map(|a| self.node(a).id())
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        make_logical_id(&segments)
    }

    /// Replace the derived logical id of a resource.
    pub fn override_logical_id(&mut self, resource: ConstructId, id: &str) -> CoreResult<()> {
        validate_logical_id(id).map_err(|msg| CoreError::invalid(self.path(resource), msg))?;
        self.resource_mut(resource)?.logical_id_override = Some(id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceNode;
    use crate::stack::StackProps;

    #[test]
    fn test_hidden_segments_are_skipped() {
        let id = make_logical_id(&["Key", "Resource"]);
        assert!(id.starts_with("Key"));
        assert_eq!(id.len(), 3 + 8);
        assert!(id[3..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_hash_depends_on_full_path() {
        let a = make_logical_id(&["GroupA", "Key"]);
        let b = make_logical_id(&["GroupB", "Key"]);
        assert_ne!(a, b);
        assert_eq!(a, make_logical_id(&["GroupA", "Key"]));
    }

    #[test]
    fn test_non_alphanumerics_removed_and_length_capped() {
        let long = "x".repeat(400);
        let id = make_logical_id(&["my-key.v2", &long]);
        assert_eq!(id.len(), MAX_LOGICAL_ID_LENGTH);
        let id = make_logical_id(&["my-key.v2"]);
        assert!(id.starts_with("mykeyv2"));
    }

    #[test]
    fn test_logical_id_is_stack_relative() {
        let mut app = App::new();
        let root = app.root();
        let a = app.add_stack(root, "A", StackProps::default()).unwrap();
        let b = app.add_stack(root, "B", StackProps::default()).unwrap();
        let ka = app.add_resource(a, "Key", ResourceNode::new("AWS::KMS::Key")).unwrap();
        let kb = app.add_resource(b, "Key", ResourceNode::new("AWS::KMS::Key")).unwrap();
        assert_eq!(app.logical_id(ka), app.logical_id(kb));
        assert_eq!(app.logical_id(ka), make_logical_id(&["Key"]));
    }

    #[test]
    fn test_override_is_validated() {
        let mut app = App::new();
        let root = app.root();
        let stack = app.add_stack(root, "S", StackProps::default()).unwrap();
        let key = app.add_resource(stack, "Key", ResourceNode::new("AWS::KMS::Key")).unwrap();
        assert!(app.override_logical_id(key, "1bad").is_err());
        app.override_logical_id(key, "MyKey").unwrap();
        assert_eq!(app.logical_id(key), "MyKey");
    }
}
