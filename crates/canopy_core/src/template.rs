//! Template documents and the cloud assembly handed to a sink.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::app::Diagnostic;
use crate::error::CoreResult;
use crate::stack::Environment;

/// Template format version written into every document.
pub const TEMPLATE_FORMAT_VERSION: &str = "2010-09-09";

/// Version of the assembly manifest layout.
pub const ASSEMBLY_VERSION: &str = "1.0.0";

/// Name of the assembly manifest file.
pub const MANIFEST_FILE: &str = "manifest.json";

fn map_is_empty(map: &Map<String, Value>) -> bool {
    map.is_empty()
}

/// A resource as rendered into a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedResource {
    #[serde(rename = "Type")]
    pub resource_type: String,
    #[serde(rename = "Properties", default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
    #[serde(rename = "Metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(rename = "DependsOn", default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(rename = "DeletionPolicy", default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
    #[serde(rename = "UpdateReplacePolicy", default, skip_serializing_if = "Option::is_none")]
    pub update_replace_policy: Option<String>,
    #[serde(rename = "Condition", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl RenderedResource {
    /// Property by rendered (PascalCase) name.
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.as_ref().and_then(|p| p.get(key))
    }
}

/// One stack's template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateDocument {
    #[serde(rename = "AWSTemplateFormatVersion")]
    pub format_version: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Transform", default, skip_serializing_if = "Vec::is_empty")]
    pub transform: Vec<String>,
    #[serde(rename = "Metadata", default, skip_serializing_if = "map_is_empty")]
    pub metadata: Map<String, Value>,
    #[serde(rename = "Parameters", default, skip_serializing_if = "IndexMap::is_empty")]
    pub parameters: IndexMap<String, Value>,
    #[serde(rename = "Mappings", default, skip_serializing_if = "map_is_empty")]
    pub mappings: Map<String, Value>,
    #[serde(rename = "Conditions", default, skip_serializing_if = "map_is_empty")]
    pub conditions: Map<String, Value>,
    #[serde(rename = "Rules", default, skip_serializing_if = "map_is_empty")]
    pub rules: Map<String, Value>,
    #[serde(rename = "Resources", default)]
    pub resources: IndexMap<String, RenderedResource>,
    #[serde(rename = "Outputs", default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, Value>,
}

impl Default for TemplateDocument {
    fn default() -> Self {
        Self {
            format_version: TEMPLATE_FORMAT_VERSION.to_string(),
            description: None,
            transform: Vec::new(),
            metadata: Map::new(),
            parameters: IndexMap::new(),
            mappings: Map::new(),
            conditions: Map::new(),
            rules: Map::new(),
            resources: IndexMap::new(),
            outputs: IndexMap::new(),
        }
    }
}

impl TemplateDocument {
    pub fn resource(&self, logical_id: &str) -> Option<&RenderedResource> {
        self.resources.get(logical_id)
    }

    /// Resources of a given type, in template order.
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a RenderedResource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    pub fn to_json(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Pretty JSON with a trailing newline; byte-stable for equal documents.
    pub fn to_json_string(&self) -> CoreResult<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }
}

/// Manifest entry for one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackArtifact {
    pub stack_name: String,
    pub path: String,
    pub environment: Environment,
    pub template_file: String,
    #[serde(default)]
    pub termination_protection: bool,
    /// Names of stacks that must deploy first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub exports: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested_parent: Option<String>,
}

/// `manifest.json` content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssemblyManifest {
    pub version: String,
    pub artifacts: Vec<StackArtifact>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// Output of synthesis: one template per stack plus the manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudAssembly {
    pub manifest: AssemblyManifest,
    pub templates: IndexMap<String, TemplateDocument>,
}

impl CloudAssembly {
    pub fn template(&self, stack_name: &str) -> Option<&TemplateDocument> {
        self.templates.get(stack_name)
    }

    pub fn artifact(&self, stack_name: &str) -> Option<&StackArtifact> {
        self.manifest
            .artifacts
            .iter()
            .find(|a| a.stack_name == stack_name)
    }

    pub fn stack_names(&self) -> Vec<&str> {
        self.templates.keys().map(String::as_str).collect()
    }
}
