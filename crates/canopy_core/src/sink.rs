//! Template sinks: where a synthesized cloud assembly goes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::info;

use crate::error::CoreResult;
use crate::template::{CloudAssembly, MANIFEST_FILE};

/// Receives a cloud assembly after synthesis.
#[async_trait]
pub trait TemplateSink: Send + Sync {
    /// Emit every template and the manifest; returns the files written.
    async fn emit(&self, assembly: &CloudAssembly) -> CoreResult<Vec<PathBuf>>;
}

/// Writes `<stack>.template.json` files and `manifest.json` to a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    output_dir: PathBuf,
}

impl DirectorySink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

#[async_trait]
impl TemplateSink for DirectorySink {
    async fn emit(&self, assembly: &CloudAssembly) -> CoreResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.output_dir).await?;

        let mut written = Vec::new();
        for artifact in &assembly.manifest.artifacts {
            let Some(template) = assembly.template(&artifact.stack_name) else {
                continue;
            };
            let path = self.output_dir.join(&artifact.template_file);
            fs::write(&path, template.to_json_string()?).await?;
            written.push(path);
        }

        let mut manifest = serde_json::to_string_pretty(&assembly.manifest)?;
        manifest.push('\n');
        let manifest_path = self.output_dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, manifest).await?;
        written.push(manifest_path);

        info!(
            "Wrote {} file(s) to {}",
            written.len(),
            self.output_dir.display()
        );
        Ok(written)
    }
}
