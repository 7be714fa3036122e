use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::extensions::shell::{ShellTaskFactory, SHELL_LOADER, SHELL_TASK_TYPE};
use crate::extensions::task::{Task, TaskError, TaskFactory, TaskSpec};

/// Declarative extension manifest: extension name -> the task types it provides.
///
/// ```json
/// { "builtin": { "tasks": [ { "name": "shell", "loader": "builtin:shell" } ] } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionManifest {
    pub extensions: BTreeMap<String, ExtensionEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionEntry {
    #[serde(default)]
    pub tasks: Vec<TaskEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    /// Task type name as sent by the manager
    pub name: String,
    /// Id of the compiled-in loader that decodes this task type
    pub loader: String,
}

impl ExtensionManifest {
    /// Manifest declaring only the built-in task types.
    pub fn builtin() -> Self {
        Self::default().with_task("builtin", SHELL_TASK_TYPE, SHELL_LOADER)
    }

    pub fn from_json(json: &str) -> Result<Self, TaskError> {
        serde_json::from_str(json)
            .map_err(|e| TaskError::Extension(format!("invalid extension manifest: {}", e)))
    }

    pub fn with_task(
        mut self,
        extension: impl Into<String>,
        name: impl Into<String>,
        loader: impl Into<String>,
    ) -> Self {
        self.extensions
            .entry(extension.into())
            .or_default()
            .tasks
            .push(TaskEntry {
                name: name.into(),
                loader: loader.into(),
            });
        self
    }
}

#[derive(Debug, Clone)]
enum ManifestSource {
    File(PathBuf),
    Inline(ExtensionManifest),
}

type FactoryMap = HashMap<String, Arc<dyn TaskFactory>>;

/// Maps task type names to the factories that decode them.
///
/// Built once and shared by reference. The manifest is resolved lazily on the
/// first lookup, exactly once; a failed resolution is reported to the caller
/// and attempted again on the next lookup.
pub struct ExtensionRegistry {
    source: ManifestSource,
    loaders: FactoryMap,
    tasks: OnceCell<FactoryMap>,
}

impl ExtensionRegistry {
    pub fn builder() -> ExtensionRegistryBuilder {
        ExtensionRegistryBuilder::default()
    }

    /// Registry with the built-in loaders and the built-in manifest.
    pub fn builtin() -> Self {
        Self::builder().with_builtin_loaders().build()
    }

    /// Find the factory for `task_type`.
    pub async fn lookup(&self, task_type: &str) -> Result<Option<Arc<dyn TaskFactory>>, TaskError> {
        Ok(self.load().await?.get(task_type).cloned())
    }

    /// Decode a delivered task through its type's factory.
    ///
    /// A panicking factory is contained and reported as a decode failure.
    pub async fn decode(&self, spec: TaskSpec) -> Result<Box<dyn Task>, TaskError> {
        let factory = self
            .lookup(&spec.task_type)
            .await?
            .ok_or_else(|| TaskError::UnknownTaskType(spec.task_type.clone()))?;

        let task_type = spec.task_type.clone();
        catch_unwind(AssertUnwindSafe(|| factory.decode(spec))).unwrap_or_else(|panic| {
            Err(TaskError::decode(
                &task_type,
                format!("decoder panicked: {}", panic_message(panic.as_ref())),
            ))
        })
    }

    /// All known task types, sorted.
    pub async fn task_types(&self) -> Result<Vec<String>, TaskError> {
        let mut types: Vec<String> = self.load().await?.keys().cloned().collect();
        types.sort();
        Ok(types)
    }

    async fn load(&self) -> Result<&FactoryMap, TaskError> {
        self.tasks.get_or_try_init(|| self.resolve()).await
    }

    async fn resolve(&self) -> Result<FactoryMap, TaskError> {
        let manifest = match &self.source {
            ManifestSource::Inline(manifest) => manifest.clone(),
            ManifestSource::File(path) => {
                tracing::trace!(path = %path.display(), "Loading extension manifest");
                let json = tokio::fs::read_to_string(path).await.map_err(|e| {
                    TaskError::Extension(format!(
                        "failed to read extension manifest {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                ExtensionManifest::from_json(&json)?
            }
        };

        let mut tasks = FactoryMap::new();
        for (extension, entry) in &manifest.extensions {
            tracing::trace!(extension = %extension, "Loading task types from extension");
            for task in &entry.tasks {
                let factory = self.loaders.get(&task.loader).ok_or_else(|| {
                    TaskError::Extension(format!(
                        "loader {} for task type {} (extension {}) is not registered",
                        task.loader, task.name, extension
                    ))
                })?;
                tasks.insert(task.name.clone(), factory.clone());
            }
        }

        tracing::debug!(task_types = ?tasks.keys().collect::<Vec<_>>(), "Extensions loaded");
        Ok(tasks)
    }
}

#[derive(Default)]
pub struct ExtensionRegistryBuilder {
    source: Option<ManifestSource>,
    loaders: FactoryMap,
}

impl ExtensionRegistryBuilder {
    /// Register a compiled-in loader under `id`.
    pub fn loader(mut self, id: impl Into<String>, factory: Arc<dyn TaskFactory>) -> Self {
        self.loaders.insert(id.into(), factory);
        self
    }

    pub fn with_builtin_loaders(self) -> Self {
        self.loader(SHELL_LOADER, Arc::new(ShellTaskFactory))
    }

    pub fn manifest(mut self, manifest: ExtensionManifest) -> Self {
        self.source = Some(ManifestSource::Inline(manifest));
        self
    }

    pub fn manifest_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(ManifestSource::File(path.into()));
        self
    }

    /// Without an explicit manifest the built-in one is used.
    pub fn build(self) -> ExtensionRegistry {
        ExtensionRegistry {
            source: self
                .source
                .unwrap_or_else(|| ManifestSource::Inline(ExtensionManifest::builtin())),
            loaders: self.loaders,
            tasks: OnceCell::new(),
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
