//! Task extensions: the task contract and the registry resolving task types.
//!
//! - [`Task`] / [`TaskFactory`]: what an extension implements
//! - [`ExtensionRegistry`]: task type name -> factory, loaded lazily from a
//!   declarative [`ExtensionManifest`]
//! - [`shell`]: the built-in `shell` task type

pub mod registry;
pub mod shell;
pub mod task;

pub use registry::{ExtensionManifest, ExtensionRegistry};
pub use task::{Task, TaskError, TaskFactory, TaskHeader, TaskSpec};
