//! The execution worker: sandbox directories, the language runtime,
//! on-demand dependencies and generated-file detection.

pub mod deps;
pub mod process;
pub mod runtime;
pub mod snapshot;
mod worker;

pub use deps::{DependencyResolver, PackageInstaller, PackageMap, Resolution, scan_imports};
pub use process::{BoundedProcess, ProcessOptions, ProcessOutput};
pub use runtime::{
    PythonLoader, PythonRuntime, RaisedError, Runtime, RuntimeLoader, RuntimeOutcome,
    SandboxLayout,
};
pub use snapshot::{DirectorySnapshot, collect_generated, mime_for_name};
pub use worker::{ExecutionWorker, WorkerError};
