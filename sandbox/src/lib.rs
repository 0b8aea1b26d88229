mod config;
mod error;
mod factory;
mod image;
mod policy;
mod sandbox;
mod types;

pub use config::SandboxConfig;
pub use error::{Result, SandboxError};
pub use factory::SandboxFactory;
pub use image::{
    CommandTemplate, HOST_IMAGE, ImageRegistry, ProgramRef, RegistryBuilder, SandboxImage,
    TemplateVars,
};
pub use policy::{
    DEFAULT_CPU_TIME_LIMIT_MS, DEFAULT_MAX_FILE_SIZE_BYTES, DEFAULT_MAX_OUTPUT_BYTES,
    DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_WALL_CLOCK_LIMIT_MS, DEFAULT_WORKDIR, ExecutionPolicy,
    MountSpec, PolicyConfig, load_policy,
};
pub use sandbox::Sandbox;
pub use types::{ExecRequest, ExitOutcome, ProcessExit};
