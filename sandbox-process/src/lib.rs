mod capture;
mod cgroup;
mod command;
mod config;
mod factory;
mod launcher;
mod live;
mod mask;
mod paths;
mod prerequisites;
mod process;
mod sandbox;

pub use config::{DEFAULT_BLOCKED_BINARIES, Identity, LauncherKind, NOBODY, ProcessConfig};
pub use factory::ProcessFactory;
pub use paths::{FactoryPaths, InstancePaths, SANDBOX_BIN_DIR};
pub use prerequisites::check_prerequisites;
pub use sandbox::ProcessSandbox;
