pub mod config;
pub mod error;
pub mod executor;
pub mod lock;
pub mod paths;
pub mod presets;
pub mod report;
pub mod runtime;
pub mod server;
pub mod status;
pub mod types;
