mod check;
mod run;
mod serve;

pub use check::{CheckArgs, run_check};
pub use run::{RunArgs, run_run};
pub use serve::{ServeArgs, run_serve};
