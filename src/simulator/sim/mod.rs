pub mod mode;
pub mod scenario;
pub mod shell;
pub mod trace;

pub use mode::{SimConfig, StepMode};
pub use scenario::Scenario;
pub use trace::JsonTrace;
