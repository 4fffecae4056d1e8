pub mod arch;
pub mod simulator;

pub use arch::hmx::{Accelerator, AcceleratorParams, AcceleratorState, Memory};
pub use simulator::utils::log;
