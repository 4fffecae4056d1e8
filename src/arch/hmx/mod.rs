//! Matrix accelerator numeric engine.

pub mod commit;
pub mod convert;
pub mod engine;
pub mod geometry;
pub mod int128;
pub mod mac;
pub mod memory;
pub mod observer;
pub mod operand;
pub mod params;
pub mod regs;
pub mod state;
pub mod types;
pub mod walk;
pub mod weights;
pub mod xfp;

pub use engine::Accelerator;
pub use mac::MacSummary;
pub use memory::Memory;
pub use observer::{ConvertRecord, MacRecord, Observer, WeightRecord};
pub use operand::{ActOperand, CvtOperand, WgtOperand};
pub use params::AcceleratorParams;
pub use regs::{BiasReg, CvtRs};
pub use state::AcceleratorState;
pub use types::{AccKind, ActBlock, CvtDirection, ElementType, Format, MultiplyKind, Unpack, WgtBlock};
