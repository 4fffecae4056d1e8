//! Telemetry hooks.
//!
//! Observers see copies of operands and results. They have no way back into
//! the engine, so attaching one never changes what the engine computes.

use serde::Serialize;

use super::types::{AccKind, ElementType};

/// One elementary multiply-accumulate
#[derive(Debug, Clone, Serialize)]
pub struct MacRecord {
  pub kind: AccKind,
  pub row: usize,
  pub col: usize,
  pub sel: usize,
  pub input_channel: u32,
  pub act: u16,
  pub wgt: u16,
  /// Fixed accumulator word after the update, or the float accumulator
  /// significand once a reduction has been applied
  pub result: i64,
}

/// One weight cache fill
#[derive(Debug, Clone, Serialize)]
pub struct WeightRecord {
  pub stream_idx: usize,
  pub channel: usize,
  pub value: u16,
  pub addr: u64,
}

/// One converted output element
#[derive(Debug, Clone, Serialize)]
pub struct ConvertRecord {
  pub element: ElementType,
  pub row: usize,
  pub col: usize,
  pub acc: i64,
  pub result: u32,
}

pub trait Observer {
  fn on_mac(&mut self, _record: &MacRecord) {}

  fn on_weight(&mut self, _record: &WeightRecord) {}

  fn on_convert(&mut self, _record: &ConvertRecord) {}
}

/// Optional observer attached to an accelerator
pub type ObserverSlot = Option<Box<dyn Observer>>;
