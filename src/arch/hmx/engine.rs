use std::io;

use log::{debug, info};

use super::commit::{commit_mem, commit_regs, rewind};
use super::convert::run_convert;
use super::mac::{run_mac, MacSummary};
use super::memory::Memory;
use super::observer::{Observer, ObserverSlot};
use super::operand::{ActOperand, CvtOperand, WgtOperand};
use super::params::{AcceleratorParams, COLS};
use super::regs::{BiasReg, CommitFlags};
use super::state::{AcceleratorState, FixedCell, FloatCell};
use super::types::AccKind;
use super::xfp::XfpUnit;

/// Offset of the second bias word block in memory
const BIAS_WORD1_OFFSET: u64 = 128;

/// One accelerator unit: parameters, state and an optional observer.
///
/// Every operation only stages work. Nothing becomes architecturally
/// visible until `commit`, and `rewind` drops whatever was staged.
pub struct Accelerator {
  params: AcceleratorParams,
  unit: XfpUnit,
  state: AcceleratorState,
  observer: ObserverSlot,
}

impl Accelerator {
  pub fn new(params: AcceleratorParams) -> Self {
    let unit = XfpUnit::new(&params);
    let state = AcceleratorState::new(&params);
    Self {
      params,
      unit,
      state,
      observer: None,
    }
  }

  pub fn with_observer(params: AcceleratorParams, observer: Box<dyn Observer>) -> Self {
    let mut acc = Self::new(params);
    acc.observer = Some(observer);
    acc
  }

  pub fn set_observer(&mut self, observer: Option<Box<dyn Observer>>) {
    self.observer = observer;
  }

  pub fn params(&self) -> &AcceleratorParams {
    &self.params
  }

  pub fn state(&self) -> &AcceleratorState {
    &self.state
  }

  pub fn state_mut(&mut self) -> &mut AcceleratorState {
    &mut self.state
  }

  /// Zero both banks of one accumulator kind at the next commit
  pub fn clear_acc(&mut self, kind: AccKind) {
    debug!("[COMMIT] {:?} clear both banks scheduled", kind);
    self.state.flags_mut(kind).set(CommitFlags::ACC_CLEAR_BOTH, true);
  }

  /// Flip the active bank of one accumulator kind at the next commit
  pub fn swap_acc(&mut self, kind: AccKind) {
    debug!("[COMMIT] {:?} bank swap scheduled", kind);
    self.state.flags_mut(kind).set(CommitFlags::SWAP_ACC, true);
  }

  /// Read one bias bank from memory into the pending bias registers.
  ///
  /// Word 0 of channel `i` comes from `addr + 4*i`; a wide load also reads
  /// word 1 from 128 bytes further on, otherwise word 1 is cleared.
  pub fn load_bias(&mut self, mem: &mut dyn Memory, addr: u64, wide: bool, bank: usize) -> io::Result<()> {
    let bank = self.bias_bank(bank);
    self.state.seed_future_bias();
    for i in 0..COLS {
      let word0 = mem.read4(addr + 4 * i as u64)?;
      let word1 = if wide {
        mem.read4(addr + BIAS_WORD1_OFFSET + 4 * i as u64)?
      } else {
        0
      };
      self.state.future_bias[(bank, i)] = BiasReg::new(word0, word1);
    }
    self.state.commit_fixed.set(CommitFlags::BIAS_UPDATE, true);
    debug!("[BIAS] load bank {} from {:#x} wide={}", bank, addr, wide);
    Ok(())
  }

  /// Schedule a store of one committed bias bank to `addr`
  pub fn store_bias(&mut self, addr: u64, wide: bool, bank: usize) {
    let bank = self.bias_bank(bank);
    self.state.bias_write_addr = addr;
    self.state.bias_write_bank = bank;
    self.state.commit_fixed.set_bias_write(if wide { 2 } else { 1 });
    debug!("[BIAS] store bank {} to {:#x} scheduled", bank, addr);
  }

  /// Multiply an activation tile by the weight stream into the pending
  /// accumulators.
  pub fn mac(&mut self, mem: &mut dyn Memory, act: &ActOperand, wgt: &WgtOperand) -> io::Result<MacSummary> {
    let summary = run_mac(
      &mut self.state,
      &self.params,
      &self.unit,
      act,
      wgt,
      mem,
      &mut self.observer,
    )?;
    info!(
      "[MAC] {:?} act={:#x} wgt={:#x} dispatches={}{}",
      act.element,
      act.start,
      wgt.start,
      summary.dispatches,
      if summary.exhausted { " (budget exhausted)" } else { "" }
    );
    Ok(summary)
  }

  /// Convert the committed accumulators into the pending output tile
  pub fn convert(&mut self, op: &CvtOperand) -> usize {
    let count = run_convert(&mut self.state, &self.params, &self.unit, op, &mut self.observer);
    info!("[CVT] {:?} to {:#x}: {} elements", op.element, op.start, count);
    count
  }

  /// Make all staged work visible. Returns the number of bytes written to
  /// memory.
  pub fn commit(&mut self, mem: &mut dyn Memory) -> io::Result<usize> {
    commit_regs(&mut self.state, &self.unit);
    let written = commit_mem(&mut self.state, &self.unit, mem)?;
    debug!("[COMMIT] done, {} bytes written", written);
    Ok(written)
  }

  pub fn rewind(&mut self) {
    rewind(&mut self.state);
  }

  pub fn checkpoint(&self) -> io::Result<Vec<u8>> {
    self.state.checkpoint()
  }

  pub fn restore(&mut self, blob: &[u8]) -> io::Result<()> {
    self.state = AcceleratorState::restore(blob)?;
    info!("[SIM] state restored from {} byte checkpoint", blob.len());
    Ok(())
  }

  /// Committed fixed accumulator cell, for inspection
  pub fn fixed_cell(&self, row: usize, col: usize) -> Option<&FixedCell> {
    self.state.accum_fixed.get(row, col)
  }

  pub fn float_cell(&self, row: usize, col: usize) -> Option<&FloatCell> {
    self.state.accum_float.get(row, col)
  }

  /// Committed value of a fixed cell in the active bank
  pub fn fixed_value(&self, row: usize, col: usize) -> Option<i64> {
    let sel = self.state.current_fixed;
    self.fixed_cell(row, col).map(|c| c.value(sel, &self.params))
  }

  fn bias_bank(&self, bank: usize) -> usize {
    bank.min(self.state.bias.rows().saturating_sub(1))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::simulator::memory::FlatMemory;

  /// Bias loads are staged until commit and cleared word 1 on narrow loads
  #[test]
  fn test_load_bias_staged() {
    let mut acc = Accelerator::new(AcceleratorParams::default());
    let mut mem = FlatMemory::new(0x1000);
    for i in 0..COLS as u64 {
      mem.write4(0x100 + 4 * i, 24 << 10).unwrap();
      mem.write4(0x180 + 4 * i, 77).unwrap();
    }
    acc.state_mut().bias[(1, 0)] = BiasReg::new(1, 2);
    acc.load_bias(&mut mem, 0x100, false, 1).unwrap();
    assert_eq!(acc.state().bias[(1, 0)], BiasReg::new(1, 2));
    acc.commit(&mut mem).unwrap();
    assert_eq!(acc.state().bias[(1, 0)], BiasReg::new(24 << 10, 0));

    acc.load_bias(&mut mem, 0x100, true, 1).unwrap();
    acc.commit(&mut mem).unwrap();
    assert_eq!(acc.state().bias[(1, 31)], BiasReg::new(24 << 10, 77));
  }

  /// A narrow bias store writes word 0 only
  #[test]
  fn test_store_bias_round_trip() {
    let mut acc = Accelerator::new(AcceleratorParams::default());
    let mut mem = FlatMemory::new(0x1000);
    for i in 0..COLS as u64 {
      mem.write4(0x100 + 4 * i, 0x1000 + i as u32).unwrap();
    }
    acc.load_bias(&mut mem, 0x100, false, 0).unwrap();
    acc.commit(&mut mem).unwrap();
    acc.store_bias(0x400, false, 0);
    let n = acc.commit(&mut mem).unwrap();
    assert_eq!(n, COLS * 4);
    assert_eq!(mem.read4(0x400 + 4 * 7).unwrap(), 0x1007);
    assert_eq!(mem.read4(0x480).unwrap(), 0);
  }

  /// Swap and clear take effect at commit; rewind drops them
  #[test]
  fn test_swap_and_rewind() {
    let mut acc = Accelerator::new(AcceleratorParams::default());
    let mut mem = FlatMemory::new(0x100);
    acc.swap_acc(AccKind::Float);
    acc.rewind();
    acc.commit(&mut mem).unwrap();
    assert_eq!(acc.state().current_float, 0);
    acc.swap_acc(AccKind::Float);
    acc.commit(&mut mem).unwrap();
    assert_eq!(acc.state().current_float, 1);
    assert_eq!(acc.state().current_fixed, 0);
  }

  /// Restoring a checkpoint brings back the saved state
  #[test]
  fn test_checkpoint_restore() {
    let mut acc = Accelerator::new(AcceleratorParams::default());
    let mut mem = FlatMemory::new(0x100);
    let blob = acc.checkpoint().unwrap();
    acc.swap_acc(AccKind::Fixed);
    acc.commit(&mut mem).unwrap();
    assert_eq!(acc.state().current_fixed, 1);
    acc.restore(&blob).unwrap();
    assert_eq!(acc.state().current_fixed, 0);
  }

  /// The folded value adds the redundant high half
  #[test]
  fn test_fixed_value() {
    let mut acc = Accelerator::new(AcceleratorParams::default());
    acc.state_mut().accum_fixed[(1, 2)].w = [10, 0, 5, 0];
    assert_eq!(acc.fixed_value(1, 2), Some(90));
    assert_eq!(acc.fixed_value(64, 0), None);
  }
}
