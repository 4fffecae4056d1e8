//! Commit and rewind.
//!
//! Register commit moves pending accumulators and bias into the committed
//! arrays. Memory commit drains the convert buffer into the output tile,
//! applies the post-convert accumulator clear and stores the bias bank.

use std::io;

use log::{debug, log_enabled, trace, Level};

use super::geometry::{inc_masked, OutputTile, MASK_MSB};
use super::memory::Memory;
use super::params::{CHANNEL_SIZE_LOG, COLS};
use super::regs::CommitFlags;
use super::state::{AcceleratorState, FixedCell, FloatCell, Grid};
use super::types::{AccKind, CvtDirection};
use super::xfp::XfpUnit;

const BIAS_WIDE_OFFSET: u64 = 128;

/// Apply pending register updates for both accumulator kinds
pub fn commit_regs(state: &mut AcceleratorState, unit: &XfpUnit) {
  for kind in [AccKind::Fixed, AccKind::Float] {
    let flags = *state.flags(kind);
    if flags.is_empty() {
      continue;
    }
    debug!("[COMMIT] {:?} regs flags={:#x}", kind, flags.bits());

    if flags.has(CommitFlags::ACC_UPDATE) {
      match kind {
        AccKind::Fixed => state.accum_fixed.copy_from(&state.future_fixed),
        AccKind::Float => state.accum_float.copy_from(&state.future_float),
      }
    }
    if kind == AccKind::Fixed && flags.has(CommitFlags::BIAS_UPDATE) {
      state.bias.copy_from(&state.future_bias);
    }
    if flags.has(CommitFlags::ACC_CLEAR_BOTH) {
      match kind {
        AccKind::Fixed => {
          state.accum_fixed.fill(FixedCell::default());
          state.future_fixed.fill(FixedCell::default());
        },
        AccKind::Float => {
          let zero = FloatCell::zeroed(unit);
          state.accum_float.fill(zero);
          state.future_float.fill(zero);
        },
      }
    }
    if flags.has(CommitFlags::SWAP_ACC) {
      match kind {
        AccKind::Fixed => state.current_fixed ^= 1,
        AccKind::Float => state.current_float ^= 1,
      }
    }
  }
}

/// Apply pending memory effects and retire every pending flag. Returns the
/// number of bytes written.
pub fn commit_mem(state: &mut AcceleratorState, unit: &XfpUnit, mem: &mut dyn Memory) -> io::Result<usize> {
  let mut written = 0;

  for kind in [AccKind::Fixed, AccKind::Float] {
    let flags = *state.flags(kind);
    if !flags.has(CommitFlags::CVT_WRITE) {
      continue;
    }
    if let Some(tile) = state.output {
      written += write_out(&tile, &state.cvt[state.cvt_index ^ 1], mem)?;
    }
    if flags.has(CommitFlags::ACC_CLEAR) {
      let bank = state.current_bank(kind);
      match kind {
        AccKind::Fixed => {
          state.accum_fixed.iter_mut().for_each(|c| c.clear_bank(bank));
          state.current_fixed ^= 1;
        },
        AccKind::Float => {
          let zero = unit.zero();
          state.accum_float.iter_mut().for_each(|c| c.xfp[bank & 1] = zero);
          state.current_float ^= 1;
        },
      }
      debug!("[COMMIT] {:?} cleared bank {} after convert", kind, bank);
    }
    if flags.has(CommitFlags::CVT_UPDATE) {
      if flags.has(CommitFlags::CVT_ADVANCE) {
        state.cvt_index ^= 1;
      } else {
        let idx = state.cvt_index;
        let (a, b) = state.cvt.split_at_mut(1);
        if idx == 0 {
          a[0].copy_from(&b[0]);
        } else {
          b[0].copy_from(&a[0]);
        }
      }
    }
  }

  let words = state.commit_fixed.bias_write();
  if words != 0 {
    let addr = state.bias_write_addr;
    let bank = state.bias_write_bank;
    debug!("[BIAS] store bank {} to {:#x} words={}", bank, addr, words);
    for i in 0..COLS {
      let reg = state.bias[(bank, i)];
      mem.write4(addr + 4 * i as u64, reg.word0)?;
      if words == 2 {
        mem.write4(addr + BIAS_WIDE_OFFSET + 4 * i as u64, reg.word1)?;
      }
    }
    written += COLS * 4 * words as usize;
  }

  state.commit_fixed.clear();
  state.commit_float.clear();
  state.output = None;
  Ok(written)
}

/// Drop every pending update. Pending arrays are reseeded by the next
/// operation that needs them.
pub fn rewind(state: &mut AcceleratorState) {
  debug!(
    "[COMMIT] rewind fxp={:#x} flt={:#x}",
    state.commit_fixed.bits(),
    state.commit_float.bits()
  );
  state.commit_fixed.clear();
  state.commit_float.clear();
  state.output = None;
}

/// Walk the output tile and write one converted peg per position
fn write_out(tile: &OutputTile, cvt: &Grid<u32>, mem: &mut dyn Memory) -> io::Result<usize> {
  let mut out = TileWriter { tile, cvt, mem, written: 0 };
  let y_mask = tile.y_mask | MASK_MSB;
  let y_inc = tile.y_inc;

  let mut y = tile.y_offset;
  let mut ya = 0;
  while y >= 0 {
    out.row(tile.base, y, ya)?;
    y = inc_masked(y, y_inc, y_mask);
    ya = inc_masked(ya, y_inc, y_mask);
    if y_inc == 0 {
      break;
    }
  }

  // Rows above the y offset wrap to the next tile, or to the same one
  let base = tile.base.wrapping_add(tile.dy);
  let mut y = 0;
  while y < tile.y_offset {
    out.row(base, y, ya)?;
    y = inc_masked(y, y_inc, y_mask);
    ya = inc_masked(ya, y_inc, y_mask);
    if y_inc == 0 {
      break;
    }
  }
  debug!("[COMMIT] wrote {} bytes from {:#x}", out.written, tile.base);
  Ok(out.written)
}

struct TileWriter<'a> {
  tile: &'a OutputTile,
  cvt: &'a Grid<u32>,
  mem: &'a mut dyn Memory,
  written: usize,
}

impl TileWriter<'_> {
  fn row(&mut self, base: u64, y: i32, ya: i32) -> io::Result<()> {
    let x_mask = self.tile.x_mask | MASK_MSB;
    let x_inc = self.tile.x_inc;
    // Both only updates the convert buffer and writes no pegs
    let before = self.tile.direction == CvtDirection::Before;
    let after = self.tile.direction == CvtDirection::After;

    let mut x = 0;
    let mut xa = self.tile.x_acc_offset;
    while x < self.tile.x_offset {
      if before {
        self.peg(base, x, y, xa | ya)?;
        xa = inc_masked(xa, x_inc, x_mask);
      }
      x = inc_masked(x, x_inc, x_mask);
      if x_inc == 0 {
        break;
      }
    }
    while x >= 0 {
      if after {
        self.peg(base, x, y, xa | ya)?;
        xa = inc_masked(xa, x_inc, x_mask);
      }
      x = inc_masked(x, x_inc, x_mask);
      if x_inc == 0 {
        break;
      }
    }
    Ok(())
  }

  fn peg(&mut self, base: u64, x: i32, y: i32, acc_idx: i32) -> io::Result<()> {
    let shift = self.tile.format_shift;
    let low = (1i32 << shift) - 1;
    let row = (((acc_idx >> CHANNEL_SIZE_LOG) & !low) | (acc_idx & low)) as usize;
    let (first, last) = match (self.tile.element.output_stride() == 2, self.tile.upper_half) {
      (true, true) => (COLS / 2, COLS),
      (true, false) => (0, COLS / 2),
      (false, _) => (0, COLS),
    };
    let flt = self.tile.element.is_float();
    let base = base + (x | y) as u64;

    for z in first..last {
      let pa = base + ((z as u64) << shift);
      let code = self.cvt.get(row, z).copied().unwrap_or(0) >> 4;
      if flt {
        self.mem.write2(pa, code as u16)?;
        self.written += 2;
      } else {
        self.mem.write1(pa, code as u8)?;
        self.written += 1;
      }
      if log_enabled!(Level::Trace) {
        trace!("[COMMIT] [{:02}][{:02}] -> {:#x} = {:#x}", row, z, pa, code);
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::hmx::operand::CvtOperand;
  use crate::arch::hmx::params::AcceleratorParams;
  use crate::arch::hmx::regs::{BiasReg, CvtRs};
  use crate::arch::hmx::types::{ElementType, Format};
  use crate::simulator::memory::FlatMemory;

  fn setup() -> (AcceleratorState, XfpUnit) {
    let params = AcceleratorParams::default();
    (AcceleratorState::new(&params), XfpUnit::new(&params))
  }

  fn tile(start: u64, range: u64, element: ElementType) -> OutputTile {
    OutputTile::new(&CvtOperand {
      start,
      range,
      element,
      format: Format::ChannelMajor,
      direction: CvtDirection::After,
      rs: CvtRs::default(),
      usr: 0,
      subchannel_hi: false,
    })
  }

  /// Pending accumulators and bias reach the committed arrays
  #[test]
  fn test_commit_regs_updates() {
    let (mut s, unit) = setup();
    s.future_fixed[(2, 3)].w[0] = 42;
    s.future_bias[(0, 1)] = BiasReg::new(7, 8);
    s.commit_fixed.set(CommitFlags::ACC_UPDATE, true);
    s.commit_fixed.set(CommitFlags::BIAS_UPDATE, true);
    commit_regs(&mut s, &unit);
    assert_eq!(s.accum_fixed[(2, 3)].w[0], 42);
    assert_eq!(s.bias[(0, 1)], BiasReg::new(7, 8));
  }

  /// Swap flips the bank and clear-both zeroes everything
  #[test]
  fn test_commit_regs_swap_and_clear() {
    let (mut s, unit) = setup();
    s.accum_fixed[(0, 0)].w = [1, 2, 3, 4];
    s.commit_fixed.set(CommitFlags::SWAP_ACC, true);
    s.commit_fixed.set(CommitFlags::ACC_CLEAR_BOTH, true);
    commit_regs(&mut s, &unit);
    assert_eq!(s.current_fixed, 1);
    assert_eq!(s.accum_fixed[(0, 0)].w, [0; 4]);
    assert_eq!(s.current_float, 0);
  }

  /// A full channel-major tile writes 64 pegs of 32 bytes from the base
  #[test]
  fn test_write_out_tile() {
    let (mut s, unit) = setup();
    let mut mem = FlatMemory::new(0x4000);
    s.output = Some(tile(0x2000, 0, ElementType::Ub));
    for z in 0..COLS {
      s.cvt[1][(0, z)] = ((z as u32) + 1) << 4;
    }
    s.commit_fixed.set(CommitFlags::CVT_WRITE, true);
    s.commit_fixed.set(CommitFlags::CVT_UPDATE, true);
    s.commit_fixed.set(CommitFlags::CVT_ADVANCE, true);
    let n = commit_mem(&mut s, &unit, &mut mem).unwrap();
    assert_eq!(n, 64 * COLS);
    assert_eq!(mem.read1(0x2000).unwrap(), 1);
    assert_eq!(mem.read1(0x2000 + 31).unwrap(), 32);
    assert_eq!(mem.read1(0x2000 + 32).unwrap(), 0);
    assert_eq!(mem.read1(0x2800).unwrap(), 0);
    assert_eq!(s.cvt_index, 1);
    assert!(s.commit_fixed.is_empty());
    assert!(s.output.is_none());
  }

  /// Rows below the y offset wrap back into the same tile when no second
  /// tile is addressed
  #[test]
  fn test_write_out_wraps_rows() {
    let (mut s, unit) = setup();
    let mut mem = FlatMemory::new(0x4000);
    s.output = Some(tile(0x2400, 0x400, ElementType::Ub));
    for r in 0..64 {
      for z in 0..COLS {
        s.cvt[1][(r, z)] = ((r as u32) + 1) << 4;
      }
    }
    s.commit_fixed.set(CommitFlags::CVT_WRITE, true);
    let n = commit_mem(&mut s, &unit, &mut mem).unwrap();
    assert_eq!(n, 64 * COLS);
    assert_eq!(mem.read1(0x2400).unwrap(), 1);
    assert_eq!(mem.read1(0x27E0 + 31).unwrap(), 32);
    assert_eq!(mem.read1(0x2000).unwrap(), 33);
    assert_eq!(mem.read1(0x23E0).unwrap(), 64);
  }

  /// A convert in both directions leaves memory untouched
  #[test]
  fn test_write_out_both_writes_nothing() {
    let (mut s, unit) = setup();
    let mut mem = FlatMemory::new(0x4000);
    let mut t = tile(0x2000, 0, ElementType::Ub);
    t.direction = CvtDirection::Both;
    s.output = Some(t);
    s.cvt[1][(0, 0)] = 0x50;
    s.commit_fixed.set(CommitFlags::CVT_WRITE, true);
    assert_eq!(commit_mem(&mut s, &unit, &mut mem).unwrap(), 0);
    assert_eq!(mem.read1(0x2000).unwrap(), 0);
  }

  /// The post-convert clear zeroes the current bank and flips to the other
  #[test]
  fn test_convert_clear_flips_bank() {
    let (mut s, unit) = setup();
    let mut mem = FlatMemory::new(0x4000);
    s.output = Some(tile(0, 0, ElementType::Ub));
    s.accum_fixed[(4, 4)].w = [5, 6, 7, 8];
    s.commit_fixed.set(CommitFlags::CVT_WRITE, true);
    s.commit_fixed.set(CommitFlags::ACC_CLEAR, true);
    commit_mem(&mut s, &unit, &mut mem).unwrap();
    assert_eq!(s.accum_fixed[(4, 4)].w, [0, 6, 0, 8]);
    assert_eq!(s.current_fixed, 1);
  }

  /// Without advance the committed buffer takes a copy of the work buffer
  #[test]
  fn test_cvt_update_copies() {
    let (mut s, unit) = setup();
    let mut mem = FlatMemory::new(0x4000);
    s.output = Some(tile(0, 0, ElementType::Ub));
    s.cvt[1][(9, 9)] = 0x123;
    s.commit_fixed.set(CommitFlags::CVT_WRITE, true);
    s.commit_fixed.set(CommitFlags::CVT_UPDATE, true);
    commit_mem(&mut s, &unit, &mut mem).unwrap();
    assert_eq!(s.cvt_index, 0);
    assert_eq!(s.cvt[0][(9, 9)], 0x123);
  }

  /// A wide bias store writes both words of every channel
  #[test]
  fn test_bias_store() {
    let (mut s, unit) = setup();
    let mut mem = FlatMemory::new(0x1000);
    for i in 0..COLS {
      s.bias[(2, i)] = BiasReg::new(i as u32, 0x100 + i as u32);
    }
    s.bias_write_addr = 0x400;
    s.bias_write_bank = 2;
    s.commit_fixed.set_bias_write(2);
    let n = commit_mem(&mut s, &unit, &mut mem).unwrap();
    assert_eq!(n, 256);
    assert_eq!(mem.read4(0x400 + 4 * 5).unwrap(), 5);
    assert_eq!(mem.read4(0x400 + 128 + 4 * 5).unwrap(), 0x105);
    assert_eq!(s.commit_fixed.bias_write(), 0);
  }

  /// Out-of-range writes surface the memory fault
  #[test]
  fn test_write_out_fault() {
    let (mut s, unit) = setup();
    let mut mem = FlatMemory::new(0x100);
    s.output = Some(tile(0x2000, 0, ElementType::Ub));
    s.commit_fixed.set(CommitFlags::CVT_WRITE, true);
    assert!(commit_mem(&mut s, &unit, &mut mem).is_err());
  }

  /// Rewind drops pending work without touching committed data
  #[test]
  fn test_rewind() {
    let (mut s, unit) = setup();
    s.future_fixed[(1, 1)].w[0] = 9;
    s.commit_fixed.set(CommitFlags::ACC_UPDATE, true);
    s.commit_float.set(CommitFlags::SWAP_ACC, true);
    rewind(&mut s);
    commit_regs(&mut s, &unit);
    assert_eq!(s.accum_fixed[(1, 1)].w[0], 0);
    assert_eq!(s.current_float, 0);
  }
}
