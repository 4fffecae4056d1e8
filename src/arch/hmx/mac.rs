//! Multiply-accumulate into the pending accumulators.
//!
//! A MAC walks the tile in the order fixed by [`TileWalk`], fetches one
//! activation per point and multiplies it against a full row of output
//! channels from the weight cache. Nothing committed is touched.

use std::io;

use log::{debug, log_enabled, trace, Level};

use super::geometry::inc_masked_ovf;
use super::memory::Memory;
use super::observer::{MacRecord, ObserverSlot};
use super::operand::{ActOperand, WgtOperand};
use super::params::{AcceleratorParams, ACC_DEPTH, ACT_BLOCK_BYTES, COLS, ROWS};
use super::regs::{CommitFlags, FpPolicy};
use super::state::AcceleratorState;
use super::types::{AccKind, MultiplyKind};
use super::walk::{MacPoint, TileWalk, WalkPlan};
use super::weights::{load_weights, StreamShape};
use super::xfp::{Xfp, XfpUnit};

/// Outcome of one `mac` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MacSummary {
  /// Elementary multiply-accumulates performed
  pub dispatches: u64,
  /// The dispatch budget ran out before the walk finished
  pub exhausted: bool,
  /// The weight stream ran dry at a block boundary
  pub limit_exceeded: bool,
}

/// Wrapping fixed-point MAC: signed weight times unsigned activation
#[inline]
pub fn fxp_mac(acc: i32, act: u16, wgt: i16) -> i32 {
  acc.wrapping_add(i32::from(wgt).wrapping_mul(i32::from(act)))
}

/// Split an 8-bit weight into a signed low nibble and the remaining high part
#[inline]
pub fn split_redundant(wgt: u16) -> (i32, i32) {
  let w = i32::from(wgt as u8 as i8);
  let lo = (w & 7) - (w & 8);
  let hi = (w - lo) >> 4;
  (lo, hi)
}

/// Copy one or two activation blocks into the activation cache.
fn load_activations(state: &mut AcceleratorState, mem: &mut dyn Memory, block: i32) -> io::Result<()> {
  let geo = &state.geometry;
  let base0 = geo.act_addr + block as u64 * ACT_BLOCK_BYTES as u64;
  let base1 = geo.act_addr + geo.dy;
  let second = geo.blocks == 1 && (geo.y_taps > 1 || geo.y_start != 0);
  trace!("[MAC] act block {} at {:#x} second={}", block, base0, second);

  for off in (0..ACT_BLOCK_BYTES).step_by(8) {
    let dw = mem.read8(base0 + off as u64)?;
    state.act_cache[off..off + 8].copy_from_slice(&dw.to_le_bytes());
  }
  if second {
    for off in (0..ACT_BLOCK_BYTES).step_by(8) {
      let dw = mem.read8(base1 + off as u64)?;
      let at = ACT_BLOCK_BYTES + off;
      state.act_cache[at..at + 8].copy_from_slice(&dw.to_le_bytes());
    }
  }
  Ok(())
}

struct MacRun<'a> {
  state: &'a mut AcceleratorState,
  unit: &'a XfpUnit,
  plan: &'a WalkPlan,
  observer: &'a mut ObserverSlot,
  kind: AccKind,
  multiply: MultiplyKind,
  output_scale: usize,
  redundant: bool,
  base_bank: usize,
  budget: u64,
  dispatches: u64,
  exhausted: bool,
  fp8_batch: usize,
  /// Float products waiting for their reduction, `[row][col][lane]`
  products: Vec<Xfp>,
}

impl MacRun<'_> {
  fn activation(&self, idx: i32) -> u16 {
    if self.state.limit_exceeded || idx < 0 {
      return 0;
    }
    let idx = idx as usize;
    if self.plan.flt {
      let at = (idx >> 1) * 2;
      match self.state.act_cache.get(at..at + 2) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => 0,
      }
    } else {
      self.state.act_cache.get(idx).copied().map(u16::from).unwrap_or(0)
    }
  }

  fn point(&mut self, p: &MacPoint) {
    let geo = &self.state.geometry;
    let bank = self.base_bank ^ if geo.deep { (p.deep_block & 1) as usize } else { 0 };

    let (act_y, y_ovf) = inc_masked_ovf(p.y_tap, p.intra_y, geo.y_mask);
    let act_y = (act_y & 0x7FFF_FFFF) + if y_ovf { 0x800 } else { 0 };

    let (out, ovf) = inc_masked_ovf(p.x_tap, p.intra_x, geo.x_mask);
    let sel = if ovf { bank ^ 1 } else { bank };
    let out = out | p.intra_y;
    let m = (1i32 << self.plan.format_shift) - 1;
    let mut row = ((out >> 5) & !m) | (out & m);
    if ovf && (geo.drop || geo.deep) {
      row = -1;
    }

    let act = self.activation(act_y + p.intra_x + p.channel);
    self.inner(p, row, sel, act);
  }

  fn inner(&mut self, p: &MacPoint, row: i32, sel: usize, act: u16) {
    let plan = self.plan;
    let fp8 = plan.flt && plan.fp_rate == 8;
    let ic = p.raw_channel;
    let gsize = plan.group_size.max(1);

    let mut valid = self.state.weight_valid(p.wgt_idx);
    if ic == ic & !(plan.fp_rate - 1) {
      self.fp8_batch = p.wgt_idx;
    }
    let batch_valid = self.state.weight_valid(self.fp8_batch);
    let pad_zero = fp8 && ic - p.group * gsize >= p.fp8_stop && gsize > 4 && batch_valid;
    let small_zero = fp8 && gsize <= 4 && ic / gsize != p.group;
    if pad_zero {
      valid = true;
    }

    if self.state.limit_exceeded || !(valid || batch_valid) || row < 0 || row as usize >= ROWS {
      return;
    }
    let row = row as usize;
    let (ostart, oend) = plan.output_range(p.group);

    for o2 in 0..self.output_scale {
      for oc in ostart..oend {
        if self.budget == 0 {
          self.abort(p.wgt_idx);
          return;
        }
        let mut wgt = self.state.weight_cache[(p.wgt_idx, oc + COLS * o2)].wgt;
        if pad_zero || small_zero || (!valid && batch_valid) {
          wgt = 0;
        }
        let result = match self.multiply {
          MultiplyKind::Fxp => self.mult_fxp(row, oc, sel, act, wgt),
          MultiplyKind::FxpSubbyte => self.mult_subbyte(row, oc, sel + if o2 > 0 { 2 } else { 0 }, act, wgt),
          MultiplyKind::Xfp => self.mult_xfp(row, oc, sel, act, wgt, ic, p.group),
        };
        self.budget -= 1;
        self.dispatches += 1;

        if let Some(obs) = self.observer.as_mut() {
          obs.on_mac(&MacRecord {
            kind: self.kind,
            row,
            col: oc,
            sel,
            input_channel: ic as u32,
            act,
            wgt,
            result,
          });
        }
      }
    }
  }

  fn mult_fxp(&mut self, row: usize, col: usize, sel: usize, act: u16, wgt: u16) -> i64 {
    let cell = &mut self.state.future_fixed[(row, col)];
    if self.redundant {
      let (lo, hi) = split_redundant(wgt);
      cell.w[sel] = fxp_mac(cell.w[sel], act, lo as i16);
      cell.w[sel + 2] = fxp_mac(cell.w[sel + 2], act, hi as i16);
      (i64::from(cell.w[sel + 2]) << 4) + i64::from(cell.w[sel])
    } else {
      cell.w[sel] = fxp_mac(cell.w[sel], act, wgt as i16);
      i64::from(cell.w[sel])
    }
  }

  fn mult_subbyte(&mut self, row: usize, col: usize, idx: usize, act: u16, wgt: u16) -> i64 {
    let cell = &mut self.state.future_fixed[(row, col)];
    cell.w[idx] = fxp_mac(cell.w[idx], act, wgt as i16);
    i64::from(cell.w[idx])
  }

  #[allow(clippy::too_many_arguments)]
  fn mult_xfp(&mut self, row: usize, col: usize, sel: usize, act: u16, mut wgt: u16, ic: i32, group: i32) -> i64 {
    let rate = self.plan.fp_rate.max(1) as usize;
    let pgs = self.plan.parallel_group_size.max(1);
    let gsize = self.plan.group_size.max(1);
    let lane = ic as usize & (rate - 1);
    let mod_col = col as i32 & (pgs - 1);
    let limit = if pgs > 8 { 8 } else { 4 };
    if gsize <= limit && mod_col / gsize != group % (pgs / gsize).max(1) {
      wgt = 0;
    }

    let policy = self.state.usr;
    let at = (row * ACC_DEPTH + col) * rate;
    self.products[at + lane] = self.unit.fp_mult(act, wgt, self.state.geometry.bf16, policy);
    let cell = &mut self.state.future_float[(row, col)];
    if lane == rate - 1 {
      cell.xfp[sel] = self.unit.mac_reduce(&mut self.products[at..at + rate], &cell.xfp[sel], policy);
    }
    cell.xfp[sel].sig
  }

  /// Budget ran out: everything from the current stream position on is
  /// treated as missing.
  fn abort(&mut self, wgt_idx: usize) {
    debug!("[MAC] dispatch budget exhausted after {} dispatches at stream {}", self.dispatches, wgt_idx);
    self.state.invalidate_weights(wgt_idx, COLS);
    self.exhausted = true;
  }
}

/// Run one MAC: derive the geometry, fill the weight cache and accumulate
/// into the pending array of the operand's accumulator kind.
pub fn run_mac(
  state: &mut AcceleratorState,
  params: &AcceleratorParams,
  unit: &XfpUnit,
  act: &ActOperand,
  wgt: &WgtOperand,
  mem: &mut dyn Memory,
  observer: &mut ObserverSlot,
) -> io::Result<MacSummary> {
  state.limit_exceeded = false;
  state.usr = FpPolicy::from_usr(wgt.usr);
  state.geometry.set_activation(act, params);
  state.geometry.set_weights(wgt, params);

  let flt = state.geometry.flt;
  let kind = act.element.acc_kind();
  let multiply = match (flt, wgt.multiply) {
    (true, _) => MultiplyKind::Xfp,
    (false, MultiplyKind::Xfp) => MultiplyKind::Fxp,
    (false, m) => m,
  };
  state.seed_future_acc(kind);

  let shape = StreamShape {
    unpack: wgt.unpack,
    output_scale: wgt.output_scale.max(1),
    negate: state.geometry.negate,
    fp_rate: params.fp_rate,
  };
  let filled = load_weights(state, &shape, mem, observer)?;
  let plan = WalkPlan::new(&state.geometry, params);
  debug!(
    "[MAC] {:?} blocks={} y_taps={} x_taps={} channels={}..{} groups={}x{} weights={}",
    kind,
    plan.blocks,
    plan.y_taps.len(),
    plan.x_taps.len(),
    state.geometry.ch_start,
    state.geometry.ch_stop,
    plan.group_count,
    plan.group_size,
    filled
  );

  let products = if flt {
    vec![unit.zero(); ROWS * ACC_DEPTH * params.fp_rate.max(1) as usize]
  } else {
    Vec::new()
  };
  let base_bank = state.current_bank(kind);
  let mut run = MacRun {
    state,
    unit,
    plan: &plan,
    observer,
    kind,
    multiply,
    output_scale: shape.output_scale as usize,
    redundant: params.redundant_acc(),
    base_bank,
    budget: params.dispatch_budget(flt),
    dispatches: 0,
    exhausted: false,
    fp8_batch: 0,
    products,
  };

  let mut walk = TileWalk::new(&plan);
  let mut last_block = -1;
  for p in walk.by_ref() {
    if p.block != last_block {
      if last_block >= 0 && !run.state.weight_valid(p.wgt_idx) {
        debug!("[MAC] weight stream ran out before block {}", p.block);
        run.state.limit_exceeded = true;
        break;
      }
      load_activations(&mut *run.state, mem, p.block)?;
      last_block = p.block;
    }
    if log_enabled!(Level::Trace) {
      trace!("[MAC] point {:?}", p);
    }
    run.point(&p);
    if run.exhausted {
      break;
    }
  }
  // the stream must reach past the final block as well
  if last_block >= 0 && !run.state.limit_exceeded && !run.state.weight_valid(walk.wgt_cursor()) {
    debug!("[MAC] weight stream ran out after block {}", last_block);
    run.state.limit_exceeded = true;
  }

  let summary = MacSummary {
    dispatches: run.dispatches,
    exhausted: run.exhausted,
    limit_exceeded: run.state.limit_exceeded,
  };
  run.state.flags_mut(kind).set(CommitFlags::ACC_UPDATE, true);
  Ok(summary)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::arch::hmx::types::{ActBlock, ElementType, Format, Unpack, WgtBlock};
  use crate::simulator::memory::FlatMemory;

  const ACT: u64 = 0x0;
  const WGT: u64 = 0x1000;

  fn act_op() -> ActOperand {
    ActOperand {
      start: ACT,
      range: 3,
      element: ElementType::Ub,
      format: Format::ChannelMajor,
      block: ActBlock::Block,
    }
  }

  fn wgt_op() -> WgtOperand {
    WgtOperand {
      start: WGT,
      range: 127,
      block: WgtBlock::Normal,
      unpack: Unpack::Byte,
      multiply: MultiplyKind::Fxp,
      output_scale: 1,
      usr: 0,
    }
  }

  /// Every row holds activation `act` on channels 0..4; every output
  /// channel sees weights `wgts` on input channels 0..4.
  fn memory(act: u8, wgts: [u8; 4]) -> FlatMemory {
    let mut mem = FlatMemory::new(0x2000);
    let mut tile = vec![0u8; ACT_BLOCK_BYTES];
    for row in 0..ROWS {
      for ch in 0..4 {
        tile[row * 32 + ch] = act;
      }
    }
    mem.load(ACT, &tile).unwrap();
    let stream: Vec<u8> = (0..COLS).flat_map(|_| wgts).collect();
    mem.load(WGT, &stream).unwrap();
    mem
  }

  fn setup(params: &AcceleratorParams) -> (AcceleratorState, XfpUnit) {
    (AcceleratorState::new(params), XfpUnit::new(params))
  }

  /// Plain accumulation sums activation times weight over input channels
  #[test]
  fn test_mac_non_redundant() {
    let params = AcceleratorParams { sub_cols: 1, ..AcceleratorParams::default() };
    let (mut state, unit) = setup(&params);
    let mut mem = memory(10, [1, 2, 0xFD, 4]);
    let mut obs: ObserverSlot = None;
    let summary = run_mac(&mut state, &params, &unit, &act_op(), &wgt_op(), &mut mem, &mut obs).unwrap();

    assert_eq!(summary.dispatches, 4 * 64 * 32);
    assert!(!summary.exhausted);
    assert_eq!(state.future_fixed[(0, 0)].w[0], 40);
    assert_eq!(state.future_fixed[(63, 31)].w[0], 40);
    assert_eq!(state.accum_fixed[(0, 0)].w[0], 0);
    assert!(state.commit_fixed.has(CommitFlags::ACC_UPDATE));
  }

  /// Redundant accumulation splits every weight into two partial sums
  #[test]
  fn test_mac_redundant_split() {
    let params = AcceleratorParams::default();
    let (mut state, unit) = setup(&params);
    let mut mem = memory(3, [0x25; 4]);
    let mut obs: ObserverSlot = None;
    run_mac(&mut state, &params, &unit, &act_op(), &wgt_op(), &mut mem, &mut obs).unwrap();

    let cell = state.future_fixed[(5, 7)];
    assert_eq!(cell.w[0], 4 * 3 * 5);
    assert_eq!(cell.w[2], 4 * 3 * 2);
    assert_eq!((cell.w[2] << 4) + cell.w[0], 4 * 3 * 0x25);
  }

  /// Negative weights keep their sign through the split
  #[test]
  fn test_split_redundant() {
    assert_eq!(split_redundant(0x25), (5, 2));
    assert_eq!(split_redundant(0xFD), (-3, 0));
    let (lo, hi) = split_redundant(0x88);
    assert_eq!((hi << 4) + lo, -120);
  }

  /// Running out of budget stops the walk and drops the rest of the stream
  #[test]
  fn test_mac_budget() {
    let params = AcceleratorParams {
      sub_cols: 1,
      mac_budget: Some(100),
      ..AcceleratorParams::default()
    };
    let (mut state, unit) = setup(&params);
    let mut mem = memory(1, [1; 4]);
    let mut obs: ObserverSlot = None;
    let summary = run_mac(&mut state, &params, &unit, &act_op(), &wgt_op(), &mut mem, &mut obs).unwrap();

    assert_eq!(summary.dispatches, 100);
    assert!(summary.exhausted);
    assert!(!state.weight_valid(0));
    assert_eq!(state.future_fixed[(0, 31)].w[0], 1);
    assert_eq!(state.future_fixed[(3, 3)].w[0], 1);
    assert_eq!(state.future_fixed[(3, 4)].w[0], 0);
  }

  /// A stream that runs dry inside the only block raises the limit flag
  /// once the block ends, and the missing weights contribute nothing
  #[test]
  fn test_mac_limit_after_final_block() {
    let params = AcceleratorParams { sub_cols: 1, ..AcceleratorParams::default() };
    let (mut state, unit) = setup(&params);
    let mut mem = memory(3, [1; 4]);
    let mut obs: ObserverSlot = None;
    let act = ActOperand { range: 7, ..act_op() };
    let summary = run_mac(&mut state, &params, &unit, &act, &wgt_op(), &mut mem, &mut obs).unwrap();

    assert!(summary.limit_exceeded);
    assert!(!summary.exhausted);
    assert_eq!(summary.dispatches, 4 * 64 * 32);
    assert_eq!(state.future_fixed[(0, 0)].w[0], 12);

    // a stream that reaches past the block leaves the flag clear
    let wgt = WgtOperand { range: 255, ..wgt_op() };
    let summary = run_mac(&mut state, &params, &unit, &act_op(), &wgt, &mut mem, &mut obs).unwrap();
    assert!(!summary.limit_exceeded);
    assert!(!state.limit_exceeded);
  }

  /// A second MAC before commit keeps accumulating into the pending array
  #[test]
  fn test_mac_accumulates_until_commit() {
    let params = AcceleratorParams { sub_cols: 1, ..AcceleratorParams::default() };
    let (mut state, unit) = setup(&params);
    let mut mem = memory(2, [1; 4]);
    let mut obs: ObserverSlot = None;
    run_mac(&mut state, &params, &unit, &act_op(), &wgt_op(), &mut mem, &mut obs).unwrap();
    run_mac(&mut state, &params, &unit, &act_op(), &wgt_op(), &mut mem, &mut obs).unwrap();
    assert_eq!(state.future_fixed[(9, 9)].w[0], 16);
  }

  #[test]
  fn test_fxp_mac_wraps() {
    assert_eq!(fxp_mac(i32::MAX, 1, 1), i32::MIN);
    assert_eq!(fxp_mac(0, 0xFFFF, -1), -0xFFFF);
  }
}
