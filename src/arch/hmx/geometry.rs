//! Tile geometry.
//!
//! A tile address splits into x and y bits through a spatial mask. All
//! stepping happens with masked increments, which carry only through the
//! masked bit positions. Values are kept in `i32` so that a carry out of a
//! mask extended with bit 31 shows up as a negative value.

use serde::{Deserialize, Serialize};

use super::int128::leading_ones8;
use super::operand::{ActOperand, CvtOperand, WgtOperand};
use super::params::{AcceleratorParams, ACT_BLOCK_BYTES, COLS, ROWS};
use super::types::{ActBlock, CvtDirection, ElementType, WgtBlock};

/// Bit 31, appended to a mask to turn a wrap into a sign flip
pub const MASK_MSB: i32 = i32::MIN;

/// Weight stream alignment, one 32-bit word per output channel
const WGT_ROW_MASK: u64 = 4 * COLS as u64 - 1;

/// Weight cache capacity in bytes at one weight per byte
const WGT_LIMIT_BYTES: u64 = (ROWS * COLS * COLS * 9 / 8) as u64;

#[inline]
pub fn inc_masked(value: i32, inc: i32, mask: i32) -> i32 {
  ((value | !mask).wrapping_add(inc & mask) & mask) | (value & !mask)
}

/// Masked increment that also reports a wrap
#[inline]
pub fn inc_masked_ovf(value: i32, inc: i32, mask: i32) -> (i32, bool) {
  let out = inc_masked(value, inc, mask);
  (out, out < value)
}

/// Tap step; a dilated walk skips every other position. A zero increment
/// ends the walk.
pub fn inc_tap_dilate(value: i32, inc: i32, mask: i32, dilate: bool) -> i32 {
  if inc == 0 {
    return -1;
  }
  let out = inc_masked(value, inc, mask);
  if dilate && out >= 0 {
    inc_masked(out, inc, mask)
  } else {
    out
  }
}

/// Lowest set bit of a mask
#[inline]
pub fn mask_inc(mask: i32) -> i32 {
  mask & mask.wrapping_neg()
}

/// Number of tap positions from zero up to `start`, inclusive.
pub fn tap_count(start: i32, mask: i32, inc: i32) -> i32 {
  let target = start & mask;
  if target == 0 || inc & mask == 0 {
    return 1;
  }
  let mut count = 0;
  let mut size = 0;
  loop {
    let (next, ovf) = inc_masked_ovf(count, inc, mask);
    count = next;
    size += 1;
    if ovf || count == target {
      break;
    }
  }
  size + 1
}

/// Number of tap positions from `start` to the end of the mask, inclusive.
pub fn tap_count_above(start: i32, mask: i32, inc: i32) -> i32 {
  if mask == 0 || inc & mask == 0 {
    return 1;
  }
  let mut count = start & mask;
  let mut size = 0;
  loop {
    let (next, ovf) = inc_masked_ovf(count, inc, mask);
    if ovf {
      break;
    }
    count = next;
    size += 1;
  }
  (size + 1).max(1)
}

/// Every position visited from `start` while the walk stays at or below
/// `stop`. `mask` should carry `MASK_MSB` so the walk ends on wrap.
pub fn tap_indices(start: i32, stop: i32, inc: i32, mask: i32, dilate: bool) -> Vec<i32> {
  let mut out = Vec::new();
  let mut v = start;
  while v >= 0 {
    out.push(v);
    v = inc_tap_dilate(v, inc, mask, dilate);
    if v > stop {
      v = -1;
    }
  }
  out
}

/// Every position of one tile along a mask, from zero
pub fn intra_indices(mask: i32) -> Vec<i32> {
  tap_indices(0, i32::MAX, mask_inc(mask), mask | MASK_MSB, false)
}

/// Input channel grouping of a grouped convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLayout {
  pub grouped: bool,
  pub size: i32,
  pub count: i32,
}

impl Default for GroupLayout {
  fn default() -> Self {
    Self {
      grouped: false,
      size: COLS as i32,
      count: 1,
    }
  }
}

impl GroupLayout {
  /// Detect grouping from a wrapped channel range and realign the range.
  ///
  /// Returns the layout and the `[start, stop)` channel range in
  /// channel units.
  pub fn detect(ch_start: i32, ch_stop: i32, deep: bool) -> (Self, i32, i32) {
    let grouped = ch_start > ch_stop && !deep;
    let cl1 = leading_ones8((((ch_stop - ch_start) ^ ch_start ^ ch_stop) << 2) as u32);
    let size = if grouped { (32 >> cl1).max(1) } else { 32 };
    let count = 32 / size;
    let sel = 0x1F >> cl1;
    let (mut gs, mut ge) = (ch_start & sel, ch_stop & sel);
    if count == 16 {
      gs = (ch_start & !1) & sel;
      ge = (ch_stop | 1) & sel;
    } else if count <= 8 {
      gs = (ch_start & !3) & sel;
      ge = (ch_stop | 3) & sel;
    }
    let layout = Self { grouped, size, count };
    if grouped {
      (layout, gs, ge + 1)
    } else {
      (layout, ch_start & !3, (ch_stop | 3) + 1)
    }
  }
}

/// Geometry of one MAC: activation tile, taps, channel range and the
/// weight stream bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
  pub flt: bool,
  pub format_shift: u32,
  pub act_addr: u64,
  pub dy: u64,
  pub x_mask: i32,
  pub y_mask: i32,
  pub x_inc: i32,
  pub y_inc: i32,
  pub fx: i32,
  pub fy: i32,
  pub x_start: i32,
  pub x_stop: i32,
  pub x_taps: i32,
  pub y_start: i32,
  pub y_stop: i32,
  pub y_taps: i32,
  pub x_dilate: bool,
  pub y_dilate: bool,
  pub deep: bool,
  pub drop: bool,
  pub batch: bool,
  pub ch_start: i32,
  pub ch_stop: i32,
  pub groups: GroupLayout,
  pub blocks: i32,
  pub wgt_addr: u64,
  pub wgt_end: u64,
  pub compressed: bool,
  pub compressed_bytes: u32,
  pub negate: u16,
  pub bf16: bool,
}

impl Geometry {
  /// Derive the activation side of a MAC.
  pub fn set_activation(&mut self, op: &ActOperand, params: &AcceleratorParams) {
    let flt = op.element.is_float();
    let fmt = op.format.shift();
    let start = op.start as u32;
    let range = op.range as u32;

    self.flt = flt;
    self.format_shift = fmt;
    self.act_addr = op.start & !(ACT_BLOCK_BYTES as u64 - 1);
    self.dy = u64::from(range & !(ACT_BLOCK_BYTES as u32 - 1));

    let ch_mask = (COLS as u32 - 1) << fmt;
    let ch_start = ((start & ch_mask) >> fmt) as i32;
    let ch_stop = ((range & ch_mask) >> fmt) as i32;

    let lsb = if flt { !1u32 } else { !0u32 };
    self.x_mask = (op.format.spatial(!range) & lsb) as i32;
    self.y_mask = (op.format.spatial(range) & lsb) as i32;
    self.x_inc = mask_inc(self.x_mask);
    self.y_inc = mask_inc(self.y_mask);

    self.blocks = 1;
    self.fx = start as i32 & self.x_mask;
    self.fy = start as i32 & self.y_mask;
    self.x_start = 0;
    self.x_stop = 0;
    self.x_taps = 0;
    self.y_start = 0;
    self.y_stop = 0;
    self.y_taps = 0;
    self.y_dilate = op.block == ActBlock::Dilate;
    self.batch = op.block == ActBlock::Batch;

    match op.block {
      ActBlock::Deep => {
        let dy = (range & !(ACT_BLOCK_BYTES as u32 - 1)) as i32;
        self.blocks = if dy < 0 { 0 } else { (dy >> 11) + 1 };
        self.y_taps = 1;
      },
      ActBlock::Block | ActBlock::Dilate | ActBlock::Batch => {
        self.y_stop = self.fy;
        self.y_taps = if self.y_mask != 0 && !self.batch {
          tap_count(self.fy, self.y_mask, self.y_inc)
        } else {
          1
        };
      },
      ActBlock::Above => {
        self.y_start = self.fy;
        self.y_stop = self.y_mask;
        self.y_taps = if self.y_mask != 0 {
          tap_count_above(self.fy, self.y_mask, self.y_inc)
        } else {
          1
        };
      },
      ActBlock::Single => {
        self.y_start = self.fy;
        self.y_stop = self.fy;
        self.y_taps = 1;
      },
    }

    let (groups, first, last) = GroupLayout::detect(ch_start, ch_stop, op.block == ActBlock::Deep);
    self.groups = groups;
    self.ch_start = first;
    self.ch_stop = last;
    if self.ch_start >= self.ch_stop && self.blocks == 1 {
      self.blocks = 0;
    }

    self.x_taps = if self.x_mask != 0 {
      tap_count(self.fx, self.x_mask, self.x_inc)
    } else {
      1
    };

    if op.block == ActBlock::Deep {
      let cap = if flt { params.fp_rows } else { ROWS };
      self.blocks = self.blocks.min(cap as i32);
    }
    if flt && !params.fp_present {
      self.blocks = 0;
    }
  }

  /// Derive the weight side of a MAC. Runs after `set_activation`.
  pub fn set_weights(&mut self, op: &WgtOperand, params: &AcceleratorParams) {
    let flt = self.flt;
    let start = op.start as u32;
    let range = op.range as u32;

    self.bf16 = (start >> 6) & 1 != 0 && params.fp_acc_exp >= 8;
    self.compressed = op.compressed();
    self.compressed_bytes = ((range & 0x7F) | 0xF).min(0x7F);

    let bits = op.unpack.bits();
    if !flt && bits < 8 && !(bits == 4 && op.output_scale == 2) {
      self.ch_start = 0;
      self.ch_stop = if self.groups.grouped { self.groups.size } else { COLS as i32 };
    }

    self.negate = if flt && start & 0x20 != 0 { 0x8000 } else { 0 };
    self.deep = false;
    self.x_dilate = op.block == WgtBlock::Dilate;
    self.drop = op.block == WgtBlock::Drop;

    match op.block {
      WgtBlock::Normal | WgtBlock::Dilate | WgtBlock::Drop => {
        self.x_stop = self.fx;
      },
      WgtBlock::Deep => {
        self.deep = true;
        self.fx = 0;
        self.x_stop = 0;
        self.x_taps = 1;
      },
      WgtBlock::After => {
        self.x_start = self.fx;
        self.x_stop = self.x_mask;
        self.x_taps = if self.x_mask != 0 {
          tap_count_above(self.fx, self.x_mask, self.x_inc)
        } else {
          1
        };
      },
      WgtBlock::Single => {
        self.x_taps = 1;
        self.x_start = self.fx;
        self.x_stop = self.fx;
      },
    }

    let wc = op.weight_count_log(flt);
    self.wgt_addr = op.start & !WGT_ROW_MASK;
    let mut end = self.wgt_addr.wrapping_add(op.range) | WGT_ROW_MASK;
    let limit = if self.compressed { WGT_LIMIT_BYTES } else { WGT_LIMIT_BYTES >> wc };
    if (op.range | WGT_ROW_MASK) >= limit {
      end = self.wgt_addr + limit - 1;
    }
    let per_step = if flt {
      2 * u64::from(params.fp_rate) * COLS as u64
    } else {
      4 * COLS as u64
    };
    let at_mac_limit = self.wgt_addr + ((params.step_limit(flt) * per_step) >> wc) - 1;
    if at_mac_limit < end && !self.compressed {
      end = at_mac_limit;
    }
    self.wgt_end = end;
  }

  pub fn y_tap_list(&self) -> Vec<i32> {
    tap_indices(self.y_start, self.y_stop, self.y_inc, self.y_mask | MASK_MSB, self.y_dilate)
  }

  pub fn x_tap_list(&self) -> Vec<i32> {
    tap_indices(self.x_start, self.x_stop, self.x_inc, self.x_mask | MASK_MSB, self.x_dilate)
  }
}

/// Output tile of a convert, read by the commit-time write-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTile {
  pub base: u64,
  pub dy: u64,
  pub element: ElementType,
  pub format_shift: u32,
  pub direction: CvtDirection,
  pub x_mask: i32,
  pub y_mask: i32,
  pub x_inc: i32,
  pub y_inc: i32,
  pub x_offset: i32,
  pub y_offset: i32,
  /// Accumulator x position of the first element at or after `x_offset`
  pub x_acc_offset: i32,
  /// 16x16 writes the upper output-channel half
  pub upper_half: bool,
}

impl OutputTile {
  pub fn new(op: &CvtOperand) -> Self {
    let start = op.start as u32;
    let range = op.range as u32;
    let tile_mask = ACT_BLOCK_BYTES as u64 - 1;
    let lsb = if op.element.is_float() { !1u32 } else { !0u32 };
    let x_mask = (op.format.spatial(!range) & lsb) as i32;
    let y_mask = (op.format.spatial(range) & lsb) as i32;
    let x_inc = mask_inc(x_mask);
    let x_offset = start as i32 & x_mask;

    let mut x_acc_offset = 0;
    if matches!(op.direction, CvtDirection::Before | CvtDirection::Both) && x_mask != 0 {
      let mask = x_mask | MASK_MSB;
      let mut x = x_offset;
      while x >= 0 {
        x_acc_offset = inc_masked(x_acc_offset, x_inc, mask);
        x = inc_masked(x, x_inc, mask);
      }
    }

    Self {
      base: op.start & !tile_mask,
      dy: u64::from(range & !(tile_mask as u32)),
      element: op.element,
      format_shift: op.format.shift(),
      direction: op.direction,
      x_mask,
      y_mask,
      x_inc,
      y_inc: mask_inc(y_mask),
      x_offset,
      y_offset: start as i32 & y_mask,
      x_acc_offset,
      upper_half: start & 0x40 != 0,
    }
  }
}
