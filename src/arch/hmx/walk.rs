//! MAC traversal order.
//!
//! The walk visits blocks, y taps, deep halves, x taps, input channel
//! steps, groups, channels within a group and finally every intra-tile
//! position. It also tracks the weight stream cursor, which restarts per
//! group and advances once per channel.

use super::geometry::{intra_indices, Geometry};
use super::params::{AcceleratorParams, COLS};

/// Loop bounds of one MAC, fixed before the first point.
#[derive(Debug, Clone)]
pub struct WalkPlan {
  pub blocks: i32,
  pub y_taps: Vec<i32>,
  pub x_taps: Vec<i32>,
  pub intra_y: Vec<i32>,
  pub intra_x: Vec<i32>,
  pub deep_blocks: i32,
  pub format_shift: u32,
  pub ch_start_first: i32,
  pub ch_end_last: i32,
  pub input_channels: i32,
  pub ch_stride: i32,
  pub rate_stride: i32,
  pub group_size: i32,
  pub group_count: i32,
  pub parallel_group_size: i32,
  pub flt: bool,
  pub fp_rate: i32,
}

impl WalkPlan {
  pub fn new(geo: &Geometry, params: &AcceleratorParams) -> Self {
    let fmt = geo.format_shift;
    let ch_stride = 1 << fmt;
    let fp_rate = params.fp_rate as i32;
    let group_size = geo.groups.size;
    let parallel_group_size = params.parallel_group_size() as i32;
    let rate_stride = if geo.flt && fp_rate == 2 && group_size <= parallel_group_size / 2 {
      fp_rate * ch_stride
    } else if geo.flt && fp_rate == 8 {
      fp_rate * ch_stride
    } else {
      4 * ch_stride
    };
    Self {
      blocks: geo.blocks,
      y_taps: geo.y_tap_list(),
      x_taps: geo.x_tap_list(),
      intra_y: intra_indices(geo.y_mask),
      intra_x: intra_indices(geo.x_mask),
      deep_blocks: if geo.deep { 2 } else { 1 },
      format_shift: fmt,
      ch_start_first: geo.ch_start << fmt,
      ch_end_last: geo.ch_stop << fmt,
      input_channels: ((COLS as i32) << fmt) / geo.groups.count.max(1),
      ch_stride,
      rate_stride,
      group_size,
      group_count: geo.groups.count,
      parallel_group_size,
      flt: geo.flt,
      fp_rate,
    }
  }

  fn fp8(&self) -> bool {
    self.flt && self.fp_rate == 8
  }

  fn last_block(&self, block: i32) -> bool {
    block + 1 >= self.blocks
  }

  /// Input channel range `[start, end)` of a block, in scaled units
  pub fn channel_range(&self, block: i32) -> (i32, i32) {
    let mut end = if self.last_block(block) { self.ch_end_last } else { self.input_channels };
    let mut start = if block == 0 { self.ch_start_first } else { 0 };
    if self.fp8() {
      let align = 0xfff8 << self.format_shift;
      start &= align;
      end = if end & 0x1f > 0 { (end + 32) & align } else { end & align };
    }
    (start, end)
  }

  /// Channel range `[start, stop)` of one group at input step `ch`
  fn group_bounds(&self, ch: i32, group: i32, end: i32) -> (i32, i32) {
    let fmt = self.format_shift;
    let start = ch + (group << fmt) * self.group_size;
    let clipped = (group << fmt) * self.group_size + (self.group_size << fmt).min(end);
    let mut stop = start + 4 * self.ch_stride;
    if self.flt && self.fp_rate == 2 && self.group_size <= self.parallel_group_size / 2 {
      stop = start + self.fp_rate * self.ch_stride;
    } else if self.fp8() && self.group_size > 4 {
      stop = start + self.fp_rate * self.ch_stride;
    } else if self.fp8() {
      stop = clipped;
    }
    if self.group_size < 4 {
      stop = clipped;
    }
    (start, stop)
  }

  /// Last input channel of a block for float rate 8 zero insertion
  fn fp8_stop(&self, block: i32, end: i32) -> i32 {
    let end = if self.last_block(block) { self.ch_end_last } else { end };
    end >> self.format_shift
  }

  /// Whether finishing `raw_channel` moves the weight stream on
  fn advances_weights(&self, raw_channel: i32, group: i32, fp8_stop: i32) -> bool {
    !(self.fp8() && raw_channel - group * self.group_size >= fp8_stop && self.group_size > 4)
  }

  /// Output channel range `[start, end)` fed by a group
  pub fn output_range(&self, group: i32) -> (usize, usize) {
    let (start, end) = if self.flt && self.group_size <= self.parallel_group_size / 2 {
      let per = self.parallel_group_size / self.group_size;
      let start = (group / per) * self.parallel_group_size;
      (start, start + self.parallel_group_size)
    } else {
      let start = group * self.group_size;
      (start, start + self.group_size)
    };
    (start.max(0) as usize, end.clamp(0, COLS as i32) as usize)
  }
}

/// One point of the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacPoint {
  pub block: i32,
  pub y_ord: usize,
  pub y_tap: i32,
  pub deep_block: i32,
  pub x_ord: usize,
  pub x_tap: i32,
  /// Input channel in scaled units
  pub channel: i32,
  pub raw_channel: i32,
  pub group: i32,
  pub intra_y: i32,
  pub intra_x: i32,
  pub wgt_idx: usize,
  pub fp8_stop: i32,
}

/// Lazy iterator over every MAC point of a plan.
pub struct TileWalk<'a> {
  plan: &'a WalkPlan,
  block: i32,
  y: usize,
  deep: i32,
  x: usize,
  ch: i32,
  ch_start: i32,
  ch_end: i32,
  group: i32,
  group_stop: i32,
  ch2: i32,
  iy: usize,
  ix: usize,
  wgt: usize,
  saved_wgt: usize,
  started: bool,
  done: bool,
}

impl<'a> TileWalk<'a> {
  pub fn new(plan: &'a WalkPlan) -> Self {
    Self {
      plan,
      block: 0,
      y: 0,
      deep: 0,
      x: 0,
      ch: 0,
      ch_start: 0,
      ch_end: 0,
      group: 0,
      group_stop: 0,
      ch2: 0,
      iy: 0,
      ix: 0,
      wgt: 0,
      saved_wgt: 0,
      started: false,
      done: false,
    }
  }

  /// Weight stream position the walk has reached
  pub fn wgt_cursor(&self) -> usize {
    self.wgt
  }

  fn begin_block(&mut self) {
    if self.block >= self.plan.blocks {
      self.done = true;
      return;
    }
    let (start, end) = self.plan.channel_range(self.block);
    self.ch_start = start;
    self.ch_end = end;
    self.y = 0;
    self.begin_y();
  }

  fn begin_y(&mut self) {
    self.deep = 0;
    self.begin_deep();
  }

  fn begin_deep(&mut self) {
    self.x = 0;
    self.begin_x();
  }

  fn begin_x(&mut self) {
    self.ch = self.ch_start;
    self.begin_ch();
  }

  fn begin_ch(&mut self) {
    self.saved_wgt = self.wgt;
    self.group = 0;
    self.begin_group();
  }

  fn begin_group(&mut self) {
    self.wgt = self.saved_wgt;
    let (start, stop) = self.plan.group_bounds(self.ch, self.group, self.ch_end);
    self.ch2 = start;
    self.group_stop = stop;
    self.iy = 0;
    self.ix = 0;
  }

  /// Carry overflowed counters outward until a valid point or the end.
  fn settle(&mut self) -> bool {
    let plan = self.plan;
    loop {
      if self.done {
        return false;
      }
      if self.y >= plan.y_taps.len() {
        self.block += 1;
        self.begin_block();
      } else if self.deep >= plan.deep_blocks {
        self.y += 1;
        self.begin_y();
      } else if self.x >= plan.x_taps.len() {
        self.deep += 1;
        self.begin_deep();
      } else if self.ch >= self.ch_end {
        self.x += 1;
        self.begin_x();
      } else if self.group >= plan.group_count {
        self.ch += plan.rate_stride;
        self.begin_ch();
      } else if self.ch2 >= self.group_stop {
        self.group += 1;
        if self.group < plan.group_count {
          self.begin_group();
        }
      } else if self.iy >= plan.intra_y.len() {
        let raw = self.ch2 >> plan.format_shift;
        if plan.advances_weights(raw, self.group, plan.fp8_stop(self.block, self.ch_end)) {
          self.wgt += 1;
        }
        self.ch2 += plan.ch_stride;
        self.iy = 0;
        self.ix = 0;
      } else if self.ix >= plan.intra_x.len() {
        self.iy += 1;
        self.ix = 0;
      } else {
        return true;
      }
    }
  }

  fn point(&self) -> MacPoint {
    let plan = self.plan;
    MacPoint {
      block: self.block,
      y_ord: self.y,
      y_tap: plan.y_taps[self.y],
      deep_block: self.deep,
      x_ord: self.x,
      x_tap: plan.x_taps[self.x],
      channel: self.ch2,
      raw_channel: self.ch2 >> plan.format_shift,
      group: self.group,
      intra_y: plan.intra_y[self.iy],
      intra_x: plan.intra_x[self.ix],
      wgt_idx: self.wgt,
      fp8_stop: plan.fp8_stop(self.block, self.ch_end),
    }
  }
}

impl Iterator for TileWalk<'_> {
  type Item = MacPoint;

  fn next(&mut self) -> Option<MacPoint> {
    if !self.started {
      self.started = true;
      self.begin_block();
    } else {
      self.ix += 1;
    }
    if self.settle() {
      Some(self.point())
    } else {
      None
    }
  }
}
