//! Accelerator data model.
//!
//! Every array has a committed copy and a pending copy. Engine operations
//! read the committed copy and write the pending one; only `commit` moves
//! data across.

use std::io;
use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

use super::geometry::{Geometry, OutputTile};
use super::params::{AcceleratorParams, ACC_DEPTH, ACT_CACHE_BYTES, COLS, ROWS, WGT_CACHE_MAX, WGT_CHANNELS};
use super::regs::{BiasReg, CommitFlags, FpPolicy};
use super::types::AccKind;
use super::xfp::{Xfp, XfpUnit};

/// Dense row-major 2D array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid<T> {
  rows: usize,
  cols: usize,
  data: Vec<T>,
}

impl<T: Clone> Grid<T> {
  pub fn new(rows: usize, cols: usize, value: T) -> Self {
    Self {
      rows,
      cols,
      data: vec![value; rows * cols],
    }
  }

  pub fn fill(&mut self, value: T) {
    self.data.iter_mut().for_each(|v| *v = value.clone());
  }

  /// Overwrite every element from another grid of the same shape
  pub fn copy_from(&mut self, other: &Grid<T>) {
    self.data.clone_from(&other.data);
  }
}

impl<T> Grid<T> {
  pub fn rows(&self) -> usize {
    self.rows
  }

  pub fn cols(&self) -> usize {
    self.cols
  }

  pub fn get(&self, row: usize, col: usize) -> Option<&T> {
    if row < self.rows && col < self.cols {
      self.data.get(row * self.cols + col)
    } else {
      None
    }
  }

  pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
    if row < self.rows && col < self.cols {
      self.data.get_mut(row * self.cols + col)
    } else {
      None
    }
  }

  pub fn row_mut(&mut self, row: usize) -> &mut [T] {
    let start = row * self.cols;
    &mut self.data[start..start + self.cols]
  }

  pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
    self.data.iter_mut()
  }
}

impl<T> Index<(usize, usize)> for Grid<T> {
  type Output = T;

  fn index(&self, (row, col): (usize, usize)) -> &T {
    &self.data[row * self.cols + col]
  }
}

impl<T> IndexMut<(usize, usize)> for Grid<T> {
  fn index_mut(&mut self, (row, col): (usize, usize)) -> &mut T {
    &mut self.data[row * self.cols + col]
  }
}

/// Fixed-point accumulator cell.
///
/// Words 0 and 1 are the low halves of banks 0 and 1; words 2 and 3 hold
/// the high halves when redundant accumulation is in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedCell {
  pub w: [i32; 4],
}

impl FixedCell {
  pub fn clear_bank(&mut self, bank: usize) {
    self.w[bank & 1] = 0;
    self.w[(bank & 1) + 2] = 0;
  }

  /// Accumulated value of one bank. The redundant high half counts in
  /// units of 16.
  pub fn value(&self, bank: usize, params: &AcceleratorParams) -> i64 {
    let lo = self.w[bank & 1];
    if !params.redundant_acc() {
      return non_redundant_acc(lo, 0);
    }
    combine_redundant_acc(self.w[(bank & 1) + 2], lo, 0, params)
  }
}

/// Fold the high and low lanes of a split accumulator into one value.
///
/// The low lane is sign-extended from `accum_width` bits. An internal bias
/// seeded into both lanes is taken out once per lane, 17 times in all.
pub fn combine_redundant_acc(hi: i32, lo: i32, internal_bias: i32, params: &AcceleratorParams) -> i64 {
  let lo = i64::from(lo);
  let hi64 = i64::from(hi << 4);
  let lo64 = (lo & params.lo_mask()) - (lo & params.lo_msb());
  let bias64 = i64::from(internal_bias << 4) + i64::from(internal_bias);
  hi64 + lo64 - bias64
}

/// Value of a single-lane accumulator carrying one internal bias
pub fn non_redundant_acc(value: i32, internal_bias: i32) -> i64 {
  i64::from(value) - i64::from(internal_bias)
}

/// Float accumulator cell, one extended value per bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatCell {
  pub xfp: [Xfp; 2],
}

impl FloatCell {
  pub fn zeroed(unit: &XfpUnit) -> Self {
    let z = unit.zero();
    Self { xfp: [z, z] }
  }
}

/// Weight cache slot; an invalid slot multiplies as zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightEntry {
  pub wgt: u16,
  pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorState {
  pub accum_fixed: Grid<FixedCell>,
  pub future_fixed: Grid<FixedCell>,
  pub accum_float: Grid<FloatCell>,
  pub future_float: Grid<FloatCell>,
  /// `[bank][channel]`
  pub bias: Grid<BiasReg>,
  pub future_bias: Grid<BiasReg>,
  /// Convert result buffers, 12-bit fixed or 20-bit float codes
  pub cvt: [Grid<u32>; 2],
  /// Buffer holding the latest committed convert
  pub cvt_index: usize,
  /// `[stream position][channel]`
  pub weight_cache: Grid<WeightEntry>,
  pub act_cache: Vec<u8>,
  pub geometry: Geometry,
  pub output: Option<OutputTile>,
  pub commit_fixed: CommitFlags,
  pub commit_float: CommitFlags,
  pub current_fixed: usize,
  pub current_float: usize,
  pub bias_write_addr: u64,
  pub bias_write_bank: usize,
  pub limit_exceeded: bool,
  pub usr: FpPolicy,
}

impl AcceleratorState {
  pub fn new(params: &AcceleratorParams) -> Self {
    let unit = XfpUnit::new(params);
    let banks = params.num_bias_grps.max(1);
    Self {
      accum_fixed: Grid::new(ROWS, ACC_DEPTH, FixedCell::default()),
      future_fixed: Grid::new(ROWS, ACC_DEPTH, FixedCell::default()),
      accum_float: Grid::new(ROWS, ACC_DEPTH, FloatCell::zeroed(&unit)),
      future_float: Grid::new(ROWS, ACC_DEPTH, FloatCell::zeroed(&unit)),
      bias: Grid::new(banks, COLS, BiasReg::default()),
      future_bias: Grid::new(banks, COLS, BiasReg::default()),
      cvt: [Grid::new(ROWS, ACC_DEPTH, 0), Grid::new(ROWS, ACC_DEPTH, 0)],
      cvt_index: 0,
      weight_cache: Grid::new(WGT_CACHE_MAX, WGT_CHANNELS, WeightEntry::default()),
      act_cache: vec![0; ACT_CACHE_BYTES],
      geometry: Geometry::default(),
      output: None,
      commit_fixed: CommitFlags::default(),
      commit_float: CommitFlags::default(),
      current_fixed: 0,
      current_float: 0,
      bias_write_addr: 0,
      bias_write_bank: 0,
      limit_exceeded: false,
      usr: FpPolicy::default(),
    }
  }

  /// Zero the geometry and drop every pending flag. Committed arrays are
  /// left alone.
  pub fn reset(&mut self) {
    self.geometry = Geometry::default();
    self.output = None;
    self.commit_fixed.clear();
    self.commit_float.clear();
    self.limit_exceeded = false;
  }

  pub fn flags(&self, kind: AccKind) -> &CommitFlags {
    match kind {
      AccKind::Fixed => &self.commit_fixed,
      AccKind::Float => &self.commit_float,
    }
  }

  pub fn flags_mut(&mut self, kind: AccKind) -> &mut CommitFlags {
    match kind {
      AccKind::Fixed => &mut self.commit_fixed,
      AccKind::Float => &mut self.commit_float,
    }
  }

  pub fn current_bank(&self, kind: AccKind) -> usize {
    match kind {
      AccKind::Fixed => self.current_fixed,
      AccKind::Float => self.current_float,
    }
  }

  /// Start a pending accumulator epoch by copying the committed array,
  /// unless an earlier operation already did so.
  pub fn seed_future_acc(&mut self, kind: AccKind) {
    if self.flags(kind).has(CommitFlags::ACC_UPDATE) {
      return;
    }
    match kind {
      AccKind::Fixed => self.future_fixed.copy_from(&self.accum_fixed),
      AccKind::Float => self.future_float.copy_from(&self.accum_float),
    }
  }

  pub fn seed_future_bias(&mut self) {
    if !self.commit_fixed.has(CommitFlags::BIAS_UPDATE) {
      self.future_bias.copy_from(&self.bias);
    }
  }

  /// Start a pending convert epoch in the spare buffer.
  pub fn seed_cvt(&mut self) -> usize {
    let work = self.cvt_index ^ 1;
    let pending = self.commit_fixed.has(CommitFlags::CVT_UPDATE) || self.commit_float.has(CommitFlags::CVT_UPDATE);
    if !pending {
      let (a, b) = self.cvt.split_at_mut(1);
      if work == 1 {
        b[0].copy_from(&a[0]);
      } else {
        a[0].copy_from(&b[0]);
      }
    }
    work
  }

  /// Mark every cache slot from `from` on as invalid for `channels` lanes
  pub fn invalidate_weights(&mut self, from: usize, channels: usize) {
    for idx in from..WGT_CACHE_MAX {
      for ch in 0..channels.min(WGT_CHANNELS) {
        self.weight_cache[(idx, ch)].valid = false;
      }
    }
  }

  pub fn weight_valid(&self, idx: usize) -> bool {
    self.weight_cache.get(idx, 0).map(|e| e.valid).unwrap_or(false)
  }

  /// Serialize the whole state as an opaque blob
  pub fn checkpoint(&self) -> io::Result<Vec<u8>> {
    serde_json::to_vec(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("checkpoint failed: {}", e)))
  }

  pub fn restore(blob: &[u8]) -> io::Result<Self> {
    serde_json::from_slice(blob)
      .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("Failed to restore checkpoint: {}", e)))
  }
}
