use serde::{Deserialize, Serialize};

/// Spatial rows held by the accumulator array
pub const ROWS: usize = 64;
/// Output channels per accumulator row
pub const COLS: usize = 32;
/// Accumulator storage depth (two output-channel halves)
pub const ACC_DEPTH: usize = 2 * COLS;
/// Weight cache stream positions
pub const WGT_CACHE_MAX: usize = 2048;
/// Weight cache channel slots (output channel scale 2 uses the upper half)
pub const WGT_CHANNELS: usize = 2 * COLS;
/// One spatial block of activations, in bytes
pub const ACT_BLOCK_BYTES: usize = ROWS * COLS;
/// Two blocks fit in the activation cache
pub const ACT_CACHE_BYTES: usize = 2 * ACT_BLOCK_BYTES;
/// Bit position of the channel field inside a linear tile address
pub const CHANNEL_SIZE_LOG: u32 = 5;
/// Spatial bits of a channel-major address
pub const SPATIAL_MASK_CM: u32 = 0x7E0;
/// Spatial bits of a spatial-major address
pub const SPATIAL_MASK_SM: u32 = 0x7C1;

/// Hardware build parameters of one accelerator unit.
///
/// Row and column counts are fixed by the storage layout above; everything
/// else can be changed through configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceleratorParams {
  pub fp_rows: usize,
  pub rate: u32,
  pub fp_rate: u32,
  pub sub_cols: u32,
  pub accum_width: u32,
  pub cvt_width: u32,
  pub fp_acc_int: i32,
  pub fp_acc_frac: i32,
  pub fp_acc_exp: i32,
  pub fp_acc_norm: i32,
  pub parallel_grps: u32,
  pub num_bias_grps: usize,
  pub fp_present: bool,
  pub xfp_inexact_enable: bool,
  pub xfp_cvt_int: i32,
  pub xfp_cvt_frac: i32,
  pub legacy: bool,
  /// Elementary MAC dispatch budget per `mac` call; `None` derives it
  pub mac_budget: Option<u64>,
}

impl Default for AcceleratorParams {
  fn default() -> Self {
    Self {
      fp_rows: 32,
      rate: 16,
      fp_rate: 8,
      sub_cols: 2,
      accum_width: 32,
      cvt_width: 12,
      fp_acc_int: 8,
      fp_acc_frac: 22,
      fp_acc_exp: 7,
      fp_acc_norm: 3,
      parallel_grps: 4,
      num_bias_grps: 4,
      fp_present: true,
      xfp_inexact_enable: true,
      xfp_cvt_int: 3,
      xfp_cvt_frac: 13,
      legacy: false,
      mac_budget: None,
    }
  }
}

impl AcceleratorParams {
  /// Redundant (split nibble) accumulation is built in when more than one
  /// sub-column exists.
  pub fn redundant_acc(&self) -> bool {
    self.sub_cols > 1
  }

  pub fn lo_msb(&self) -> i64 {
    1i64 << (self.accum_width - 1)
  }

  pub fn lo_mask(&self) -> i64 {
    self.lo_msb() - 1
  }

  pub fn parallel_group_size(&self) -> u32 {
    COLS as u32 / self.parallel_grps.max(1)
  }

  /// Channel steps one `mac` call may take before it is throttled.
  pub fn step_limit(&self, flt: bool) -> u64 {
    if flt {
      1024 / u64::from(self.fp_rate.max(1))
    } else {
      512
    }
  }

  /// Elementary dispatch budget for one `mac` call.
  pub fn dispatch_budget(&self, flt: bool) -> u64 {
    match self.mac_budget {
      Some(budget) => budget,
      None => {
        let stride = if flt { u64::from(self.fp_rate) } else { 4 };
        self.step_limit(flt) * stride * ROWS as u64 * COLS as u64
      },
    }
  }
}
