//! Decoded operand records, one per instruction operand.

use serde::{Deserialize, Serialize};

use super::regs::CvtRs;
use super::types::{ActBlock, CvtDirection, ElementType, Format, MultiplyKind, Unpack, WgtBlock};

/// Activation tile.
///
/// The low bits of `start` carry the tile offsets and the first channel;
/// the low bits of `range` carry the spatial masks and the last channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActOperand {
  pub start: u64,
  pub range: u64,
  pub element: ElementType,
  pub format: Format,
  pub block: ActBlock,
}

/// Weight stream.
///
/// Bit 4 of `start` selects compressed mode, bit 5 negates float weights
/// and bit 6 selects bf16 inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WgtOperand {
  pub start: u64,
  pub range: u64,
  pub block: WgtBlock,
  pub unpack: Unpack,
  pub multiply: MultiplyKind,
  /// 1, or 2 when a nibble stream feeds both output channel halves
  pub output_scale: u32,
  /// Raw user status word; only the float policy bits are read
  pub usr: u32,
}

impl WgtOperand {
  /// Log2 of packed weights per byte, reduced by the output scale
  pub fn weight_count_log(&self, flt: bool) -> u32 {
    if flt {
      return 0;
    }
    let log = (self.unpack.weights_per_word() / 4).max(1).trailing_zeros();
    if self.output_scale == 2 {
      log.saturating_sub(1)
    } else {
      log
    }
  }

  pub fn compressed(&self) -> bool {
    self.start & 0x10 != 0
  }
}

/// Convert and output tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CvtOperand {
  pub start: u64,
  pub range: u64,
  pub element: ElementType,
  pub format: Format,
  pub direction: CvtDirection,
  pub rs: CvtRs,
  /// Raw user status word; only the float policy bits are read
  pub usr: u32,
  /// Convert the high sub-lane of an 8x4 accumulator
  pub subchannel_hi: bool,
}

impl CvtOperand {
  pub fn feedback(&self) -> bool {
    self.rs.fb_dst() != 0
  }
}
