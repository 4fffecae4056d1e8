use serde::{Deserialize, Serialize};

use super::params::{SPATIAL_MASK_CM, SPATIAL_MASK_SM};

/// Accumulator kind; fixed and float arrays commit independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccKind {
  Fixed,
  Float,
}

/// Output element type of a convert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
  Ub = 0,
  B = 1,
  Ub4 = 2,
  Uh = 3,
  Fp16 = 4,
  UhUh = 5,
}

impl ElementType {
  pub fn from_raw(raw: u32) -> Option<Self> {
    match raw {
      0 => Some(Self::Ub),
      1 => Some(Self::B),
      2 => Some(Self::Ub4),
      3 => Some(Self::Uh),
      4 => Some(Self::Fp16),
      5 => Some(Self::UhUh),
      _ => None,
    }
  }

  pub fn is_float(self) -> bool {
    self == Self::Fp16
  }

  pub fn acc_kind(self) -> AccKind {
    if self.is_float() {
      AccKind::Float
    } else {
      AccKind::Fixed
    }
  }

  pub fn output_stride(self) -> usize {
    match self {
      Self::UhUh => 2,
      _ => 1,
    }
  }

  pub fn spatial_stride(self) -> usize {
    match self {
      Self::Uh | Self::Fp16 | Self::UhUh => 2,
      _ => 1,
    }
  }
}

/// Weight unpack strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unpack {
  Byte,
  SignMag,
  Nibble,
  Crumb,
  SignedCrumb,
  Bit,
  SignedBit,
  None,
}

impl Unpack {
  /// Bits consumed per logical weight
  pub fn bits(self) -> u32 {
    match self {
      Self::Byte | Self::SignMag => 8,
      Self::Nibble => 4,
      Self::Crumb | Self::SignedCrumb => 2,
      Self::Bit | Self::SignedBit => 1,
      Self::None => 0,
    }
  }

  /// Logical weights per 32-bit word
  pub fn weights_per_word(self) -> u32 {
    match self.bits() {
      0 => 2,
      bits => 32 / bits,
    }
  }

  /// Extract one weight starting at `shift` from a packed byte
  pub fn apply(self, packed: i8, shift: u32) -> i8 {
    let p = packed as i32;
    match self {
      Self::Byte | Self::None => packed,
      Self::SignMag => (((p >> 7) & 0x7F) ^ p) as i8,
      Self::Nibble => (((p >> shift) << 28) >> 28) as i8,
      Self::Crumb => (((p >> shift) << 30) >> 30) as i8,
      Self::SignedCrumb => {
        let out = ((p >> shift) << 30) >> 30;
        if out >= 0 {
          (2 - out) as i8
        } else {
          out as i8
        }
      },
      Self::Bit => ((p >> shift) & 1) as i8,
      Self::SignedBit => {
        if (p >> shift) & 1 != 0 {
          -1
        } else {
          1
        }
      },
    }
  }
}

/// Multiply datapath
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplyKind {
  Fxp,
  FxpSubbyte,
  Xfp,
}

/// Tile address layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
  ChannelMajor = 0,
  SpatialMajor = 1,
}

impl Format {
  /// Format bit, used as a channel shift
  pub fn shift(self) -> u32 {
    self as u32
  }

  pub fn spatial_mask(self) -> u32 {
    match self {
      Self::ChannelMajor => SPATIAL_MASK_CM,
      Self::SpatialMajor => SPATIAL_MASK_SM,
    }
  }

  pub fn spatial(self, value: u32) -> u32 {
    value & self.spatial_mask()
  }
}

/// Activation operand block type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActBlock {
  Block,
  Deep,
  Above,
  Single,
  Dilate,
  Batch,
}

/// Weight operand block type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WgtBlock {
  Normal,
  Deep,
  After,
  Single,
  Dilate,
  Drop,
}

/// Which part of the x range a convert writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CvtDirection {
  Before,
  After,
  Both,
}
