//! Packed control registers.
//!
//! Every register is a plain unsigned word with explicit field accessors,
//! so the bit layout never depends on compiler bitfield packing.

use serde::{Deserialize, Serialize};

#[inline]
fn field(word: u32, lo: u32, width: u32) -> u32 {
  (word >> lo) & ((1u32 << width) - 1)
}

#[inline]
fn with_field(word: u32, lo: u32, width: u32, value: u32) -> u32 {
  let mask = ((1u32 << width) - 1) << lo;
  (word & !mask) | ((value << lo) & mask)
}

/// One bias register slot: two words, read either as a fixed-point bias or
/// as a floating-point bias.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiasReg {
  pub word0: u32,
  pub word1: u32,
}

impl BiasReg {
  pub fn new(word0: u32, word1: u32) -> Self {
    Self { word0, word1 }
  }

  pub fn fixed(self) -> FixedBias {
    FixedBias(self)
  }

  pub fn float(self) -> FloatBias {
    FloatBias(self)
  }
}

/// Fixed-point view of a bias slot
#[derive(Debug, Clone, Copy)]
pub struct FixedBias(BiasReg);

impl FixedBias {
  pub fn sig(&self) -> u32 {
    field(self.0.word0, 0, 10)
  }
  pub fn exp(&self) -> u32 {
    field(self.0.word0, 10, 5)
  }
  pub fn sigmsb(&self) -> u32 {
    field(self.0.word0, 15, 1)
  }
  pub fn zeroneg(&self) -> u32 {
    field(self.0.word0, 16, 1)
  }
  pub fn zeropos(&self) -> u32 {
    field(self.0.word0, 17, 1)
  }
  pub fn negate(&self) -> u32 {
    field(self.0.word0, 18, 1)
  }
  pub fn siglsb(&self) -> u32 {
    field(self.0.word0, 19, 1)
  }
  pub fn rnd_bit(&self) -> u32 {
    field(self.0.word0, 22, 1)
  }
  pub fn bias0(&self) -> u32 {
    field(self.0.word0, 23, 3)
  }
  pub fn bias1(&self) -> u32 {
    field(self.0.word0, 26, 6)
  }
  pub fn bias32(&self) -> i32 {
    self.0.word1 as i32
  }

  /// 3-bit rectify policy code
  pub fn zeroing(&self) -> u32 {
    (self.negate() << 2) | (self.zeropos() << 1) | self.zeroneg()
  }

  /// Output bias with the rounding bit folded in
  pub fn out_bias(&self) -> u32 {
    (((self.bias1() << 1) | self.rnd_bit()) << 3) | self.bias0()
  }

  /// 12-bit scale with implicit leading one
  pub fn scale(&self) -> u32 {
    ((((self.sigmsb() ^ 1) << 10) + self.sig()) << 1) + self.siglsb()
  }
}

/// Floating-point view of a bias slot
#[derive(Debug, Clone, Copy)]
pub struct FloatBias(BiasReg);

impl FloatBias {
  pub fn scale(&self) -> u32 {
    field(self.0.word0, 0, 16)
  }
  pub fn out_bias(&self) -> u32 {
    field(self.0.word0, 16, 16)
  }
  pub fn scale_extra(&self) -> u32 {
    field(self.0.word1, 0, 4)
  }
  pub fn out_bias_extra(&self) -> u32 {
    field(self.0.word1, 4, 4)
  }
  pub fn in_shape(&self) -> u32 {
    field(self.0.word1, 8, 3)
  }
  pub fn acc_bias_extra(&self) -> u32 {
    field(self.0.word1, 11, 5)
  }
  pub fn acc_bias(&self) -> u32 {
    field(self.0.word1, 16, 16)
  }
}

/// Feedback destination of a convert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback {
  None,
  OutBias,
  Scale,
}

/// Convert control register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CvtRs(pub u32);

impl CvtRs {
  pub fn acc_clear(&self) -> bool {
    field(self.0, 0, 1) != 0
  }
  pub fn relu(&self) -> bool {
    field(self.0, 1, 1) != 0
  }
  pub fn fb_dst(&self) -> u32 {
    field(self.0, 2, 2)
  }
  pub fn fb_limit(&self) -> bool {
    field(self.0, 4, 1) != 0
  }
  pub fn fp_ovf(&self) -> bool {
    field(self.0, 6, 1) != 0
  }
  /// 0 selects fp16 output, 1 bf16
  pub fn fp_type(&self) -> u32 {
    field(self.0, 7, 1)
  }
  pub fn fp_rnd(&self) -> u32 {
    field(self.0, 8, 1)
  }
  pub fn fxp16_ch_sel(&self) -> u32 {
    field(self.0, 9, 2)
  }
  pub fn bias_sel(&self) -> usize {
    field(self.0, 11, 2) as usize
  }

  pub fn feedback(&self) -> Feedback {
    match self.fb_dst() {
      1 => Feedback::OutBias,
      2 => Feedback::Scale,
      _ => Feedback::None,
    }
  }

  pub fn with_acc_clear(self, on: bool) -> Self {
    Self(with_field(self.0, 0, 1, on as u32))
  }
  pub fn with_relu(self, on: bool) -> Self {
    Self(with_field(self.0, 1, 1, on as u32))
  }
  pub fn with_feedback(self, dst: u32, limit: bool) -> Self {
    Self(with_field(with_field(self.0, 2, 2, dst), 4, 1, limit as u32))
  }
  pub fn with_fp_type(self, bf16: bool) -> Self {
    Self(with_field(self.0, 7, 1, bf16 as u32))
  }
  pub fn with_fp_rnd(self, on: bool) -> Self {
    Self(with_field(self.0, 8, 1, on as u32))
  }
  pub fn with_ch_sel(self, sel: u32) -> Self {
    Self(with_field(self.0, 9, 2, sel))
  }
  pub fn with_bias_sel(self, bank: u32) -> Self {
    Self(with_field(self.0, 11, 2, bank))
  }
}

/// Floating-point control bits taken from the user status register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpPolicy {
  pub inf_nan_enable: bool,
  pub nan_propagate: bool,
}

impl FpPolicy {
  pub fn from_usr(usr: u32) -> Self {
    Self {
      inf_nan_enable: field(usr, 0, 1) != 0,
      nan_propagate: field(usr, 1, 1) != 0,
    }
  }

  pub fn all_enabled() -> Self {
    Self { inf_nan_enable: true, nan_propagate: true }
  }
}

/// Pending commit work for one accumulator kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitFlags(u32);

impl CommitFlags {
  pub const CVT_WRITE: u32 = 1 << 0;
  pub const ACC_CLEAR_BOTH: u32 = 1 << 1;
  pub const ACC_CLEAR: u32 = 1 << 2;
  pub const SWAP_ACC: u32 = 1 << 3;
  pub const ACC_UPDATE: u32 = 1 << 4;
  pub const BIAS_UPDATE: u32 = 1 << 5;
  const BIAS_WRITE_LO: u32 = 6;
  pub const CVT_UPDATE: u32 = 1 << 8;
  pub const CVT_ADVANCE: u32 = 1 << 9;

  pub fn bits(&self) -> u32 {
    self.0
  }

  pub fn has(&self, flag: u32) -> bool {
    self.0 & flag != 0
  }

  pub fn set(&mut self, flag: u32, on: bool) {
    if on {
      self.0 |= flag;
    } else {
      self.0 &= !flag;
    }
  }

  /// Words per slot to store at commit: 0, 1 or 2
  pub fn bias_write(&self) -> u32 {
    field(self.0, Self::BIAS_WRITE_LO, 2)
  }

  pub fn set_bias_write(&mut self, words: u32) {
    self.0 = with_field(self.0, Self::BIAS_WRITE_LO, 2, words);
  }

  pub fn is_empty(&self) -> bool {
    self.0 == 0
  }

  pub fn clear(&mut self) {
    self.0 = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Fixed bias fields decode from their documented positions
  #[test]
  fn test_fixed_bias_fields() {
    let word0 = 0x3FF | (0x1F << 10) | (1 << 17) | (1 << 19) | (1 << 22) | (5 << 23) | (0x2A << 26);
    let b = BiasReg::new(word0, 0xFFFF_FF00).fixed();
    assert_eq!(b.sig(), 0x3FF);
    assert_eq!(b.exp(), 0x1F);
    assert_eq!(b.sigmsb(), 0);
    assert_eq!(b.zeroing(), 0b010);
    assert_eq!(b.bias0(), 5);
    assert_eq!(b.bias1(), 0x2A);
    assert_eq!(b.out_bias(), (((0x2A << 1) | 1) << 3) | 5);
    assert_eq!(b.scale(), (((1 << 10) + 0x3FF) << 1) + 1);
    assert_eq!(b.bias32(), -256);
  }

  /// A bias of 24 << 10 is exponent 24 with an implicit unit scale
  #[test]
  fn test_fixture_bias() {
    let b = BiasReg::new(24 << 10, 0).fixed();
    assert_eq!(b.exp(), 24);
    assert_eq!(b.scale(), 1 << 11);
    assert_eq!(b.zeroing(), 0);
    assert_eq!(b.out_bias(), 0);
  }

  /// Float bias sub-fields split across both words
  #[test]
  fn test_float_bias_fields() {
    let b = BiasReg::new(0xABCD_1234, 0xBEEF_0000 | (0x15 << 11) | (2 << 8) | 0x96).float();
    assert_eq!(b.scale(), 0x1234);
    assert_eq!(b.out_bias(), 0xABCD);
    assert_eq!(b.scale_extra(), 0x6);
    assert_eq!(b.out_bias_extra(), 0x9);
    assert_eq!(b.in_shape(), 2);
    assert_eq!(b.acc_bias_extra(), 0x15);
    assert_eq!(b.acc_bias(), 0xBEEF);
  }

  /// Builders and accessors agree on every convert control field
  #[test]
  fn test_cvt_rs_fields() {
    let rs = CvtRs::default()
      .with_relu(true)
      .with_feedback(2, true)
      .with_fp_type(true)
      .with_ch_sel(3)
      .with_bias_sel(2);
    assert!(rs.relu());
    assert!(!rs.acc_clear());
    assert_eq!(rs.feedback(), Feedback::Scale);
    assert!(rs.fb_limit());
    assert_eq!(rs.fp_type(), 1);
    assert_eq!(rs.fp_rnd(), 0);
    assert_eq!(rs.fxp16_ch_sel(), 3);
    assert_eq!(rs.bias_sel(), 2);
  }

  /// Commit flags set and clear independently
  #[test]
  fn test_commit_flags() {
    let mut f = CommitFlags::default();
    assert!(f.is_empty());
    f.set(CommitFlags::ACC_UPDATE, true);
    f.set_bias_write(2);
    assert!(f.has(CommitFlags::ACC_UPDATE));
    assert!(!f.has(CommitFlags::SWAP_ACC));
    assert_eq!(f.bias_write(), 2);
    f.set(CommitFlags::ACC_UPDATE, false);
    assert_eq!(f.bits(), 2 << 6);
    f.clear();
    assert!(f.is_empty());
  }

  /// User status bits map to the float policy
  #[test]
  fn test_fp_policy() {
    assert_eq!(FpPolicy::from_usr(0b11), FpPolicy::all_enabled());
    assert!(!FpPolicy::from_usr(0b10).inf_nan_enable);
    assert!(FpPolicy::from_usr(0b10).nan_propagate);
  }
}
