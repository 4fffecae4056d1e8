use hmx_engine::arch::hmx::mac::{fxp_mac, split_redundant};
use hmx_engine::arch::hmx::regs::FpPolicy;
use hmx_engine::arch::hmx::state::{combine_redundant_acc, non_redundant_acc};
use hmx_engine::arch::hmx::xfp::{CompactFormat, XfpUnit};
use hmx_engine::arch::hmx::{
  Accelerator, AcceleratorParams, ActBlock, ActOperand, CvtRs, ElementType, Format, Memory, MultiplyKind, Unpack,
  WgtBlock, WgtOperand,
};
use hmx_engine::simulator::memory::FlatMemory;
use proptest::prelude::*;

fn run_mac(params: AcceleratorParams, act: u8, wgts: [u8; 4]) -> Accelerator {
  let mut mem = FlatMemory::new(0x2000);
  for row in 0..64u64 {
    mem.load(row * 32, &[act; 4]).unwrap();
  }
  for c in 0..32u64 {
    mem.load(0x1000 + 4 * c, &wgts).unwrap();
  }
  let act_op = ActOperand {
    start: 0,
    range: 3,
    element: ElementType::Ub,
    format: Format::ChannelMajor,
    block: ActBlock::Block,
  };
  let wgt_op = WgtOperand {
    start: 0x1000,
    range: 127,
    block: WgtBlock::Normal,
    unpack: Unpack::Byte,
    multiply: MultiplyKind::Fxp,
    output_scale: 1,
    usr: 0,
  };
  let mut acc = Accelerator::new(params);
  acc.mac(&mut mem, &act_op, &wgt_op).unwrap();
  acc.commit(&mut mem).unwrap();
  assert_eq!(mem.read1(0).unwrap(), act);
  acc
}

proptest! {
  /// Splitting weights into nibble halves never changes the sum
  #[test]
  fn test_split_accumulation_matches_plain(pairs in prop::collection::vec((any::<u8>(), any::<u8>()), 1..64)) {
    let (mut plain, mut lo, mut hi) = (0i32, 0i32, 0i32);
    for (act, wgt) in pairs {
      let act = u16::from(act);
      plain = fxp_mac(plain, act, wgt as i8 as i16);
      let (l, h) = split_redundant(u16::from(wgt));
      lo = fxp_mac(lo, act, l as i16);
      hi = fxp_mac(hi, act, h as i16);
    }
    prop_assert_eq!((hi << 4) + lo, plain);
  }

  /// Folding split lanes matches the single-lane value for the same sum
  #[test]
  fn test_combine_matches_non_redundant(hi in -(1i32 << 20)..(1 << 20), lo in -(1i32 << 20)..(1 << 20), bias in -256i32..256) {
    let params = AcceleratorParams::default();
    let split = combine_redundant_acc(hi + bias, lo + bias, bias, &params);
    let single = non_redundant_acc(hi * 16 + lo + bias, bias);
    prop_assert_eq!(split, single);
  }

  /// Normal fp16 values survive a decode and re-encode unchanged
  #[test]
  fn test_fp16_round_trip(sign in any::<bool>(), exp in 1u16..31, frac in 0u16..0x400) {
    let unit = XfpUnit::new(&AcceleratorParams::default());
    let bits = (u16::from(sign) << 15) | (exp << 10) | frac;
    let policy = FpPolicy::all_enabled();
    let x = unit.from_compact(u32::from(bits), CompactFormat::FP16, XfpUnit::MULT_IN, true, policy);
    let packed = unit.to_compact(&x, 10, 5, CvtRs::default().with_relu(true), policy) >> 4;
    prop_assert_eq!(packed, u32::from(bits));
  }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(12))]

  /// Redundant and plain accumulator builds agree on every cell
  #[test]
  fn test_redundant_engine_equivalence(act in any::<u8>(), wgts in any::<[u8; 4]>()) {
    let redundant = run_mac(AcceleratorParams::default(), act, wgts);
    let plain = run_mac(AcceleratorParams { sub_cols: 1, ..AcceleratorParams::default() }, act, wgts);
    let expect: i64 = wgts.iter().map(|&w| i64::from(act) * i64::from(w as i8)).sum();
    for (row, col) in [(0, 0), (17, 5), (63, 31)] {
      prop_assert_eq!(redundant.fixed_value(row, col), Some(expect));
      prop_assert_eq!(plain.fixed_value(row, col), Some(expect));
    }
  }
}
