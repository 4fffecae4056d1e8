use std::io;

use crate::arch::hmx::Memory;

/// Byte-addressed little-endian memory starting at address zero
#[derive(Debug, Clone)]
pub struct FlatMemory {
  data: Vec<u8>,
}

impl FlatMemory {
  pub fn new(size: usize) -> Self {
    Self { data: vec![0; size] }
  }

  pub fn size(&self) -> usize {
    self.data.len()
  }

  /// Copy `bytes` in at `addr`
  pub fn load(&mut self, addr: u64, bytes: &[u8]) -> io::Result<()> {
    let range = self.range(addr, bytes.len())?;
    self.data[range].copy_from_slice(bytes);
    Ok(())
  }

  pub fn slice(&self, addr: u64, len: usize) -> io::Result<&[u8]> {
    let range = self.range(addr, len)?;
    Ok(&self.data[range])
  }

  fn range(&self, addr: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
    let start = usize::try_from(addr).ok();
    match start.and_then(|s| s.checked_add(len).map(|e| (s, e))) {
      Some((s, e)) if e <= self.data.len() => Ok(s..e),
      _ => Err(io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("access of {} bytes at {:#x} outside {:#x} byte memory", len, addr, self.data.len()),
      )),
    }
  }
}

impl Memory for FlatMemory {
  fn read(&mut self, addr: u64, width: usize) -> io::Result<u64> {
    let range = self.range(addr, width)?;
    let mut buf = [0u8; 8];
    buf[..width.min(8)].copy_from_slice(&self.data[range][..width.min(8)]);
    Ok(u64::from_le_bytes(buf))
  }

  fn write(&mut self, addr: u64, width: usize, value: u64) -> io::Result<()> {
    let range = self.range(addr, width.min(8))?;
    self.data[range].copy_from_slice(&value.to_le_bytes()[..width.min(8)]);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// Accesses are little-endian
  #[test]
  fn test_little_endian() {
    let mut mem = FlatMemory::new(16);
    mem.write4(4, 0x1234_5678).unwrap();
    assert_eq!(mem.read1(4).unwrap(), 0x78);
    assert_eq!(mem.read2(6).unwrap(), 0x1234);
    assert_eq!(mem.slice(4, 4).unwrap(), &[0x78, 0x56, 0x34, 0x12]);
  }

  /// Out-of-range accesses fail with AddrNotAvailable
  #[test]
  fn test_out_of_range() {
    let mut mem = FlatMemory::new(16);
    assert_eq!(mem.read4(14).unwrap_err().kind(), io::ErrorKind::AddrNotAvailable);
    assert!(mem.write1(16, 0).is_err());
    assert!(mem.load(u64::MAX, &[1]).is_err());
    assert!(mem.read8(8).is_ok());
  }
}
