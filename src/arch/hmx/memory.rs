use std::io;

/// Physical memory as seen by the accelerator.
///
/// Accesses are little-endian and synchronous. Faults are reported by the
/// implementation and passed through the engine untouched.
pub trait Memory {
  /// Read `width` bytes (1, 2, 4 or 8) at `addr`
  fn read(&mut self, addr: u64, width: usize) -> io::Result<u64>;

  /// Write the low `width` bytes of `value` at `addr`
  fn write(&mut self, addr: u64, width: usize, value: u64) -> io::Result<()>;

  fn read1(&mut self, addr: u64) -> io::Result<u8> {
    Ok(self.read(addr, 1)? as u8)
  }

  fn read2(&mut self, addr: u64) -> io::Result<u16> {
    Ok(self.read(addr, 2)? as u16)
  }

  fn read4(&mut self, addr: u64) -> io::Result<u32> {
    Ok(self.read(addr, 4)? as u32)
  }

  fn read8(&mut self, addr: u64) -> io::Result<u64> {
    self.read(addr, 8)
  }

  fn write1(&mut self, addr: u64, value: u8) -> io::Result<()> {
    self.write(addr, 1, u64::from(value))
  }

  fn write2(&mut self, addr: u64, value: u16) -> io::Result<()> {
    self.write(addr, 2, u64::from(value))
  }

  fn write4(&mut self, addr: u64, value: u32) -> io::Result<()> {
    self.write(addr, 4, u64::from(value))
  }
}
