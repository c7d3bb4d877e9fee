/// Status Register
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    /// Get WIP (write in progress) bit.
    pub fn get_write_in_progress(&self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn get_write_enable_latch(&self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    /// Get the block protect bits as a value BP3..BP0.
    ///
    /// BP0 to BP2 are bits 2 to 4, BP3 is bit 6.
    pub fn get_block_protect(&self) -> u8 {
        ((self.0 >> 2) & 0b0111) | ((self.0 >> 3) & 0b1000)
    }

    /// True if any block protect bit is set.
    pub fn is_protected(&self) -> bool {
        self.get_block_protect() != 0
    }

    /// Get TB (top/bottom protection) bit.
    pub fn get_top_bottom(&self) -> bool {
        self.0 & 0b0010_0000 != 0
    }

    /// Get SRWD (status register write disable) bit.
    pub fn get_write_disable(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }
}

#[test]
fn test_status_bits() {
    let sr = StatusRegister(0b0000_0011);
    assert!(sr.get_write_in_progress());
    assert!(sr.get_write_enable_latch());
    assert!(!sr.is_protected());

    let sr = StatusRegister(0b1110_0100);
    assert!(!sr.get_write_in_progress());
    assert!(!sr.get_write_enable_latch());
    assert_eq!(sr.get_block_protect(), 0b1001);
    assert!(sr.get_top_bottom());
    assert!(sr.get_write_disable());
}
