//! Guards and the bit arithmetic shared by every walker of the tree.
//!
//! All helpers in here are total: shifting by the full address width yields zero instead of overflowing, so
//! callers can pass an `l2g` of [`ADDR_BITS`] without special casing it.

use crate::{ADDR_BITS, GUARD_MATCH_BITS, PAGE_ADDR_BITS};
use core::fmt::{Debug, Formatter};
use thiserror_no_std::Error;

/// Keep only the bits of `value` below position `bits`
pub const fn low_bits(value: u64, bits: u8) -> u64 {
    if bits >= ADDR_BITS {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

/// Clear all bits of `value` below position `bits`
pub const fn high_bits(value: u64, bits: u8) -> u64 {
    if bits >= ADDR_BITS {
        0
    } else {
        value & !((1u64 << bits) - 1)
    }
}

/// Return the bits of `value` from position `bits` upwards, shifted down to position 0
pub const fn shift_down(value: u64, bits: u8) -> u64 {
    if bits >= ADDR_BITS {
        0
    } else {
        value >> bits
    }
}

/// Shift `value` up so that it starts at bit position `bits`
pub const fn shift_up(value: u64, bits: u8) -> u64 {
    if bits >= ADDR_BITS {
        0
    } else {
        value << bits
    }
}

/// The smallest power-of-two size (in bits, but never below one page) large enough to contain `offset`
pub const fn l2_offset(offset: u64) -> u8 {
    let mut size = PAGE_ADDR_BITS;
    while size < ADDR_BITS && (1u64 << size) <= offset {
        size += 1;
    }
    size
}

/// Round `value` up to the next multiple of `multiple`
pub const fn round_up(value: u8, multiple: u8) -> u8 {
    value.div_ceil(multiple) * multiple
}

/// Whether `guard` and `offset` agree on every bit from position `bit` upwards
pub const fn matches_above(guard: u64, offset: u64, bit: u8) -> bool {
    high_bits(guard ^ offset, bit) == 0
}

/// Split `addr` into the slot index selected by a GPT with the given `l2v` and the offset within that slot
pub const fn split_address(addr: u64, l2v: u8) -> (u64, u64) {
    (shift_down(addr, l2v), low_bits(addr, l2v))
}

#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum GuardError {
    #[error("l2g {0} is outside of the range a guard can describe")]
    L2gOutOfRange(u8),
    #[error("match value {0:#x} does not fit into the match field of a guard")]
    MatchTooWide(u64),
    #[error("match value {match_value:#x} shifted by {l2g} bits overflows the address width")]
    Overflow { match_value: u64, l2g: u8 },
}

/// A `(match, l2g)` pair restricting which addresses can reach the object behind a slot.
///
/// An address passes the guard iff its bits at and above position `l2g` equal `match << l2g`.
/// The constructor is the only way to build a guard, so every value of this type is valid:
/// - `l2g` lies between one page and the full address width
/// - `match` fits into [`GUARD_MATCH_BITS`] bits
/// - `match << l2g` does not lose any bits
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Guard {
    match_value: u32,
    l2g: u8,
}

impl Guard {
    /// A guard that accepts every address
    pub const FULL: Guard = Guard {
        match_value: 0,
        l2g: ADDR_BITS,
    };

    /// The tightest guard possible, covering exactly one page at offset 0
    pub const PAGE: Guard = Guard {
        match_value: 0,
        l2g: PAGE_ADDR_BITS,
    };

    pub const fn new(match_value: u64, l2g: u8) -> Result<Self, GuardError> {
        if l2g < PAGE_ADDR_BITS || l2g > ADDR_BITS {
            return Err(GuardError::L2gOutOfRange(l2g));
        }
        if match_value >= (1 << GUARD_MATCH_BITS) {
            return Err(GuardError::MatchTooWide(match_value));
        }
        if shift_down(shift_up(match_value, l2g), l2g) != match_value {
            return Err(GuardError::Overflow { match_value, l2g });
        }
        Ok(Self {
            match_value: match_value as u32,
            l2g,
        })
    }

    /// A guard without any compressed bits that covers `2^l2g` bytes
    pub const fn span(l2g: u8) -> Result<Self, GuardError> {
        Self::new(0, l2g)
    }

    pub const fn match_value(self) -> u64 {
        self.match_value as u64
    }

    pub const fn l2g(self) -> u8 {
        self.l2g
    }

    /// The compressed address bits in their actual position (`match << l2g`)
    pub const fn value(self) -> u64 {
        shift_up(self.match_value as u64, self.l2g)
    }

    /// A mask selecting all address bits that are compared against the guard
    pub const fn mask(self) -> u64 {
        high_bits(u64::MAX, self.l2g)
    }

    /// Whether `addr` passes this guard
    pub const fn matches(self, addr: u64) -> bool {
        high_bits(addr, self.l2g) == self.value()
    }

    /// Encode the guard in its compact `(match << 8) | l2g` form
    pub const fn encode(self) -> u32 {
        (self.match_value << 8) | self.l2g as u32
    }

    pub const fn decode(raw: u32) -> Result<Self, GuardError> {
        Self::new((raw >> 8) as u64, (raw & 0xff) as u8)
    }
}

impl Debug for Guard {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "Guard({:#x} @ {})", self.match_value, self.l2g)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bit_helpers_saturate_at_address_width() {
        assert_eq!(low_bits(0xdead_beef, 64), 0xdead_beef);
        assert_eq!(high_bits(0xdead_beef, 64), 0);
        assert_eq!(shift_down(u64::MAX, 64), 0);
        assert_eq!(shift_up(1, 64), 0);
        assert_eq!(low_bits(0x12345, 12), 0x345);
        assert_eq!(high_bits(0x12345, 12), 0x12000);
    }

    #[test]
    fn test_l2_offset_never_goes_below_a_page() {
        assert_eq!(l2_offset(0), 12);
        assert_eq!(l2_offset(0xfff), 12);
        assert_eq!(l2_offset(0x1000), 13);
        assert_eq!(l2_offset(0x12345000), 29);
        assert_eq!(l2_offset(u64::MAX), 64);
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 4), 0);
        assert_eq!(round_up(1, 4), 4);
        assert_eq!(round_up(17, 4), 20);
    }

    #[test]
    fn test_guard_rejects_invalid_values() {
        assert_eq!(Guard::new(0, 11), Err(GuardError::L2gOutOfRange(11)));
        assert_eq!(Guard::new(0, 65), Err(GuardError::L2gOutOfRange(65)));
        assert_eq!(
            Guard::new(1 << 24, 12),
            Err(GuardError::MatchTooWide(1 << 24))
        );
        assert_eq!(
            Guard::new(1, 64),
            Err(GuardError::Overflow {
                match_value: 1,
                l2g: 64
            })
        );
        assert_eq!(
            Guard::new(0xff, 60),
            Err(GuardError::Overflow {
                match_value: 0xff,
                l2g: 60
            })
        );
        assert!(Guard::new(0xf, 60).is_ok());
    }

    #[test]
    fn test_guard_matching() {
        let guard = Guard::new(0x12345, 12).unwrap();
        assert_eq!(guard.value(), 0x12345000);
        assert!(guard.matches(0x12345000));
        assert!(guard.matches(0x12345fff));
        assert!(!guard.matches(0x12340000));
        assert!(!guard.matches(0x1_12345000));
        assert!(Guard::FULL.matches(u64::MAX));
    }

    #[test]
    fn test_guard_encoding() {
        let guard = Guard::new(0x3, 20).unwrap();
        assert_eq!(guard.encode(), 0x314);
        assert_eq!(Guard::decode(0x314), Ok(guard));
        assert!(Guard::decode(0).is_err());
    }

    #[test]
    fn test_split_address() {
        assert_eq!(split_address(0x12345000, 28), (1, 0x2345000));
        assert_eq!(split_address(0x12345000, 64), (0, 0x12345000));
        assert!(matches_above(0x5000, 0x5fff, 12));
        assert!(!matches_above(0x5000, 0x6000, 12));
    }
}
