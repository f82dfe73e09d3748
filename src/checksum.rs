//! The ROMIO 16-bit running checksum.
//!
//! The buffer is summed as big-endian 16-bit words.  Whenever the running sum
//! overflows 16 bits the carry is folded back in as `(sum + 1) & 0xFFFF`.
//! A trailing odd byte is the high byte of a final word whose low byte is 0.
//! No one's-complement is applied at the end, so this is *not* the Internet
//! checksum even though it looks like one.
//!
//! The same accumulator covers the outer image body and the memory map table
//! body.  [`Checksum`] may be fed in arbitrary chunks: an odd byte left over
//! from one `update` is carried into the next, so streaming and one-shot
//! results are identical.

#[inline]
fn fold(sum: u32, word: u16) -> u32 {
    let sum = sum + u32::from(word);
    if sum > 0xFFFF {
        (sum + 1) & 0xFFFF
    } else {
        sum
    }
}

/// Streaming checksum accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum {
    sum:     u32,
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(high) = self.pending.take() {
            self.sum = fold(self.sum, u16::from_be_bytes([high, data[0]]));
            data = &data[1..];
        }

        let mut words = data.chunks_exact(2);
        for w in &mut words {
            self.sum = fold(self.sum, u16::from_be_bytes([w[0], w[1]]));
        }
        if let [last] = words.remainder() {
            self.pending = Some(*last);
        }
    }

    /// Current value, with any pending odd byte folded in as `byte << 8`.
    /// Does not disturb the accumulator; more data may still be fed.
    pub fn value(&self) -> u16 {
        let sum = match self.pending {
            Some(high) => fold(self.sum, u16::from(high) << 8),
            None       => self.sum,
        };
        sum as u16
    }
}

/// One-shot checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.update(data);
    c.value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(checksum(&[]), 0);
        assert_eq!(Checksum::new().value(), 0);
    }

    #[test]
    fn plain_sum_without_carry() {
        assert_eq!(checksum(&[0x12, 0x34, 0x00, 0x01]), 0x1235);
    }

    #[test]
    fn carry_is_folded_back() {
        // 0xFFFF + 0x0002 = 0x10001 -> (0x10001 + 1) & 0xFFFF = 0x0002
        assert_eq!(checksum(&[0xFF, 0xFF, 0x00, 0x02]), 0x0002);
        // 0x8000 + 0x8000 = 0x10000 -> 0x0001
        assert_eq!(checksum(&[0x80, 0x00, 0x80, 0x00]), 0x0001);
    }

    #[test]
    fn odd_tail_is_high_byte() {
        assert_eq!(checksum(&[0x01]), 0x0100);
        assert_eq!(checksum(&[0x00, 0x01, 0x02]), 0x0201);
    }

    #[test]
    fn no_final_complement() {
        assert_eq!(checksum(&[0x00, 0x00]), 0x0000);
        assert_ne!(checksum(&[0x00, 0x00]), 0xFFFF);
    }

    #[test]
    fn odd_byte_carried_across_updates() {
        let mut c = Checksum::new();
        c.update(&[0xAB]);
        c.update(&[0xCD, 0x12]);
        c.update(&[0x34]);
        assert_eq!(c.value(), checksum(&[0xAB, 0xCD, 0x12, 0x34]));
    }

    proptest! {
        #[test]
        fn chunking_invariant(
            a in proptest::collection::vec(any::<u8>(), 0..300),
            b in proptest::collection::vec(any::<u8>(), 0..300),
        ) {
            let mut joined = a.clone();
            joined.extend_from_slice(&b);

            let mut c = Checksum::new();
            c.update(&a);
            c.update(&b);
            prop_assert_eq!(c.value(), checksum(&joined));
        }

        #[test]
        fn byte_at_a_time(data in proptest::collection::vec(any::<u8>(), 0..200)) {
            let mut c = Checksum::new();
            for byte in &data {
                c.update(std::slice::from_ref(byte));
            }
            prop_assert_eq!(c.value(), checksum(&data));
        }
    }
}
