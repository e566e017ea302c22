//! Packed piece-possession bitmap.
//!
//! Bits live in 64-bit words, bit `i` at `words[i / 64] & (1 << (i % 64))`.
//! On the wire the first piece is the high bit of the first byte, so
//! serialization reverses the bit order of every byte.

use std::ops::Range;

const WORD_BITS: usize = 64;

/// Fixed-length bit vector over `[0, len)`.
///
/// Padding bits past `len` in the last word are always zero, which keeps
/// `true_count`, equality and serialization consistent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BitField {
    words: Vec<u64>,
    len: usize,
    true_count: usize,
}

impl BitField {
    /// Creates an all-false field of `len` bits.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
            true_count: 0,
        }
    }

    /// Decodes a wire bitmap; the length is `bytes.len() * 8`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = bytes.len() * 8;
        let mut words = vec![0u64; len.div_ceil(WORD_BITS)];
        for (index, byte) in bytes.iter().enumerate() {
            words[index / 8] |= u64::from(byte.reverse_bits()) << (8 * (index % 8));
        }
        let true_count = words.iter().map(|word| word.count_ones() as usize).sum();

        Self {
            words,
            len,
            true_count,
        }
    }

    /// Decodes a wire bitmap for exactly `len` pieces.
    ///
    /// Returns `None` when `bytes` is not `ceil(len / 8)` long. Spare bits in
    /// the last byte are discarded.
    pub fn from_bytes_exact(bytes: &[u8], len: usize) -> Option<Self> {
        if bytes.len() != len.div_ceil(8) {
            return None;
        }

        let mut field = Self::from_bytes(bytes);
        field.len = len;
        field.words.truncate(len.div_ceil(WORD_BITS));
        field.clear_padding();
        field.recount();
        Some(field)
    }

    /// Number of bits.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of set bits, maintained incrementally.
    pub fn true_count(&self) -> usize {
        self.true_count
    }

    pub fn all_true(&self) -> bool {
        self.true_count == self.len
    }

    pub fn all_false(&self) -> bool {
        self.true_count == 0
    }

    /// # Panics
    /// Panics if `index >= len`.
    pub fn get(&self, index: usize) -> bool {
        self.check_index(index);
        self.words[index / WORD_BITS] & bit_mask(index) != 0
    }

    /// # Panics
    /// Panics if `index >= len`.
    pub fn set(&mut self, index: usize) -> &mut Self {
        self.set_to(index, true)
    }

    /// # Panics
    /// Panics if `index >= len`.
    pub fn clear(&mut self, index: usize) -> &mut Self {
        self.set_to(index, false)
    }

    /// # Panics
    /// Panics if `index >= len`.
    pub fn set_to(&mut self, index: usize, value: bool) -> &mut Self {
        self.check_index(index);
        let word = &mut self.words[index / WORD_BITS];
        let was_set = *word & bit_mask(index) != 0;
        match (was_set, value) {
            (false, true) => {
                *word |= bit_mask(index);
                self.true_count += 1;
            }
            (true, false) => {
                *word &= !bit_mask(index);
                self.true_count -= 1;
            }
            _ => {}
        }
        self
    }

    /// Sets every bit in `[0, len)`.
    pub fn set_all(&mut self) -> &mut Self {
        self.words.iter_mut().for_each(|word| *word = u64::MAX);
        self.clear_padding();
        self.true_count = self.len;
        self
    }

    pub fn first_true(&self) -> Option<usize> {
        self.first_true_in(0..self.len)
    }

    pub fn first_false(&self) -> Option<usize> {
        self.first_false_in(0..self.len)
    }

    /// First set bit inside `range`.
    ///
    /// # Panics
    /// Panics if the range is inverted or ends past `len`.
    pub fn first_true_in(&self, range: Range<usize>) -> Option<usize> {
        self.find(range, true)
    }

    /// First clear bit inside `range`.
    ///
    /// # Panics
    /// Panics if the range is inverted or ends past `len`.
    pub fn first_false_in(&self, range: Range<usize>) -> Option<usize> {
        self.find(range, false)
    }

    /// Indices of all set bits in ascending order.
    pub fn iter_true(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| {
                let mut remaining = word;
                std::iter::from_fn(move || {
                    if remaining == 0 {
                        return None;
                    }
                    let bit = remaining.trailing_zeros() as usize;
                    remaining &= remaining - 1;
                    Some(word_index * WORD_BITS + bit)
                })
            })
    }

    /// In-place intersection.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    pub fn and(&mut self, other: &BitField) -> &mut Self {
        self.combine(other, |a, b| a & b)
    }

    /// In-place union.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    pub fn or(&mut self, other: &BitField) -> &mut Self {
        self.combine(other, |a, b| a | b)
    }

    /// In-place symmetric difference.
    ///
    /// # Panics
    /// Panics if the lengths differ.
    pub fn xor(&mut self, other: &BitField) -> &mut Self {
        self.combine(other, |a, b| a ^ b)
    }

    /// In-place inversion of every bit in `[0, len)`.
    pub fn not(&mut self) -> &mut Self {
        self.words.iter_mut().for_each(|word| *word = !*word);
        self.clear_padding();
        self.true_count = self.len - self.true_count;
        self
    }

    /// Number of bytes `to_bytes` produces.
    pub fn byte_len(&self) -> usize {
        self.len.div_ceil(8)
    }

    /// Serializes to `ceil(len / 8)` wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; self.byte_len()];
        self.to_bytes_into(&mut bytes);
        bytes
    }

    /// Serializes into the front of `dest`, returning the bytes written.
    ///
    /// # Panics
    /// Panics if `dest` is shorter than `byte_len()`.
    pub fn to_bytes_into(&self, dest: &mut [u8]) -> usize {
        let byte_len = self.byte_len();
        assert!(
            dest.len() >= byte_len,
            "destination holds {} bytes, bitfield needs {byte_len}",
            dest.len()
        );

        for (index, byte) in dest[..byte_len].iter_mut().enumerate() {
            let word = self.words[index / 8];
            *byte = ((word >> (8 * (index % 8))) as u8).reverse_bits();
        }
        byte_len
    }

    fn find(&self, range: Range<usize>, want: bool) -> Option<usize> {
        assert!(
            range.start <= range.end,
            "inverted range {}..{}",
            range.start,
            range.end
        );
        assert!(
            range.end <= self.len,
            "range end {} exceeds bitfield length {}",
            range.end,
            self.len
        );

        let mut index = range.start;
        while index < range.end {
            let word_index = index / WORD_BITS;
            let mut word = self.words[word_index];
            if !want {
                word = !word;
            }
            word &= u64::MAX << (index % WORD_BITS);
            if word != 0 {
                let found = word_index * WORD_BITS + word.trailing_zeros() as usize;
                return (found < range.end).then_some(found);
            }
            index = (word_index + 1) * WORD_BITS;
        }
        None
    }

    fn combine(&mut self, other: &BitField, op: impl Fn(u64, u64) -> u64) -> &mut Self {
        assert_eq!(
            self.len, other.len,
            "bitwise operation on bitfields of different lengths"
        );
        for (word, &other_word) in self.words.iter_mut().zip(&other.words) {
            *word = op(*word, other_word);
        }
        self.recount();
        self
    }

    fn recount(&mut self) {
        self.true_count = self
            .words
            .iter()
            .map(|word| word.count_ones() as usize)
            .sum();
    }

    fn clear_padding(&mut self) {
        let used = self.len % WORD_BITS;
        if used != 0
            && let Some(last) = self.words.last_mut()
        {
            *last &= (1u64 << used) - 1;
        }
    }

    fn check_index(&self, index: usize) {
        assert!(
            index < self.len,
            "bit index {index} out of range for bitfield of length {}",
            self.len
        );
    }
}

fn bit_mask(index: usize) -> u64 {
    1u64 << (index % WORD_BITS)
}
