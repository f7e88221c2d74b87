//! Provides `FixedPrioBitmap`, a bit array structure supporting
//! constant-time highest-set-bit scan operations.
use core::fmt;

use super::{fls::find_last_set, Init};

/// The maximum bit count supported by [`FixedPrioBitmap`].
///
/// The kernel represents task priorities with bit positions in a single
/// machine word, the numerically largest position being the most urgent.
/// One word covers far more priority levels than a sane application
/// configures, so the multi-level variants that a find-*first*-set design
/// would eventually need are intentionally not provided.
pub const FIXED_PRIO_BITMAP_MAX_LEN: usize = WORD_LEN;

type Word = usize;
const WORD_LEN: usize = core::mem::size_of::<Word>() * 8;

/// Trait for [`FixedPrioBitmap`].
///
/// All methods panic when the given bit position is out of range.
pub trait PrioBitmap: Init + Send + Sync + Clone + Copy + fmt::Debug + 'static {
    /// Get the bit at the specified position.
    fn get(&self, i: usize) -> bool;

    /// Clear the bit at the specified position.
    fn clear(&mut self, i: usize);

    /// Set the bit at the specified position.
    fn set(&mut self, i: usize);

    /// Get the position of the *most significant* set bit.
    fn find_set(&self) -> Option<usize>;
}

/// A bit array structure supporting constant-time highest-set-bit scan
/// operations. Stores `LEN` (≤ [`FIXED_PRIO_BITMAP_MAX_LEN`]) entries.
#[derive(Clone, Copy)]
pub struct FixedPrioBitmap<const LEN: usize> {
    bits: Word,
}

impl<const LEN: usize> FixedPrioBitmap<LEN> {
    const LEN_OK: () = assert!(
        LEN <= FIXED_PRIO_BITMAP_MAX_LEN,
        "bit count exceeds the machine word size"
    );
}

impl<const LEN: usize> Init for FixedPrioBitmap<LEN> {
    const INIT: Self = {
        let () = Self::LEN_OK;
        Self { bits: 0 }
    };
}

impl<const LEN: usize> fmt::Debug for FixedPrioBitmap<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const LEN: usize> PrioBitmap for FixedPrioBitmap<LEN> {
    fn get(&self, i: usize) -> bool {
        assert!(i < LEN);
        self.bits & (1 << i) != 0
    }

    fn clear(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits &= !(1 << i);
    }

    fn set(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits |= 1 << i;
    }

    fn find_set(&self) -> Option<usize> {
        let i = find_last_set::<LEN>(self.bits);
        if i == usize::BITS {
            None
        } else {
            Some(i as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    struct BTreePrioBitmap(BTreeSet<usize>);

    impl BTreePrioBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn find_set(&self) -> Option<usize> {
            self.0.iter().next_back().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8], bitmap_len: usize) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if bitmap_len == 0 {
                None
            } else if let Some(instr) = bytecode.get(i..i + 5) {
                i += 5;

                let value = u32::from_le_bytes([instr[1], instr[2], instr[3], instr[4]]) as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % bitmap_len;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let i = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(i);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &impl PrioBitmap, bitmap_len: usize) -> Vec<usize> {
        (0..bitmap_len).filter(|&i| bitmap.get(i)).collect()
    }

    fn test_inner<T: PrioBitmap>(bytecode: Vec<u8>, size: usize) {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut subject = T::INIT;
        let mut reference = BTreePrioBitmap::new();

        log::info!("size = {size}");

        for cmd in interpret(&bytecode, size) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_set(), reference.find_set());
        }

        assert_eq!(subject.find_set(), reference.find_set());
        assert_eq!(enum_set_bits(&subject, size), reference.enum_set_bits());
    }

    macro_rules! gen_test {
        (mod $name:ident, $size:literal) => {
            mod $name {
                use super::*;

                #[quickcheck]
                fn test(bytecode: Vec<u8>) {
                    test_inner::<FixedPrioBitmap<$size>>(bytecode, $size);
                }
            }
        };
    }

    gen_test!(mod size_1, 1);
    gen_test!(mod size_4, 4);
    gen_test!(mod size_8, 8);
    gen_test!(mod size_16, 16);
    gen_test!(mod size_32, 32);
}
