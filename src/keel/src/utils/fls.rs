//! Find the last (most significant) set bit
//!
//! The priority bitmap wants the largest populated bit index in constant
//! time. Most targets provide a count-leading-zeros instruction (Armv6-M is
//! the notable absentee); `usize::leading_zeros` lowers to it where available
//! and to a short branch-free sequence elsewhere, so the elaborate
//! lookup-table fallbacks that a count-*trailing*-zeros implementation would
//! justify are unnecessary here.

const USIZE_BITS: u32 = usize::BITS;

/// Return the position of the most significant set bit in `x`
/// (`x < 1 << BITS`). Returns `usize::BITS` if `x` is zero.
#[inline]
pub fn find_last_set<const BITS: usize>(x: usize) -> u32 {
    if BITS == 0 || x == 0 {
        USIZE_BITS
    } else if BITS == 1 {
        // `x` must be `1`
        0
    } else {
        debug_assert!(BITS >= usize::BITS as usize || x < (1 << BITS));
        USIZE_BITS - 1 - x.leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find_last_set_naive(x: usize) -> u32 {
        (0..usize::BITS)
            .rev()
            .find(|&i| (x >> i) & 1 != 0)
            .unwrap_or(usize::BITS)
    }

    macro_rules! gen_test {
        ($mod_name:ident, $bits:literal) => {
            mod $mod_name {
                use super::*;

                #[quickcheck_macros::quickcheck]
                fn result_matches_naive_implementation(in_value: u128) {
                    let mask = if $bits >= usize::BITS as usize {
                        usize::MAX
                    } else {
                        (1 << $bits) - 1
                    };
                    let value = in_value as usize & mask;
                    assert_eq!(
                        find_last_set::<$bits>(value),
                        find_last_set_naive(value),
                        "{value:#x}",
                    );
                }
            }
        };
    }

    gen_test!(bits_1, 1);
    gen_test!(bits_2, 2);
    gen_test!(bits_3, 3);
    gen_test!(bits_8, 8);
    gen_test!(bits_14, 14);
    gen_test!(bits_32, 32);

    #[test]
    fn zero_has_no_set_bit() {
        assert_eq!(find_last_set::<8>(0), usize::BITS);
        assert_eq!(find_last_set::<0>(0), usize::BITS);
    }
}
