//! Q17.14 signed fixed-point arithmetic.
//!
//! The 4.4BSD scheduler computes `load_avg` and `recent_cpu` in a
//! fixed-point format with 17 integer bits, 14 fraction bits, and one
//! sign bit, held in an `i32`. Products and quotients of two
//! fixed-point values widen through `i64` to avoid overflow.

/// Number of fraction bits.
const Q: u32 = 14;

/// The scaling factor `1 << Q`.
const F: i32 = 1 << Q;

/// A Q17.14 fixed-point number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);

    /// Convert an integer to fixed point.
    pub const fn from_int(n: i32) -> Fixed {
        Fixed(n * F)
    }

    /// Raw representation, for storage in an `AtomicI32`.
    pub const fn raw(self) -> i32 {
        self.0
    }

    /// Rebuild from a raw representation.
    pub const fn from_raw(bits: i32) -> Fixed {
        Fixed(bits)
    }

    /// Convert to integer, rounding toward zero.
    pub const fn to_int_trunc(self) -> i32 {
        self.0 / F
    }

    /// Convert to integer, rounding to nearest.
    pub const fn to_int_round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }

    pub const fn add(self, other: Fixed) -> Fixed {
        Fixed(self.0 + other.0)
    }

    pub const fn sub(self, other: Fixed) -> Fixed {
        Fixed(self.0 - other.0)
    }

    pub const fn add_int(self, n: i32) -> Fixed {
        Fixed(self.0 + n * F)
    }

    pub const fn sub_int(self, n: i32) -> Fixed {
        Fixed(self.0 - n * F)
    }

    pub const fn mul_int(self, n: i32) -> Fixed {
        Fixed(self.0 * n)
    }

    pub const fn div_int(self, n: i32) -> Fixed {
        Fixed(self.0 / n)
    }

    /// Multiply two fixed-point values.
    pub const fn mul(self, other: Fixed) -> Fixed {
        Fixed((self.0 as i64 * other.0 as i64 / F as i64) as i32)
    }

    /// Divide two fixed-point values.
    pub const fn div(self, other: Fixed) -> Fixed {
        Fixed((self.0 as i64 * F as i64 / other.0 as i64) as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_int_round_trip() {
        for n in [-100, -1, 0, 1, 31, 63, 1000] {
            assert_eq!(Fixed::from_int(n).to_int_round(), n);
            assert_eq!(Fixed::from_int(n).to_int_trunc(), n);
        }
    }

    #[test]
    fn test_round_to_nearest_both_signs() {
        // 3/2 rounds to 2, -3/2 rounds to -2.
        let half3 = Fixed::from_int(3).div_int(2);
        assert_eq!(half3.to_int_round(), 2);
        assert_eq!(half3.to_int_trunc(), 1);

        let neg = Fixed::from_int(-3).div_int(2);
        assert_eq!(neg.to_int_round(), -2);
        assert_eq!(neg.to_int_trunc(), -1);
    }

    #[test]
    fn test_mul_div_widen() {
        // 59/60 * 60 == 59 exactly when widened through i64.
        let a = Fixed::from_int(59).div_int(60);
        assert_eq!(a.mul(Fixed::from_int(60)).to_int_round(), 59);

        // (2 * load) / (2 * load + 1) stays below one.
        let load = Fixed::from_int(5);
        let coeff = load.mul_int(2).div(load.mul_int(2).add_int(1));
        assert!(coeff < Fixed::from_int(1));
        assert!(coeff > Fixed::ZERO);
    }

    proptest! {
        #[test]
        fn prop_add_sub_inverse(a in -50_000i32..50_000, b in -50_000i32..50_000) {
            let fa = Fixed::from_int(a);
            prop_assert_eq!(fa.add_int(b).sub_int(b), fa);
            prop_assert_eq!(fa.add(Fixed::from_int(b)).sub(Fixed::from_int(b)), fa);
        }

        #[test]
        fn prop_mul_int_matches_repeated_add(a in -1000i32..1000, n in 0i32..16) {
            let fa = Fixed::from_int(a);
            let mut acc = Fixed::ZERO;
            for _ in 0..n {
                acc = acc.add(fa);
            }
            prop_assert_eq!(fa.mul_int(n), acc);
        }

        #[test]
        fn prop_div_then_mul_bounds(a in 1i32..50_000, b in 1i32..1000) {
            // a/b * b is within one ulp-of-integer of a.
            let q = Fixed::from_int(a).div_int(b).mul_int(b);
            let diff = (q.to_int_round() - a).abs();
            prop_assert!(diff <= 1);
        }
    }
}
