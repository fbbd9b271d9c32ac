//! GF(2) polynomial arithmetic: picking and evaluating the irreducible
//! polynomial the chunker's rolling hash is built from.
//!
//! A polynomial is represented as a `u64` bitmask, bit `i` holding the
//! coefficient of `x^i`. Addition and subtraction are both XOR; there's no
//! carry to propagate, which is what makes this arithmetic cheap enough to
//! run per byte of every file we back up.

use anyhow::{Result, ensure};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};

/// Degree of the chunker's splitting polynomial. Chosen, like restic's,
/// because 53 is prime: Rabin's irreducibility test normally has to check a
/// gcd condition per prime factor of the degree, but a prime degree has only
/// one proper divisor (1), so the whole test collapses into a single
/// exponentiation plus a cheap root check.
pub const DEGREE: u32 = 53;

/// A polynomial over GF(2), degree < 64.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polynomial(pub u64);

impl Polynomial {
    /// The zero-indexed position of the highest set bit, or -1 for the zero
    /// polynomial.
    pub fn degree(self) -> i32 {
        if self.0 == 0 {
            -1
        } else {
            63 - self.0.leading_zeros() as i32
        }
    }

    /// Carryless (XOR) multiplication: the product can have degree up to
    /// 126, so it doesn't fit back into a `u64`.
    pub fn carryless_mul(self, other: Polynomial) -> u128 {
        let mut result: u128 = 0;
        let lhs = self.0 as u128;
        for bit in 0..=63 {
            if other.0 & (1 << bit) != 0 {
                result ^= lhs << bit;
            }
        }
        result
    }

    /// Reduces a wide value modulo `self` via schoolbook long division.
    /// `self` must not be the zero polynomial.
    pub fn reduce(self, mut value: u128) -> Polynomial {
        let deg = self.degree();
        debug_assert!(deg >= 0, "can't reduce modulo the zero polynomial");
        loop {
            let value_deg = degree128(value);
            if value_deg < deg {
                return Polynomial(value as u64);
            }
            value ^= (self.0 as u128) << (value_deg - deg);
        }
    }

    pub fn mulmod(self, other: Polynomial, modulus: Polynomial) -> Polynomial {
        modulus.reduce(self.carryless_mul(other))
    }

    /// `self^exp mod modulus`, via repeated squaring. `exp` is a plain
    /// integer exponent, not a polynomial.
    pub fn modpow(self, mut exp: u64, modulus: Polynomial) -> Polynomial {
        let mut base = modulus.reduce(self.0 as u128);
        let mut result = Polynomial(1);
        while exp > 0 {
            if exp & 1 == 1 {
                result = result.mulmod(base, modulus);
            }
            base = base.mulmod(base, modulus);
            exp >>= 1;
        }
        result
    }

    /// Rabin's irreducibility test, specialized for our prime degree: `f`
    /// of degree n is irreducible over GF(2) iff `x^(2^n) ≡ x (mod f)` and f
    /// has no root in GF(2), i.e. `f(0) == 1` and `f(1) == 1`. The second
    /// condition is the whole of Rabin's "for every prime factor q of n,
    /// gcd(x^(2^(n/q)) - x, f) == 1" check, since n's only prime factor is
    /// itself and x^(2^1) - x = x^2 - x = x(x+1) in GF(2).
    pub fn is_irreducible(self) -> bool {
        if self.degree() != DEGREE as i32 {
            return false;
        }
        if self.0 & 1 == 0 {
            return false; // x | f
        }
        if self.0.count_ones() % 2 == 0 {
            return false; // (x + 1) | f
        }
        let x = Polynomial(0b10);
        x.modpow(1u64 << DEGREE, self) == x
    }

    /// Draws a random irreducible, degree-53 polynomial. Used once at
    /// repository init to pick the repository's secret chunker polynomial.
    pub fn random_irreducible(rng: &mut impl RngCore) -> Polynomial {
        loop {
            let low_bits = rng.next_u64() & ((1u64 << DEGREE) - 1);
            // Force the degree bit and the constant term so we're not
            // wasting draws on polynomials that can't possibly qualify.
            let candidate = Polynomial(low_bits | (1 << DEGREE) | 1);
            if candidate.is_irreducible() {
                return candidate;
            }
        }
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(value: u64) -> Result<Self> {
        let poly = Polynomial(value);
        ensure!(
            poly.is_irreducible(),
            "{value:#x} is not an irreducible, degree-{DEGREE} polynomial over GF(2)"
        );
        Ok(poly)
    }
}

fn degree128(v: u128) -> i32 {
    if v == 0 {
        -1
    } else {
        127 - v.leading_zeros() as i32
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn degree_of_known_values() {
        assert_eq!(Polynomial(0).degree(), -1);
        assert_eq!(Polynomial(1).degree(), 0);
        assert_eq!(Polynomial(0b10).degree(), 1);
        assert_eq!(Polynomial(1 << 53).degree(), 53);
    }

    #[test]
    fn reduce_is_idempotent() {
        // x^3 + x (= 0b1010) reduced by x^2 + 1 (= 0b101):
        // x^3 + x = x(x^2+1), so the remainder is 0.
        let modulus = Polynomial(0b101);
        let reduced = modulus.reduce(0b1010);
        assert_eq!(reduced, Polynomial(0));
    }

    #[test]
    fn known_irreducible_low_degree_polynomials() {
        // Over GF(2), x^2 + x + 1 (0b111) is the only irreducible quadratic.
        let p = Polynomial(0b111);
        assert_eq!(p.degree(), 2);
        assert!(p.0 & 1 != 0);
        assert_eq!(p.0.count_ones() % 2, 1);
    }

    #[test]
    fn random_irreducible_has_the_right_degree_and_no_small_roots() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..4 {
            let p = Polynomial::random_irreducible(&mut rng);
            assert_eq!(p.degree(), DEGREE as i32);
            assert!(p.is_irreducible());
            assert_ne!(p.0 & 1, 0);
        }
    }

    #[test]
    fn random_irreducible_is_deterministic_given_a_seed() {
        let mut a = StdRng::seed_from_u64(7);
        let mut b = StdRng::seed_from_u64(7);
        assert_eq!(
            Polynomial::random_irreducible(&mut a),
            Polynomial::random_irreducible(&mut b)
        );
    }

    #[test]
    fn from_u64_rejects_reducible_polynomials() {
        // x^53 (all but the degree bit zero) is trivially reducible (x | f).
        assert!(Polynomial::from_u64(1 << DEGREE).is_err());
    }

    #[test]
    fn from_u64_accepts_a_found_irreducible() {
        let mut rng = StdRng::seed_from_u64(1);
        let p = Polynomial::random_irreducible(&mut rng);
        assert!(Polynomial::from_u64(p.to_u64()).is_ok());
    }
}
