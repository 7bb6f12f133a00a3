//! Shamir and Feldman helpers, generic over the group

use crate::{Error, Result};
use elliptic_curve::ff::{Field, PrimeField};
use elliptic_curve::group::Group;
use rand::rngs::OsRng;

/// Polynomial of the given degree with a fixed constant term
pub(crate) fn random_polynomial<F: Field>(constant: F, degree: usize) -> Vec<F> {
    let mut rng = OsRng;
    let mut coefficients = Vec::with_capacity(degree + 1);
    coefficients.push(constant);
    for _ in 0..degree {
        coefficients.push(F::random(&mut rng));
    }
    coefficients
}

pub(crate) fn evaluate_polynomial<F: Field>(coefficients: &[F], x: F) -> F {
    coefficients
        .iter()
        .rev()
        .fold(F::ZERO, |acc, coefficient| acc * x + *coefficient)
}

/// Feldman commitments `a_k * G`
pub(crate) fn commit<G: Group>(coefficients: &[G::Scalar]) -> Vec<G> {
    coefficients
        .iter()
        .map(|coefficient| G::generator() * *coefficient)
        .collect()
}

/// `f(x) * G` computed from the commitments alone
pub(crate) fn evaluate_commitments<G: Group>(commitments: &[G], x: G::Scalar) -> G {
    commitments
        .iter()
        .rev()
        .fold(G::identity(), |acc, commitment| acc * x + *commitment)
}

pub(crate) fn verify_share<G: Group>(share: &G::Scalar, x: G::Scalar, commitments: &[G]) -> bool {
    G::generator() * *share == evaluate_commitments(commitments, x)
}

/// Lagrange coefficient of `x_i` for interpolating at zero over `xs`
pub(crate) fn lagrange_at_zero<F: PrimeField>(x_i: F, xs: &[F]) -> Result<F> {
    let mut numerator = F::ONE;
    let mut denominator = F::ONE;

    for x_j in xs {
        if *x_j == x_i {
            continue;
        }
        numerator *= *x_j;
        denominator *= *x_j - x_i;
    }

    Option::<F>::from(denominator.invert())
        .map(|inverse| numerator * inverse)
        .ok_or_else(|| Error::Crypto("duplicate share index".into()))
}

pub(crate) fn index_scalar<F: PrimeField>(share_index: u64) -> F {
    F::from(share_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::{ProjectivePoint, Scalar};

    #[test]
    fn test_lagrange_reconstructs_secret() {
        let secret = Scalar::random(&mut OsRng);
        let polynomial = random_polynomial(secret, 2);
        let xs: Vec<Scalar> = [3u64, 11, 42].iter().map(|x| Scalar::from(*x)).collect();

        let mut recovered = Scalar::ZERO;
        for x in &xs {
            let lambda = lagrange_at_zero(*x, &xs).unwrap();
            recovered += lambda * evaluate_polynomial(&polynomial, *x);
        }
        assert_eq!(recovered, secret);
    }

    #[test]
    fn test_feldman_verification() {
        let polynomial = random_polynomial(Scalar::random(&mut OsRng), 3);
        let commitments = commit::<ProjectivePoint>(&polynomial);
        let x = Scalar::from(7u64);
        let share = evaluate_polynomial(&polynomial, x);

        assert!(verify_share(&share, x, &commitments));
        assert!(!verify_share(&(share + Scalar::ONE), x, &commitments));
    }
}
