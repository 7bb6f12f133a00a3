//! Curve suites the parties are generic over

use crate::{Error, Result, SignatureData, SigningAlgo};
use curve25519_dalek::{EdwardsPoint, Scalar as EdScalar};
use elliptic_curve::ff::PrimeField;
use elliptic_curve::group::{Group, GroupEncoding};
use k256::{
    elliptic_curve::{bigint::U256, ops::Reduce, sec1::ToEncodedPoint},
    ProjectivePoint, Scalar,
};
use sha2::{Digest, Sha512};

/// A prime-order group plus the signature equation used on top of it
pub trait Suite: Send + Sync + 'static {
    type Point: Group<Scalar = Self::Scalar> + GroupEncoding;
    type Scalar: PrimeField;

    const ALGO: SigningAlgo;

    /// Length requirement on the message, if any
    fn check_message(message: &[u8]) -> Result<()>;

    /// This party's contribution to `s`, given its nonce, the joint nonce
    /// point, and its Lagrange-weighted key share
    fn partial_signature(
        nonce: &Self::Scalar,
        big_r: &Self::Point,
        weighted_share: &Self::Scalar,
        public_key: &Self::Point,
        message: &[u8],
    ) -> Result<Self::Scalar>;

    fn finalize_signature(
        big_r: &Self::Point,
        s: &Self::Scalar,
        message: &[u8],
    ) -> Result<SignatureData>;
}

/// secp256k1 with ECDSA
#[derive(Debug, Clone, Copy)]
pub struct Secp256k1;

/// ed25519 with Schnorr-style EdDSA
#[derive(Debug, Clone, Copy)]
pub struct Ed25519;

impl Suite for Secp256k1 {
    type Point = ProjectivePoint;
    type Scalar = Scalar;

    const ALGO: SigningAlgo = SigningAlgo::Ecdsa;

    fn check_message(message: &[u8]) -> Result<()> {
        if message.len() != 32 {
            return Err(Error::InvalidConfig(format!(
                "ECDSA signs a 32-byte digest, got {} bytes",
                message.len()
            )));
        }
        Ok(())
    }

    fn partial_signature(
        nonce: &Scalar,
        big_r: &ProjectivePoint,
        weighted_share: &Scalar,
        _public_key: &ProjectivePoint,
        message: &[u8],
    ) -> Result<Scalar> {
        let (r, _) = x_coordinate(big_r)?;
        let m = message_scalar(message)?;

        // sigma_i = k_i * m + r * (lambda_i * x_i) * k_i
        Ok(*nonce * m + r * (*weighted_share * *nonce))
    }

    fn finalize_signature(
        big_r: &ProjectivePoint,
        s: &Scalar,
        message: &[u8],
    ) -> Result<SignatureData> {
        let (_, r) = x_coordinate(big_r)?;
        let s_bytes = s.to_bytes().to_vec();

        // Recovery ID from the parity of R's y coordinate
        let compressed = big_r.to_affine().to_encoded_point(true);
        let recovery_id = if compressed.as_bytes()[0] == 0x03 { 1 } else { 0 };

        let mut signature = r.to_vec();
        signature.extend_from_slice(&s_bytes);

        Ok(SignatureData {
            r: r.to_vec(),
            s: s_bytes,
            recovery_id,
            signature,
            message: message.to_vec(),
        })
    }
}

/// r = x(R) mod n, plus the raw coordinate bytes
fn x_coordinate(point: &ProjectivePoint) -> Result<(Scalar, [u8; 32])> {
    if bool::from(point.is_identity()) {
        return Err(Error::Crypto("nonce point is the identity".into()));
    }
    let encoded = point.to_affine().to_encoded_point(false);
    let mut coordinate = [0u8; 32];
    coordinate.copy_from_slice(&encoded.as_bytes()[1..33]);
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&coordinate.into());
    Ok((r, coordinate))
}

fn message_scalar(message: &[u8]) -> Result<Scalar> {
    let digest: [u8; 32] = message
        .try_into()
        .map_err(|_| Error::InvalidConfig("message must be a 32-byte digest".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&digest.into()))
}

impl Suite for Ed25519 {
    type Point = EdwardsPoint;
    type Scalar = EdScalar;

    const ALGO: SigningAlgo = SigningAlgo::Eddsa;

    fn check_message(_message: &[u8]) -> Result<()> {
        Ok(())
    }

    fn partial_signature(
        nonce: &EdScalar,
        big_r: &EdwardsPoint,
        weighted_share: &EdScalar,
        public_key: &EdwardsPoint,
        message: &[u8],
    ) -> Result<EdScalar> {
        let challenge = eddsa_challenge(big_r, public_key, message);
        Ok(nonce + challenge * weighted_share)
    }

    fn finalize_signature(
        big_r: &EdwardsPoint,
        s: &EdScalar,
        message: &[u8],
    ) -> Result<SignatureData> {
        let r = big_r.compress().to_bytes();
        let s_bytes = s.to_bytes();

        let mut signature = r.to_vec();
        signature.extend_from_slice(&s_bytes);

        Ok(SignatureData {
            r: r.to_vec(),
            s: s_bytes.to_vec(),
            recovery_id: 0,
            signature,
            message: message.to_vec(),
        })
    }
}

/// c = H(R || A || M) as in RFC 8032
fn eddsa_challenge(big_r: &EdwardsPoint, public_key: &EdwardsPoint, message: &[u8]) -> EdScalar {
    let mut hasher = Sha512::new();
    hasher.update(big_r.compress().as_bytes());
    hasher.update(public_key.compress().as_bytes());
    hasher.update(message);

    let mut wide = [0u8; 64];
    wide.copy_from_slice(&hasher.finalize());
    EdScalar::from_bytes_mod_order_wide(&wide)
}

pub(crate) fn encode_scalar<F: PrimeField>(scalar: &F) -> Vec<u8> {
    scalar.to_repr().as_ref().to_vec()
}

pub(crate) fn decode_scalar<F: PrimeField>(bytes: &[u8]) -> Result<F> {
    let mut repr = <F as PrimeField>::Repr::default();
    if repr.as_ref().len() != bytes.len() {
        return Err(Error::Deserialization(format!(
            "invalid scalar length {}",
            bytes.len()
        )));
    }
    repr.as_mut().copy_from_slice(bytes);
    Option::<F>::from(F::from_repr(repr))
        .ok_or_else(|| Error::Deserialization("scalar out of range".into()))
}

pub(crate) fn encode_point<G: GroupEncoding>(point: &G) -> Vec<u8> {
    point.to_bytes().as_ref().to_vec()
}

pub(crate) fn decode_point<G: GroupEncoding>(bytes: &[u8]) -> Result<G> {
    let mut repr = <G as GroupEncoding>::Repr::default();
    if repr.as_ref().len() != bytes.len() {
        return Err(Error::Deserialization(format!(
            "invalid point length {}",
            bytes.len()
        )));
    }
    repr.as_mut().copy_from_slice(bytes);
    Option::<G>::from(G::from_bytes(&repr))
        .ok_or_else(|| Error::Deserialization("invalid point encoding".into()))
}

pub(crate) fn encode_point_hex<G: GroupEncoding>(point: &G) -> String {
    hex::encode(encode_point(point))
}

pub(crate) fn decode_point_hex<G: GroupEncoding>(encoded: &str) -> Result<G> {
    let bytes = hex::decode(encoded).map_err(|e| Error::Deserialization(e.to_string()))?;
    decode_point(&bytes)
}

pub(crate) fn decode_scalar_hex<F: PrimeField>(encoded: &str) -> Result<F> {
    let bytes = hex::decode(encoded).map_err(|e| Error::Deserialization(e.to_string()))?;
    decode_scalar(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use elliptic_curve::ff::Field;
    use rand::rngs::OsRng;

    #[test]
    fn test_scalar_encoding() {
        let k = Scalar::random(&mut OsRng);
        assert_eq!(decode_scalar::<Scalar>(&encode_scalar(&k)).unwrap(), k);

        let e = EdScalar::random(&mut OsRng);
        assert_eq!(decode_scalar::<EdScalar>(&encode_scalar(&e)).unwrap(), e);

        assert!(decode_scalar::<Scalar>(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_point_encoding_lengths() {
        let p = ProjectivePoint::generator() * Scalar::random(&mut OsRng);
        assert_eq!(encode_point(&p).len(), 33);

        let q = EdwardsPoint::generator() * EdScalar::random(&mut OsRng);
        assert_eq!(encode_point(&q).len(), 32);
        assert_eq!(decode_point::<EdwardsPoint>(&encode_point(&q)).unwrap(), q);
    }

    #[test]
    fn test_ecdsa_rejects_short_message() {
        assert!(Secp256k1::check_message(&[0u8; 31]).is_err());
        assert!(Secp256k1::check_message(&[0u8; 32]).is_ok());
        assert!(Ed25519::check_message(b"anything").is_ok());
    }
}
