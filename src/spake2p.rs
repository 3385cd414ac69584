//! SPAKE2+ (P-256, SHA-256, HKDF, HMAC) as used by PASE.
//!
//! The commissioner is the prover and knows the passcode. The commissionee is the
//! verifier and only needs the [PaseVerifier] (w0 and L).

use byteorder::{LittleEndian, WriteBytesExt};
use p256::elliptic_curve::{
    ff::PrimeField,
    scalar::FromUintUnchecked,
    sec1::{FromEncodedPoint, ToEncodedPoint},
    Curve, Field,
};
use std::ops::Mul;
use zeroize::Zeroizing;

use crate::{
    error::{Error, HandshakeFailure, Result},
    secure_session::SessionKeys,
    util::cryptoutil,
};

pub const W0_LEN: usize = 32;
pub const POINT_LEN: usize = 65;
pub const VERIFIER_LEN: usize = W0_LEN + POINT_LEN;

pub const MIN_ITERATIONS: u32 = 1000;
pub const MAX_ITERATIONS: u32 = 100_000;
pub const MIN_SALT_LEN: usize = 16;
pub const MAX_SALT_LEN: usize = 32;

const CONTEXT_PREFIX: &[u8] = b"CHIP PAKE V1 Commissioning";
const M_POINT: &str = "02886e2f97ace46e55ba9dd7242579f2993b64e16ef3dcab95afd497333d8fa12f";
const N_POINT: &str = "03d8bbd6c639c62937b04d997f38c3770719c629d7014d49a24b4f98baa1292b49";

/// Passcode as fed into PBKDF2.
pub fn passcode_bytes(pin: u32) -> [u8; 4] {
    pin.to_le_bytes()
}

/// Stored form of a passcode: w0 plus L = w1*G. Lets a device run PASE without
/// keeping the passcode itself.
#[derive(Clone)]
pub struct PaseVerifier {
    w0: Zeroizing<[u8; W0_LEN]>,
    l: [u8; POINT_LEN],
}

impl std::fmt::Debug for PaseVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaseVerifier").field("l", &hex::encode(self.l)).finish()
    }
}

impl PaseVerifier {
    pub fn generate(pin: u32, salt: &[u8], iterations: u32) -> Self {
        let (w0, w1) = derive_w0_w1(&passcode_bytes(pin), salt, iterations);
        let l = p256::ProjectivePoint::GENERATOR.mul(*w1);
        let mut w0_bytes = Zeroizing::new([0u8; W0_LEN]);
        w0_bytes.copy_from_slice(w0.to_bytes().as_slice());
        let mut l_bytes = [0u8; POINT_LEN];
        l_bytes.copy_from_slice(l.to_encoded_point(false).as_bytes());
        Self { w0: w0_bytes, l: l_bytes }
    }

    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(VERIFIER_LEN));
        out.extend_from_slice(self.w0.as_slice());
        out.extend_from_slice(&self.l);
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != VERIFIER_LEN {
            return Err(Error::invalid(format!(
                "pase verifier must be {} bytes, got {}",
                VERIFIER_LEN,
                data.len()
            )));
        }
        let verifier = Self {
            w0: Zeroizing::new(
                data[..W0_LEN]
                    .try_into()
                    .map_err(|_| Error::invalid("pase verifier w0"))?,
            ),
            l: data[W0_LEN..]
                .try_into()
                .map_err(|_| Error::invalid("pase verifier L"))?,
        };
        verifier.w0_scalar()?;
        decode_point(&verifier.l)
            .map_err(|_| Error::invalid("pase verifier L is not a curve point"))?;
        Ok(verifier)
    }

    fn w0_scalar(&self) -> Result<Zeroizing<p256::Scalar>> {
        let repr = p256::FieldBytes::clone_from_slice(self.w0.as_slice());
        Option::from(p256::Scalar::from_repr(repr))
            .map(Zeroizing::new)
            .ok_or_else(|| Error::invalid("pase verifier w0 out of range"))
    }
}

fn scalar_from_40_bytes(bytes: &[u8]) -> p256::Scalar {
    let int = crypto_bigint::U320::from_be_slice(bytes);
    let modulo = int.rem(&crypto_bigint::NonZero::from_uint(crypto_bigint::U320::from(
        &p256::NistP256::ORDER,
    )));
    let u256 = crypto_bigint::U256::from(&modulo);
    p256::Scalar::from_uint_unchecked(u256)
}

type SecretScalar = Zeroizing<p256::Scalar>;

fn derive_w0_w1(passcode: &[u8], salt: &[u8], iterations: u32) -> (SecretScalar, SecretScalar) {
    let mut kdf = Zeroizing::new([0u8; 80]);
    pbkdf2::pbkdf2_hmac::<sha2::Sha256>(passcode, salt, iterations, kdf.as_mut_slice());
    (
        Zeroizing::new(scalar_from_40_bytes(&kdf[..40])),
        Zeroizing::new(scalar_from_40_bytes(&kdf[40..])),
    )
}

/// Only uncompressed, non-identity points are accepted from the peer.
fn decode_point(data: &[u8]) -> Result<p256::ProjectivePoint> {
    if data.len() != POINT_LEN {
        return Err(Error::malformed(format!("point length {}", data.len())));
    }
    let encoded = p256::EncodedPoint::from_bytes(data).map_err(Error::malformed)?;
    Option::from(p256::ProjectivePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::malformed("not a curve point"))
}

fn append_to_tt(buf: &mut Vec<u8>, data: &[u8]) -> Result<()> {
    buf.write_u64::<LittleEndian>(data.len() as u64)?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Hash input binding the key schedule to both PBKDF parameter messages.
pub fn context_seed(pbkdf_request: &[u8], pbkdf_response: &[u8]) -> Vec<u8> {
    let mut seed = CONTEXT_PREFIX.to_vec();
    seed.extend_from_slice(pbkdf_request);
    seed.extend_from_slice(pbkdf_response);
    seed
}

/// Keys derived from the transcript.
struct KeySchedule {
    kca: Zeroizing<Vec<u8>>,
    kcb: Zeroizing<Vec<u8>>,
    keys: SessionKeys,
}

/// Secret scalars are wiped when the context is dropped.
pub struct ProverContext {
    w0: SecretScalar,
    w1: SecretScalar,
    x_random: SecretScalar,
    pub x: p256::EncodedPoint,
}

pub struct ProverOutput {
    pub ca: Vec<u8>,
    pub keys: SessionKeys,
}

pub struct VerifierContext {
    w0: SecretScalar,
    l: p256::ProjectivePoint,
    y_random: SecretScalar,
    pub y: p256::EncodedPoint,
}

pub struct VerifierOutput {
    pub cb: Vec<u8>,
    kca: Zeroizing<Vec<u8>>,
    y: Vec<u8>,
    keys: SessionKeys,
}

impl VerifierOutput {
    /// Checks the prover's confirmation and hands out the session keys on success.
    pub fn confirm(self, ca: &[u8]) -> Result<SessionKeys> {
        if cryptoutil::hmac_sha256_verify(&self.y, &self.kca, ca)? {
            Ok(self.keys)
        } else {
            Err(Error::HandshakeFailed(HandshakeFailure::ConfirmationMismatch))
        }
    }
}

pub struct Engine {
    m: p256::AffinePoint,
    n: p256::AffinePoint,
}

impl Engine {
    pub fn new() -> Result<Self> {
        let m = Self::constant_point(M_POINT)?;
        let n = Self::constant_point(N_POINT)?;
        Ok(Self { m, n })
    }

    fn constant_point(hex_point: &str) -> Result<p256::AffinePoint> {
        let raw = hex::decode(hex_point).map_err(|e| Error::CryptoFailure(e.to_string()))?;
        let encoded =
            p256::EncodedPoint::from_bytes(raw).map_err(|e| Error::CryptoFailure(e.to_string()))?;
        Option::from(p256::AffinePoint::from_encoded_point(&encoded))
            .ok_or_else(|| Error::CryptoFailure("spake2p constant is not on the curve".to_owned()))
    }

    pub fn start_prover(&self, pin: u32, salt: &[u8], iterations: u32) -> ProverContext {
        let (w0, w1) = derive_w0_w1(&passcode_bytes(pin), salt, iterations);
        let x_random = Zeroizing::new(p256::Scalar::random(rand::thread_rng()));
        let x = self
            .m
            .mul(*w0)
            .add(&p256::ProjectivePoint::GENERATOR.mul(*x_random))
            .to_encoded_point(false);
        ProverContext {
            w0,
            w1,
            x_random,
            x,
        }
    }

    pub fn start_verifier(&self, verifier: &PaseVerifier) -> Result<VerifierContext> {
        let w0 = verifier.w0_scalar()?;
        let l = decode_point(&verifier.l)?;
        let y_random = Zeroizing::new(p256::Scalar::random(rand::thread_rng()));
        let y = self
            .n
            .mul(*w0)
            .add(&p256::ProjectivePoint::GENERATOR.mul(*y_random))
            .to_encoded_point(false);
        Ok(VerifierContext {
            w0,
            l,
            y_random,
            y,
        })
    }

    /// Consumes pB and cB. Fails with a confirmation mismatch when the verifier used a
    /// different passcode.
    pub fn finish_prover(
        &self,
        ctx: &ProverContext,
        seed: &[u8],
        y: &[u8],
        cb: &[u8],
    ) -> Result<ProverOutput> {
        let y_point = decode_point(y)?;
        let zn = y_point.add(&self.n.mul(*ctx.w0).neg());
        let z = zn.mul(*ctx.x_random);
        let v = zn.mul(*ctx.w1);
        let schedule = self.schedule(seed, ctx.x.as_bytes(), y, &z, &v, &ctx.w0)?;

        if !cryptoutil::hmac_sha256_verify(ctx.x.as_bytes(), &schedule.kcb, cb)? {
            return Err(Error::HandshakeFailed(HandshakeFailure::ConfirmationMismatch));
        }
        Ok(ProverOutput {
            ca: cryptoutil::hmac_sha256(y, &schedule.kca)?,
            keys: schedule.keys,
        })
    }

    /// Consumes pA and produces cB. The returned output still has to confirm cA.
    pub fn finish_verifier(
        &self,
        ctx: &VerifierContext,
        seed: &[u8],
        x: &[u8],
    ) -> Result<VerifierOutput> {
        let x_point = decode_point(x)?;
        let zn = x_point.add(&self.m.mul(*ctx.w0).neg());
        let z = zn.mul(*ctx.y_random);
        let v = ctx.l.mul(*ctx.y_random);
        let schedule = self.schedule(seed, x, ctx.y.as_bytes(), &z, &v, &ctx.w0)?;
        Ok(VerifierOutput {
            cb: cryptoutil::hmac_sha256(x, &schedule.kcb)?,
            kca: schedule.kca,
            y: ctx.y.as_bytes().to_vec(),
            keys: schedule.keys,
        })
    }

    fn schedule(
        &self,
        seed: &[u8],
        x: &[u8],
        y: &[u8],
        z: &p256::ProjectivePoint,
        v: &p256::ProjectivePoint,
        w0: &p256::Scalar,
    ) -> Result<KeySchedule> {
        let context = cryptoutil::sha256(seed);
        let mut tt = Zeroizing::new(Vec::with_capacity(512));
        append_to_tt(&mut tt, &context)?;
        append_to_tt(&mut tt, &[])?;
        append_to_tt(&mut tt, &[])?;
        append_to_tt(&mut tt, self.m.to_encoded_point(false).as_bytes())?;
        append_to_tt(&mut tt, self.n.to_encoded_point(false).as_bytes())?;
        append_to_tt(&mut tt, x)?;
        append_to_tt(&mut tt, y)?;
        append_to_tt(&mut tt, z.to_encoded_point(false).as_bytes())?;
        append_to_tt(&mut tt, v.to_encoded_point(false).as_bytes())?;
        append_to_tt(&mut tt, w0.to_bytes().as_slice())?;

        let hash = Zeroizing::new(cryptoutil::sha256(&tt));
        let (ka, ke) = hash.split_at(16);
        let confirmation =
            Zeroizing::new(cryptoutil::hkdf_sha256(&[], ka, b"ConfirmationKeys", 32)?);
        let okm = Zeroizing::new(cryptoutil::hkdf_sha256(&[], ke, b"SessionKeys", 48)?);
        Ok(KeySchedule {
            kca: Zeroizing::new(confirmation[..16].to_vec()),
            kcb: Zeroizing::new(confirmation[16..].to_vec()),
            keys: SessionKeys::from_okm(&okm)?,
        })
    }
}
