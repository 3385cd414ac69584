use aes::cipher::crypto_common;
use ccm::aead::AeadInPlace;
use hmac::Mac;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const SYMMETRIC_KEY_LEN: usize = 16;
pub const MIC_LEN: usize = 16;
pub const NONCE_LEN: usize = 13;

type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;

pub fn hkdf_sha256(salt: &[u8], secret: &[u8], info: &[u8], size: usize) -> Result<Vec<u8>> {
    let hk = hkdf::Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = vec![0u8; size];
    match hk.expand(info, &mut okm) {
        Ok(()) => Ok(okm),
        Err(e) => Err(Error::CryptoFailure(format!("hkdf error {:?}", e))),
    }
}

pub fn hmac_sha256(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut hm = hmac::Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::CryptoFailure(format!("can't create hmac {:?}", e)))?;
    hm.update(data);
    Ok(hm.finalize().into_bytes().to_vec())
}

/// Constant time check of an HMAC-SHA256 tag.
pub fn hmac_sha256_verify(data: &[u8], key: &[u8], expected: &[u8]) -> Result<bool> {
    let mut hm = hmac::Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::CryptoFailure(format!("can't create hmac {:?}", e)))?;
    hm.update(data);
    Ok(hm.verify_slice(expected).is_ok())
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// Encrypts `msg` in place and returns the detached MIC.
pub fn aes128_ccm_encrypt(
    key: &[u8; SYMMETRIC_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    msg: &mut [u8],
) -> Result<[u8; MIC_LEN]> {
    let key = crypto_common::Key::<Aes128Ccm>::from_slice(key);
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    match cipher.encrypt_in_place_detached(
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        aad,
        msg,
    ) {
        Ok(tag) => {
            let mut mic = [0u8; MIC_LEN];
            mic.copy_from_slice(tag.as_slice());
            Ok(mic)
        }
        Err(e) => Err(Error::CryptoFailure(format!("encrypt error {:?}", e))),
    }
}

/// Decrypts `msg` in place. A MIC mismatch is an authentication failure, the buffer
/// content is unspecified afterwards.
pub fn aes128_ccm_decrypt(
    key: &[u8; SYMMETRIC_KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    msg: &mut [u8],
    mic: &[u8; MIC_LEN],
) -> Result<()> {
    let key = crypto_common::Key::<Aes128Ccm>::from_slice(key);
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    cipher
        .decrypt_in_place_detached(
            crypto_common::generic_array::GenericArray::from_slice(nonce),
            aad,
            msg,
            crypto_common::generic_array::GenericArray::from_slice(mic),
        )
        .map_err(|_| Error::AuthenticationFailure)
}
