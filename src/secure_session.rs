use byteorder::{LittleEndian, WriteBytesExt};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{
    error::{Error, Result},
    messages::MessageHeader,
    util::cryptoutil::{self, MIC_LEN, NONCE_LEN, SYMMETRIC_KEY_LEN},
};

/// Output of the handshake key schedule. Wiped when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub i2r: [u8; SYMMETRIC_KEY_LEN],
    pub r2i: [u8; SYMMETRIC_KEY_LEN],
    pub attestation_challenge: [u8; SYMMETRIC_KEY_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

impl SessionKeys {
    pub fn from_okm(okm: &[u8]) -> Result<Self> {
        if okm.len() != 3 * SYMMETRIC_KEY_LEN {
            return Err(Error::CryptoFailure(format!(
                "session key material has {} bytes",
                okm.len()
            )));
        }
        let mut keys = Self {
            i2r: [0; SYMMETRIC_KEY_LEN],
            r2i: [0; SYMMETRIC_KEY_LEN],
            attestation_challenge: [0; SYMMETRIC_KEY_LEN],
        };
        keys.i2r.copy_from_slice(&okm[..16]);
        keys.r2i.copy_from_slice(&okm[16..32]);
        keys.attestation_challenge.copy_from_slice(&okm[32..48]);
        Ok(keys)
    }
}

/// Which side of the handshake this node was. Decides the key direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

/// AES-128-CCM protection of one session's messages.
#[derive(Default)]
pub struct SecureSession {
    keys: Option<SessionKeys>,
    role: Option<SessionRole>,
}

impl SecureSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys can only be installed into an empty session.
    pub fn install(&mut self, keys: SessionKeys, role: SessionRole) -> Result<()> {
        if self.keys.is_some() {
            return Err(Error::invalid("session keys already installed"));
        }
        self.keys = Some(keys);
        self.role = Some(role);
        Ok(())
    }

    pub fn is_established(&self) -> bool {
        self.keys.is_some()
    }

    pub fn role(&self) -> Option<SessionRole> {
        self.role
    }

    pub(crate) fn keys(&self) -> Option<&SessionKeys> {
        self.keys.as_ref()
    }

    pub fn attestation_challenge(&self) -> Option<&[u8]> {
        self.keys.as_ref().map(|k| &k.attestation_challenge[..])
    }

    fn send_key(&self) -> Result<&[u8; SYMMETRIC_KEY_LEN]> {
        match (&self.keys, self.role) {
            (Some(k), Some(SessionRole::Initiator)) => Ok(&k.i2r),
            (Some(k), Some(SessionRole::Responder)) => Ok(&k.r2i),
            _ => Err(Error::SessionNotEstablished),
        }
    }

    fn receive_key(&self) -> Result<&[u8; SYMMETRIC_KEY_LEN]> {
        match (&self.keys, self.role) {
            (Some(k), Some(SessionRole::Initiator)) => Ok(&k.r2i),
            (Some(k), Some(SessionRole::Responder)) => Ok(&k.i2r),
            _ => Err(Error::SessionNotEstablished),
        }
    }

    fn make_nonce(header: &MessageHeader) -> Result<[u8; NONCE_LEN]> {
        let mut out = Vec::with_capacity(NONCE_LEN);
        out.write_u8(header.security_flags)?;
        out.write_u32::<LittleEndian>(header.message_counter)?;
        out.write_u64::<LittleEndian>(header.source_node_id.unwrap_or(0))?;
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&out);
        Ok(nonce)
    }

    /// Encrypts with the send key. `header_bytes` is the encoded `header` and is
    /// authenticated but left in clear.
    pub fn encrypt(
        &self,
        header: &MessageHeader,
        header_bytes: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; MIC_LEN])> {
        let key = self.send_key()?;
        let nonce = Self::make_nonce(header)?;
        let mut ciphertext = plaintext.to_vec();
        let mic = cryptoutil::aes128_ccm_encrypt(key, &nonce, header_bytes, &mut ciphertext)?;
        Ok((ciphertext, mic))
    }

    pub fn decrypt(
        &self,
        header: &MessageHeader,
        header_bytes: &[u8],
        ciphertext: &[u8],
        mic: &[u8; MIC_LEN],
    ) -> Result<Vec<u8>> {
        let key = self.receive_key()?;
        let nonce = Self::make_nonce(header)?;
        let mut plaintext = ciphertext.to_vec();
        cryptoutil::aes128_ccm_decrypt(key, &nonce, header_bytes, &mut plaintext, mic)?;
        Ok(plaintext)
    }

    /// Wipes the keys. Safe to call on an empty session.
    pub fn reset(&mut self) {
        // dropping SessionKeys zeroizes it
        self.keys = None;
        self.role = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> SessionKeys {
        let okm: Vec<u8> = (0u8..48).collect();
        SessionKeys::from_okm(&okm).unwrap()
    }

    fn pair() -> (SecureSession, SecureSession) {
        let mut initiator = SecureSession::new();
        initiator.install(keys(), SessionRole::Initiator).unwrap();
        let mut responder = SecureSession::new();
        responder.install(keys(), SessionRole::Responder).unwrap();
        (initiator, responder)
    }

    #[test]
    fn roundtrip_both_directions() -> Result<()> {
        let (initiator, responder) = pair();
        let mut header = MessageHeader::unicast(0x1234, 77);
        header.source_node_id = Some(0x1122334455667788);
        let header_bytes = header.encode().map_err(Error::malformed)?;

        let (ct, mic) = initiator.encrypt(&header, &header_bytes, b"ping")?;
        assert_eq!(responder.decrypt(&header, &header_bytes, &ct, &mic)?, b"ping");
        // same direction key must not decrypt
        assert!(matches!(
            initiator.decrypt(&header, &header_bytes, &ct, &mic),
            Err(Error::AuthenticationFailure)
        ));

        let (ct, mic) = responder.encrypt(&header, &header_bytes, b"pong")?;
        assert_eq!(initiator.decrypt(&header, &header_bytes, &ct, &mic)?, b"pong");
        Ok(())
    }

    #[test]
    fn header_is_authenticated() -> Result<()> {
        let (initiator, responder) = pair();
        let header = MessageHeader::unicast(5, 1);
        let header_bytes = header.encode().map_err(Error::malformed)?;
        let (ct, mic) = initiator.encrypt(&header, &header_bytes, b"data")?;

        let mut other = header.clone();
        other.message_counter = 2;
        let other_bytes = other.encode().map_err(Error::malformed)?;
        assert!(responder.decrypt(&other, &other_bytes, &ct, &mic).is_err());
        Ok(())
    }

    #[test]
    fn reset_wipes_keys_and_blocks_use() -> Result<()> {
        let (mut initiator, _) = pair();
        assert!(initiator.install(keys(), SessionRole::Initiator).is_err());
        initiator.reset();
        initiator.reset();
        assert!(!initiator.is_established());
        let header = MessageHeader::unicast(5, 1);
        assert!(matches!(
            initiator.encrypt(&header, &[], b"x"),
            Err(Error::SessionNotEstablished)
        ));
        assert!(matches!(
            initiator.decrypt(&header, &[], b"x", &[0; MIC_LEN]),
            Err(Error::SessionNotEstablished)
        ));
        initiator.install(keys(), SessionRole::Responder)?;
        Ok(())
    }
}
