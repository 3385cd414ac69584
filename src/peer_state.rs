use std::time::{Duration, Instant};

use crate::{
    counter::{CounterCheck, SessionMessageCounter},
    error::{Error, Result},
    messages::{MessageHeader, ReliabilityParams},
    pase::PairingResult,
    pool::SlotHandle,
    secure_session::{SecureSession, SessionRole},
    transport::PeerAddress,
    util::cryptoutil::MIC_LEN,
};

/// Identity of a table entry as handed to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub handle: SlotHandle,
    pub peer_address: Option<PeerAddress>,
    pub peer_node_id: Option<u64>,
    pub fabric_index: u8,
    pub local_session_id: u16,
    pub peer_session_id: u16,
}

/// Everything known about one secure session with one peer.
#[derive(Default)]
pub struct PeerConnectionState {
    peer_address: Option<PeerAddress>,
    peer_node_id: Option<u64>,
    local_session_id: u16,
    peer_session_id: u16,
    fabric_index: u8,
    last_activity: Option<Instant>,
    handshake_pending: bool,
    peer_reliability: ReliabilityParams,
    session: SecureSession,
    counter: SessionMessageCounter,
}

impl PeerConnectionState {
    pub fn is_initialized(&self) -> bool {
        self.peer_address.is_some()
            || self.peer_node_id.is_some()
            || self.local_session_id != 0
            || self.peer_session_id != 0
    }

    pub fn is_established(&self) -> bool {
        self.session.is_established()
    }

    pub fn peer_address(&self) -> Option<&PeerAddress> {
        self.peer_address.as_ref()
    }

    pub fn set_peer_address(&mut self, address: PeerAddress) {
        self.peer_address = Some(address);
    }

    pub fn peer_node_id(&self) -> Option<u64> {
        self.peer_node_id
    }

    pub fn set_peer_identity(&mut self, node_id: u64, fabric_index: u8) {
        self.peer_node_id = Some(node_id);
        self.fabric_index = fabric_index;
    }

    pub fn local_session_id(&self) -> u16 {
        self.local_session_id
    }

    pub fn peer_session_id(&self) -> u16 {
        self.peer_session_id
    }

    pub fn fabric_index(&self) -> u8 {
        self.fabric_index
    }

    pub fn peer_reliability(&self) -> ReliabilityParams {
        self.peer_reliability
    }

    pub fn session(&self) -> &SecureSession {
        &self.session
    }

    pub fn counter(&self) -> &SessionMessageCounter {
        &self.counter
    }

    pub(crate) fn counter_mut(&mut self) -> &mut SessionMessageCounter {
        &mut self.counter
    }

    pub fn last_activity(&self) -> Option<Instant> {
        self.last_activity
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        self.last_activity
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or(Duration::MAX)
    }

    pub fn is_handshake_pending(&self) -> bool {
        self.handshake_pending
    }

    pub(crate) fn set_handshake_pending(&mut self, pending: bool) {
        self.handshake_pending = pending;
    }

    /// Installs the outcome of a handshake. Fails without touching the entry when it
    /// already carries a session.
    pub fn establish(&mut self, result: PairingResult, now: Instant) -> Result<()> {
        if self.is_established() || self.local_session_id != 0 {
            return Err(Error::invalid("peer connection state already established"));
        }
        if result.local_session_id == 0 || result.peer_session_id == 0 {
            return Err(Error::invalid("session ids must be non-zero"));
        }
        let PairingResult {
            local_session_id,
            peer_session_id,
            role,
            keys,
            peer_reliability,
        } = result;
        self.session.install(keys, role)?;
        self.local_session_id = local_session_id;
        self.peer_session_id = peer_session_id;
        self.peer_reliability = peer_reliability;
        self.handshake_pending = false;
        self.last_activity = Some(now);
        Ok(())
    }

    pub fn role(&self) -> Option<SessionRole> {
        self.session.role()
    }

    pub fn info(&self, handle: SlotHandle) -> PeerInfo {
        PeerInfo {
            handle,
            peer_address: self.peer_address,
            peer_node_id: self.peer_node_id,
            fabric_index: self.fabric_index,
            local_session_id: self.local_session_id,
            peer_session_id: self.peer_session_id,
        }
    }

    /// Frames and encrypts `payload` (exchange header included) for the peer.
    pub fn encrypt_message(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if !self.is_established() {
            return Err(Error::SessionNotEstablished);
        }
        let counter = self.counter.next_send_counter()?;
        let header = MessageHeader::unicast(self.peer_session_id, counter);
        let mut out = header.encode().map_err(Error::malformed)?;
        let (ciphertext, mic) = self.session.encrypt(&header, &out, payload)?;
        out.extend_from_slice(&ciphertext);
        out.extend_from_slice(&mic);
        Ok(out)
    }

    /// Authenticates and decrypts a datagram addressed to this session. The receive window
    /// only moves once the MIC verified.
    pub fn decrypt_message(&mut self, data: &[u8]) -> Result<(MessageHeader, Vec<u8>)> {
        if !self.is_established() {
            return Err(Error::SessionNotEstablished);
        }
        let (header, header_len) = MessageHeader::decode(data).map_err(Error::malformed)?;
        if header.session_id != self.local_session_id {
            return Err(Error::UnknownSession(header.session_id));
        }
        if !header.is_unicast() {
            return Err(Error::malformed("not a unicast session message"));
        }
        if data.len() < header_len + MIC_LEN {
            return Err(Error::malformed("message shorter than mic"));
        }
        match self.counter.check(header.message_counter) {
            CounterCheck::Accept => {}
            CounterCheck::RejectDuplicate | CounterCheck::RejectTooOld => {
                return Err(Error::ReplayOrOutOfWindow(header.message_counter))
            }
        }
        let (header_bytes, rest) = data.split_at(header_len);
        let (ciphertext, mic) = rest.split_at(rest.len() - MIC_LEN);
        let mut mic_arr = [0u8; MIC_LEN];
        mic_arr.copy_from_slice(mic);
        let plaintext = self.session.decrypt(&header, header_bytes, ciphertext, &mic_arr)?;
        self.counter.commit(header.message_counter);
        Ok((header, plaintext))
    }

    /// Clears every field and wipes the keys. Safe from any state.
    pub fn reset(&mut self) {
        self.peer_address = None;
        self.peer_node_id = None;
        self.local_session_id = 0;
        self.peer_session_id = 0;
        self.fabric_index = 0;
        self.last_activity = None;
        self.handshake_pending = false;
        self.peer_reliability = ReliabilityParams::default();
        self.session.reset();
        self.counter.reset();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::secure_session::SessionKeys;

    pub(crate) fn pairing(local: u16, peer: u16, role: SessionRole) -> PairingResult {
        let okm: Vec<u8> = (100u8..148).collect();
        PairingResult {
            local_session_id: local,
            peer_session_id: peer,
            role,
            keys: SessionKeys::from_okm(&okm).unwrap(),
            peer_reliability: ReliabilityParams::default(),
        }
    }

    pub(crate) fn established_pair() -> (PeerConnectionState, PeerConnectionState) {
        let now = Instant::now();
        let mut a = PeerConnectionState::default();
        a.establish(pairing(10, 20, SessionRole::Initiator), now).unwrap();
        let mut b = PeerConnectionState::default();
        b.establish(pairing(20, 10, SessionRole::Responder), now).unwrap();
        (a, b)
    }

    #[test]
    fn message_roundtrip() -> Result<()> {
        let (mut a, mut b) = established_pair();
        let payloads: [&[u8]; 3] = [b"", b"x", &[0x5a; 700]];
        for payload in payloads {
            let wire = a.encrypt_message(payload)?;
            let (_, plain) = b.decrypt_message(&wire)?;
            assert_eq!(plain, payload);
        }
        Ok(())
    }

    #[test]
    fn consecutive_sends_increment_counter_by_one() -> Result<()> {
        let (mut a, _) = established_pair();
        let mut last = None;
        for _ in 0..10 {
            let wire = a.encrypt_message(b"m")?;
            let (header, _) = MessageHeader::decode(&wire).map_err(Error::malformed)?;
            if let Some(prev) = last {
                assert_eq!(header.message_counter, prev + 1);
            }
            last = Some(header.message_counter);
        }
        Ok(())
    }

    #[test]
    fn replay_after_reorder_rejected_new_message_accepted() -> Result<()> {
        let (mut a, mut b) = established_pair();
        let m1 = a.encrypt_message(b"one")?;
        let m2 = a.encrypt_message(b"two")?;
        let m3 = a.encrypt_message(b"three")?;

        assert_eq!(b.decrypt_message(&m2)?.1, b"two");
        b.decrypt_message(&m1)?;
        assert!(matches!(
            b.decrypt_message(&m1),
            Err(Error::ReplayOrOutOfWindow(_))
        ));
        assert_eq!(b.decrypt_message(&m3)?.1, b"three");
        Ok(())
    }

    #[test]
    fn tampered_message_does_not_advance_window() -> Result<()> {
        let (mut a, mut b) = established_pair();
        let good = a.encrypt_message(b"payload")?;
        let mut bad = good.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(matches!(
            b.decrypt_message(&bad),
            Err(Error::AuthenticationFailure)
        ));
        assert_eq!(b.decrypt_message(&good)?.1, b"payload");
        Ok(())
    }

    #[test]
    fn wrong_session_id_and_short_message() -> Result<()> {
        let (mut a, mut b) = established_pair();
        let wire = a.encrypt_message(b"x")?;
        assert!(matches!(
            a.decrypt_message(&wire),
            Err(Error::UnknownSession(20))
        ));
        assert!(matches!(
            b.decrypt_message(&wire[..10]),
            Err(Error::MalformedMessage(_))
        ));
        Ok(())
    }

    #[test]
    fn reset_clears_everything() -> Result<()> {
        let (mut a, _) = established_pair();
        a.set_peer_address(PeerAddress::Ble(1));
        a.set_peer_identity(0x99, 2);
        assert!(a.is_initialized());

        a.reset();
        assert!(!a.is_initialized());
        assert!(!a.is_established());
        assert_eq!(a.fabric_index(), 0);
        assert!(matches!(
            a.encrypt_message(b"x"),
            Err(Error::SessionNotEstablished)
        ));
        assert!(matches!(
            a.decrypt_message(b"whatever"),
            Err(Error::SessionNotEstablished)
        ));
        a.reset();

        a.establish(pairing(1, 2, SessionRole::Initiator), Instant::now())?;
        assert!(a.establish(pairing(3, 4, SessionRole::Initiator), Instant::now()).is_err());
        assert_eq!(a.local_session_id(), 1);
        Ok(())
    }
}
