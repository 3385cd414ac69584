//! Suspended sessions kept in persistent storage so a peer can come back without a new
//! handshake.
//!
//! A record is consumed when it is loaded. Resuming the same record twice would reuse
//! send counters under the same keys.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{
    counter::ReceiveWindow,
    error::{Error, Result},
    messages::ReliabilityParams,
    pase::PairingResult,
    peer_state::PeerConnectionState,
    secure_session::{SessionKeys, SessionRole},
    storage::{PersistentStorageDelegate, StorageError},
};

const KEY_PREFIX: &str = "sess-res/";
const MAX_RECORD_LEN: usize = 1024;

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct ResumptionRecord {
    peer_node_id: Option<u64>,
    fabric_index: u8,
    local_session_id: u16,
    peer_session_id: u16,
    initiator: bool,
    i2r: String,
    r2i: String,
    attestation_challenge: String,
    next_send_counter: u32,
    rx_max: Option<u32>,
    rx_bitmap: u32,
    peer_idle_retrans_ms: u32,
    peer_active_retrans_ms: u32,
}

/// State restored from a record, ready to be installed into a fresh table entry.
pub struct ResumedSession {
    pub pairing: PairingResult,
    pub peer_node_id: Option<u64>,
    pub fabric_index: u8,
    pub next_send_counter: u32,
    pub receive_window: Option<ReceiveWindow>,
}

fn storage_key(resumption_id: &[u8]) -> String {
    format!("{}{}", KEY_PREFIX, hex::encode(resumption_id))
}

fn decode_key(s: &str) -> Result<[u8; 16]> {
    let raw = Zeroizing::new(hex::decode(s).map_err(Error::malformed)?);
    raw.as_slice()
        .try_into()
        .map_err(|_| Error::malformed("resumption key length"))
}

pub struct ResumptionStore {
    storage: Arc<dyn PersistentStorageDelegate>,
}

impl ResumptionStore {
    pub fn new(storage: Arc<dyn PersistentStorageDelegate>) -> Self {
        Self { storage }
    }

    pub fn save(&self, resumption_id: &[u8], entry: &PeerConnectionState) -> Result<()> {
        let keys = entry.session().keys().ok_or(Error::SessionNotEstablished)?;
        let window = entry.counter().receive_window();
        let record = ResumptionRecord {
            peer_node_id: entry.peer_node_id(),
            fabric_index: entry.fabric_index(),
            local_session_id: entry.local_session_id(),
            peer_session_id: entry.peer_session_id(),
            initiator: entry.role() == Some(SessionRole::Initiator),
            i2r: hex::encode(keys.i2r),
            r2i: hex::encode(keys.r2i),
            attestation_challenge: hex::encode(keys.attestation_challenge),
            next_send_counter: entry.counter().peek_send_counter(),
            rx_max: window.map(|w| w.max),
            rx_bitmap: window.map(|w| w.bitmap).unwrap_or(0),
            peer_idle_retrans_ms: entry.peer_reliability().idle_retrans_ms,
            peer_active_retrans_ms: entry.peer_reliability().active_retrans_ms,
        };
        let data = Zeroizing::new(serde_json::to_vec(&record).map_err(Error::malformed)?);
        self.storage
            .sync_set_key_value(&storage_key(resumption_id), &data)?;
        Ok(())
    }

    /// Loads and deletes the record.
    pub fn take(&self, resumption_id: &[u8]) -> Result<ResumedSession> {
        let key = storage_key(resumption_id);
        let mut buf = Zeroizing::new(vec![0u8; MAX_RECORD_LEN]);
        let len = match self.storage.sync_get_key_value(&key, &mut buf) {
            Ok(len) => len,
            Err(StorageError::BufferTooSmall { required }) => {
                buf = Zeroizing::new(vec![0u8; required]);
                self.storage.sync_get_key_value(&key, &mut buf)?
            }
            Err(e) => return Err(e.into()),
        };
        self.storage.sync_delete_key_value(&key)?;

        let record: ResumptionRecord =
            serde_json::from_slice(&buf[..len]).map_err(Error::malformed)?;
        let keys = SessionKeys {
            i2r: decode_key(&record.i2r)?,
            r2i: decode_key(&record.r2i)?,
            attestation_challenge: decode_key(&record.attestation_challenge)?,
        };
        Ok(ResumedSession {
            pairing: PairingResult {
                local_session_id: record.local_session_id,
                peer_session_id: record.peer_session_id,
                role: if record.initiator {
                    SessionRole::Initiator
                } else {
                    SessionRole::Responder
                },
                keys,
                peer_reliability: ReliabilityParams {
                    idle_retrans_ms: record.peer_idle_retrans_ms,
                    active_retrans_ms: record.peer_active_retrans_ms,
                },
            },
            peer_node_id: record.peer_node_id,
            fabric_index: record.fabric_index,
            next_send_counter: record.next_send_counter,
            receive_window: record.rx_max.map(|max| ReceiveWindow {
                max,
                bitmap: record.rx_bitmap,
            }),
        })
    }

    /// Deletes the record without loading it.
    pub fn discard(&self, resumption_id: &[u8]) -> Result<()> {
        self.storage
            .sync_delete_key_value(&storage_key(resumption_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_state::tests::established_pair;
    use crate::storage::MemoryStorage;

    #[test]
    fn record_restores_counters_and_is_single_use() -> Result<()> {
        let (mut a, mut b) = established_pair();
        a.set_peer_identity(0xabcd, 3);
        let m1 = a.encrypt_message(b"before")?;
        b.decrypt_message(&m1)?;
        let store = ResumptionStore::new(Arc::new(MemoryStorage::new()));
        store.save(b"rid", &b)?;
        let sent_next = a.counter().peek_send_counter();
        store.save(b"rid-a", &a)?;

        let resumed = store.take(b"rid")?;
        assert_eq!(resumed.pairing.local_session_id, 20);
        assert_eq!(resumed.pairing.role, SessionRole::Responder);
        assert!(resumed.receive_window.is_some());
        assert!(matches!(
            store.take(b"rid"),
            Err(Error::Storage(StorageError::NotFound))
        ));

        let resumed_a = store.take(b"rid-a")?;
        assert_eq!(resumed_a.next_send_counter, sent_next);
        assert_eq!(resumed_a.peer_node_id, Some(0xabcd));
        assert_eq!(resumed_a.fabric_index, 3);
        Ok(())
    }

    #[test]
    fn unestablished_entry_cannot_be_saved() {
        let store = ResumptionStore::new(Arc::new(MemoryStorage::new()));
        let entry = PeerConnectionState::default();
        assert!(matches!(
            store.save(b"x", &entry),
            Err(Error::SessionNotEstablished)
        ));
        assert!(store.discard(b"x").is_err());
    }

    fn wiped_on_drop<T: ZeroizeOnDrop>(_: &T) {}

    #[test]
    fn oversized_record_is_read_into_a_fresh_buffer() -> Result<()> {
        let (a, _) = established_pair();
        let storage = Arc::new(MemoryStorage::new());
        let store = ResumptionStore::new(storage.clone());
        store.save(b"big", &a)?;

        // pad the stored json past the first read buffer
        let key = storage_key(b"big");
        let mut raw = vec![0u8; MAX_RECORD_LEN];
        let len = storage.sync_get_key_value(&key, &mut raw)?;
        raw.truncate(len);
        raw.resize(MAX_RECORD_LEN * 2, b' ');
        storage.sync_set_key_value(&key, &raw)?;

        let resumed = store.take(b"big")?;
        assert_eq!(resumed.pairing.local_session_id, a.local_session_id());
        assert_eq!(
            resumed.pairing.keys.i2r,
            a.session().keys().map(|k| k.i2r).unwrap_or_default()
        );

        let record: ResumptionRecord = serde_json::from_slice(&raw).map_err(Error::malformed)?;
        wiped_on_drop(&record);
        Ok(())
    }
}
