//! Entry point of the session layer: owns the peer connection table, runs PASE
//! handshakes over the unsecured session and moves application payloads through the
//! secure sessions.
//!
//! All methods are expected to run on one task. Cross task access goes through
//! [crate::stack].

use std::{sync::Arc, time::Instant};

use crate::{
    config::SessionConfig,
    counter::SessionMessageCounter,
    error::{Error, Result},
    messages::{
        self, opcode, Destination, MessageHeader, ProtocolHeader, ProtocolMessage, StatusReport,
    },
    onboarding,
    pase::{PaseParams, PaseSession, PaseState, PbkdfParams, RendezvousDelegate},
    peer_state::PeerInfo,
    peer_table::PeerConnectionTable,
    pool::SlotHandle,
    resumption::ResumptionStore,
    retransmit::{RetransmitAction, RetransmitContext},
    spake2p::PaseVerifier,
    storage::PersistentStorageDelegate,
    transport::{PeerAddress, TransportSend},
};

/// Consumer of decrypted traffic.
pub trait SessionDelegate: Send + Sync {
    /// `payload` is the application part, after the exchange header.
    fn on_message_received(&self, peer: &PeerInfo, header: &ProtocolHeader, payload: &[u8]);
    /// The session is gone: released, evicted, expired or out of counters.
    fn on_session_released(&self, peer: &PeerInfo);
}

/// Credentials a device advertises while it accepts PASE.
pub struct CommissioningWindowParams {
    pub setup_pin: Option<u32>,
    pub verifier: Option<PaseVerifier>,
    pub pbkdf: PbkdfParams,
    pub discriminator: u16,
}

struct CommissioningWindow {
    verifier: PaseVerifier,
    pbkdf: PbkdfParams,
    discriminator: u16,
    delegate: Arc<dyn RendezvousDelegate>,
}

struct Handshake {
    pase: PaseSession,
    slot: SlotHandle,
    peer: PeerAddress,
    retransmit: RetransmitContext,
    source_node_id: Option<u64>,
    destination: Destination,
    populated: bool,
    /// failed and its slot is back in the table, kept only to resend the failure report
    slot_released: bool,
}

pub struct SessionManager {
    config: SessionConfig,
    table: PeerConnectionTable,
    transport: Arc<dyn TransportSend>,
    delegate: Arc<dyn SessionDelegate>,
    resumption: Option<ResumptionStore>,
    unsecured_counter: SessionMessageCounter,
    handshakes: Vec<Handshake>,
    window: Option<CommissioningWindow>,
}

impl SessionManager {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn TransportSend>,
        delegate: Arc<dyn SessionDelegate>,
    ) -> Self {
        let table = PeerConnectionTable::new(config.table_capacity, config.idle_timeout());
        Self {
            config,
            table,
            transport,
            delegate,
            resumption: None,
            unsecured_counter: SessionMessageCounter::new(),
            handshakes: Vec::new(),
            window: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn PersistentStorageDelegate>) -> Self {
        self.resumption = Some(ResumptionStore::new(storage));
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn table(&self) -> &PeerConnectionTable {
        &self.table
    }

    pub fn peer_info(&self, handle: SlotHandle) -> Option<PeerInfo> {
        self.table
            .get(handle)
            .filter(|e| e.is_established())
            .map(|e| e.info(handle))
    }

    pub fn find_by_node_id(&self, node_id: u64) -> Option<SlotHandle> {
        self.table.find_by_node_id(node_id)
    }

    pub fn find_by_session_id(&self, local_session_id: u16) -> Option<SlotHandle> {
        self.table.find_by_session_id(local_session_id)
    }

    pub fn pending_handshakes(&self) -> usize {
        self.handshakes
            .iter()
            .filter(|h| !h.pase.state().is_terminal())
            .count()
    }

    /// Assigns the operational identity learned after commissioning.
    pub fn set_peer_identity(
        &mut self,
        handle: SlotHandle,
        node_id: u64,
        fabric_index: u8,
    ) -> Result<()> {
        let entry = self
            .table
            .get_mut(handle)
            .filter(|e| e.is_established())
            .ok_or(Error::SessionNotEstablished)?;
        entry.set_peer_identity(node_id, fabric_index);
        Ok(())
    }

    fn new_session_id(&self) -> Result<u16> {
        for _ in 0..64 {
            let id: u16 = rand::random();
            if id != 0
                && !self.table.is_session_id_in_use(id)
                && !self.handshakes.iter().any(|h| h.pase.local_session_id() == id)
            {
                return Ok(id);
            }
        }
        Err(Error::ResourceExhausted)
    }

    fn notify_evicted(&mut self) {
        for info in self.table.drain_evicted() {
            self.delegate.on_session_released(&info);
        }
    }

    fn reserve_slot(&mut self, peer: PeerAddress, now: Instant) -> Result<SlotHandle> {
        let slot = self.table.allocate(peer, now)?;
        self.notify_evicted();
        if let Some(entry) = self.table.get_mut(slot) {
            entry.set_handshake_pending(true);
        }
        Ok(slot)
    }

    fn release_reserved(&mut self, slot: SlotHandle) {
        if self.table.get(slot).is_some() {
            let _ = self.table.release(slot);
        }
    }

    /// Starts PASE towards a commissionee. The returned handle names the entry that
    /// holds the session once `on_rendezvous_connection_opened` fired.
    pub fn pair_pase(
        &mut self,
        peer: PeerAddress,
        setup_pin: u32,
        delegate: Arc<dyn RendezvousDelegate>,
        now: Instant,
    ) -> Result<SlotHandle> {
        let local_session_id = self.new_session_id()?;
        let mut params = PaseParams::commissioner(setup_pin, peer, local_session_id);
        params.reliability = self.config.reliability();
        params.timeout = self.config.handshake_timeout();
        let mut pase = PaseSession::init(params, delegate)?;

        let slot = self.reserve_slot(peer, now)?;
        let first = match pase.start(now) {
            Ok(Some(m)) => m,
            Ok(None) => {
                self.release_reserved(slot);
                return Err(Error::invalid("commissioner produced no request"));
            }
            Err(e) => {
                self.release_reserved(slot);
                return Err(e);
            }
        };
        log::debug!(
            "pase to {} started, local session {}",
            peer,
            local_session_id
        );
        self.handshakes.push(Handshake {
            pase,
            slot,
            peer,
            retransmit: RetransmitContext::new(self.config.reliability()),
            source_node_id: Some(rand::random()),
            destination: Destination::None,
            populated: false,
            slot_released: false,
        });
        let idx = self.handshakes.len() - 1;
        self.send_handshake_message(idx, first, None, now)?;
        Ok(slot)
    }

    /// Aborts an unfinished pairing started by [Self::pair_pase].
    pub fn cancel_pairing(&mut self, slot: SlotHandle) -> Result<()> {
        let idx = self
            .handshakes
            .iter()
            .position(|h| h.slot == slot && !h.pase.state().is_terminal())
            .ok_or_else(|| Error::invalid("no pairing in progress for handle"))?;
        let mut handshake = self.handshakes.remove(idx);
        handshake.pase.shutdown();
        self.release_reserved(slot);
        Ok(())
    }

    pub fn open_commissioning_window(
        &mut self,
        params: CommissioningWindowParams,
        delegate: Arc<dyn RendezvousDelegate>,
    ) -> Result<()> {
        if params.discriminator > onboarding::MAX_DISCRIMINATOR {
            return Err(Error::invalid("discriminator out of range"));
        }
        params.pbkdf.validate()?;
        let verifier = match (params.verifier, params.setup_pin) {
            (Some(v), _) => v,
            (None, Some(pin)) if onboarding::is_valid_setup_pin(pin) => {
                PaseVerifier::generate(pin, &params.pbkdf.salt, params.pbkdf.iterations)
            }
            (None, Some(_)) => return Err(Error::invalid("invalid setup pin")),
            (None, None) => {
                return Err(Error::invalid("neither setup pin nor pase verifier supplied"))
            }
        };
        log::debug!(
            "commissioning window open, discriminator {}",
            params.discriminator
        );
        self.window = Some(CommissioningWindow {
            verifier,
            pbkdf: params.pbkdf,
            discriminator: params.discriminator,
            delegate,
        });
        Ok(())
    }

    /// Stops accepting new PASE requests. Handshakes already running continue.
    pub fn close_commissioning_window(&mut self) {
        self.window = None;
    }

    pub fn is_commissioning_window_open(&self) -> bool {
        self.window.is_some()
    }

    fn frame_unsecured(
        &mut self,
        msg: &ProtocolMessage,
        source_node_id: Option<u64>,
        destination: Destination,
    ) -> Result<(u32, Vec<u8>)> {
        let counter = self.unsecured_counter.next_send_counter()?;
        let header = MessageHeader {
            session_id: messages::UNSECURED_SESSION_ID,
            security_flags: 0,
            message_counter: counter,
            source_node_id,
            destination,
        };
        let mut out = header.encode().map_err(Error::malformed)?;
        out.extend_from_slice(&msg.encode().map_err(Error::malformed)?);
        Ok((counter, out))
    }

    fn send_handshake_message(
        &mut self,
        idx: usize,
        mut msg: ProtocolMessage,
        ack: Option<u32>,
        now: Instant,
    ) -> Result<()> {
        msg.header = msg.header.with_ack(ack);
        let (source, destination, peer) = {
            let h = &self.handshakes[idx];
            (h.source_node_id, h.destination, h.peer)
        };
        let (counter, datagram) = self.frame_unsecured(&msg, source, destination)?;
        if msg.header.needs_ack() {
            self.handshakes[idx]
                .retransmit
                .sent_reliable(counter, ack, &datagram, now);
        }
        log::trace!(
            "pase send opcode {:#x} counter {} to {}",
            msg.header.opcode,
            counter,
            peer
        );
        // a lost handshake message is recovered by retransmission
        if let Err(e) = self.transport.send(&peer, &datagram) {
            log::debug!("sending handshake message to {} failed: {}", peer, e);
        }
        Ok(())
    }

    fn standalone_ack(exchange_id: u16, initiator: bool, counter: u32) -> ProtocolMessage {
        let mut header =
            ProtocolHeader::secure_channel(opcode::STANDALONE_ACK, exchange_id, initiator)
                .with_ack(Some(counter));
        header.exchange_flags &= !ProtocolHeader::FLAG_RELIABILITY;
        ProtocolMessage {
            header,
            payload: Vec::new(),
        }
    }

    /// Feeds one datagram from the transport. Errors describe why the datagram was
    /// dropped; nothing is ever sent back for them.
    pub fn on_datagram(&mut self, peer: PeerAddress, data: &[u8], now: Instant) -> Result<()> {
        let session_id = messages::peek_session_id(data)
            .ok_or_else(|| Error::malformed("datagram shorter than header"))?;
        if session_id == messages::UNSECURED_SESSION_ID {
            let (header, len) = MessageHeader::decode(data).map_err(Error::malformed)?;
            if !header.is_unicast() {
                return Err(Error::malformed("unsecured group message"));
            }
            let msg = ProtocolMessage::decode(&data[len..]).map_err(Error::malformed)?;
            self.on_unsecured(peer, header, msg, now);
            return Ok(());
        }

        let handle = match self.table.find_by_session_id(session_id) {
            Some(h) => h,
            None => {
                log::debug!("dropping message for unknown session {}", session_id);
                return Err(Error::UnknownSession(session_id));
            }
        };
        let entry = self
            .table
            .get_mut(handle)
            .ok_or(Error::UnknownSession(session_id))?;
        let (_, plaintext) = match entry.decrypt_message(data) {
            Ok(r) => r,
            Err(e) => {
                if e.is_silent_drop() {
                    log::debug!("session {} dropping message: {}", session_id, e);
                } else {
                    log::warn!("session {}: {}", session_id, e);
                }
                return Err(e);
            }
        };
        entry.touch(now);
        if entry.peer_address() != Some(&peer) {
            log::debug!("session {} peer moved to {}", session_id, peer);
            entry.set_peer_address(peer);
        }
        let info = entry.info(handle);
        let msg = ProtocolMessage::decode(&plaintext).map_err(Error::malformed)?;
        if msg.header.is_secure_channel(opcode::STANDALONE_ACK) {
            return Ok(());
        }
        self.delegate
            .on_message_received(&info, &msg.header, &msg.payload);
        Ok(())
    }

    fn on_unsecured(
        &mut self,
        peer: PeerAddress,
        header: MessageHeader,
        msg: ProtocolMessage,
        now: Instant,
    ) {
        let idx = self
            .handshakes
            .iter()
            .position(|h| h.peer == peer && h.pase.exchange_id() == msg.header.exchange_id);
        let idx = match idx {
            Some(idx) => idx,
            None => {
                if msg.header.is_secure_channel(opcode::PBKDF_PARAM_REQUEST)
                    && msg.header.is_initiator()
                {
                    match self.accept_commissionee(peer, &header, &msg, now) {
                        Some(idx) => idx,
                        None => return,
                    }
                } else {
                    log::debug!(
                        "dropping unsecured opcode {:#x} from {}, no handshake",
                        msg.header.opcode,
                        peer
                    );
                    return;
                }
            }
        };
        self.drive_handshake(idx, &header, &msg, now);
        self.finish_handshakes(now);
    }

    fn accept_commissionee(
        &mut self,
        peer: PeerAddress,
        header: &MessageHeader,
        msg: &ProtocolMessage,
        now: Instant,
    ) -> Option<usize> {
        let (verifier, pbkdf, discriminator, delegate) = match &self.window {
            Some(w) => (
                w.verifier.clone(),
                w.pbkdf.clone(),
                w.discriminator,
                w.delegate.clone(),
            ),
            None => {
                log::debug!("pase request from {} while commissioning window closed", peer);
                return None;
            }
        };
        let destination = header
            .source_node_id
            .map(Destination::Node)
            .unwrap_or(Destination::None);

        let local_session_id = match self.new_session_id() {
            Ok(id) => id,
            Err(e) => {
                log::debug!("no session id for {}: {}", peer, e);
                self.send_busy(peer, header, msg, destination);
                return None;
            }
        };
        let slot = match self.reserve_slot(peer, now) {
            Ok(s) => s,
            Err(e) => {
                log::debug!("rejecting pase from {}: {}", peer, e);
                self.send_busy(peer, header, msg, destination);
                return None;
            }
        };
        let mut params = PaseParams::commissionee(pbkdf, discriminator, local_session_id)
            .with_verifier(verifier);
        params.peer_address = Some(peer);
        params.reliability = self.config.reliability();
        params.timeout = self.config.handshake_timeout();
        let pase = PaseSession::init(params, delegate).and_then(|mut p| {
            p.start(now)?;
            Ok(p)
        });
        let pase = match pase {
            Ok(p) => p,
            Err(e) => {
                log::warn!("can't set up pase responder: {}", e);
                self.release_reserved(slot);
                return None;
            }
        };
        log::debug!(
            "pase from {} accepted, discriminator {} local session {}",
            peer,
            pase.discriminator(),
            local_session_id
        );
        self.handshakes.push(Handshake {
            pase,
            slot,
            peer,
            retransmit: RetransmitContext::new(self.config.reliability()),
            source_node_id: None,
            destination,
            populated: false,
            slot_released: false,
        });
        Some(self.handshakes.len() - 1)
    }

    fn send_busy(
        &mut self,
        peer: PeerAddress,
        header: &MessageHeader,
        msg: &ProtocolMessage,
        destination: Destination,
    ) {
        let payload = match StatusReport::busy().encode() {
            Ok(p) => p,
            Err(_) => return,
        };
        let exchange_id = msg.header.exchange_id;
        let mut reply_header =
            ProtocolHeader::secure_channel(opcode::STATUS_REPORT, exchange_id, false)
                .with_ack(Some(header.message_counter));
        reply_header.exchange_flags &= !ProtocolHeader::FLAG_RELIABILITY;
        let reply = ProtocolMessage {
            header: reply_header,
            payload,
        };
        match self.frame_unsecured(&reply, None, destination) {
            Ok((_, datagram)) => {
                if let Err(e) = self.transport.send(&peer, &datagram) {
                    log::debug!("busy report to {} failed: {}", peer, e);
                }
            }
            Err(e) => log::debug!("can't frame busy report: {}", e),
        }
    }

    fn drive_handshake(
        &mut self,
        idx: usize,
        header: &MessageHeader,
        msg: &ProtocolMessage,
        now: Instant,
    ) {
        let counter = header.message_counter;
        let initiator = {
            let h = &mut self.handshakes[idx];
            if let Some(ack) = msg.header.ack_counter {
                h.retransmit.received_ack(ack);
            }
            if !h.retransmit.received(counter) {
                log::trace!("dropping duplicate handshake message counter:{}", counter);
                if !msg.header.needs_ack() {
                    return;
                }
                // our answer got lost, send it again with its piggybacked ack
                if let Some(reply) = h.retransmit.reply_for(counter) {
                    let peer = h.peer;
                    if let Err(e) = self.transport.send(&peer, reply) {
                        log::debug!("resending reply to {} failed: {}", peer, e);
                    }
                    return;
                }
                let initiator = !msg.header.is_initiator();
                let ack = Self::standalone_ack(msg.header.exchange_id, initiator, counter);
                if let Err(e) = self.send_handshake_message(idx, ack, Some(counter), now) {
                    log::debug!("ack failed: {}", e);
                }
                return;
            }
            if msg.header.is_secure_channel(opcode::STANDALONE_ACK) {
                return;
            }
            !msg.header.is_initiator()
        };

        let reply = {
            let h = &mut self.handshakes[idx];
            let was_failed = h.pase.state() == PaseState::Failed;
            let reply = h.pase.handle_message(msg, now);
            h.retransmit.set_peer_params(h.pase.peer_reliability());
            if !was_failed && h.pase.state() == PaseState::Failed && reply.is_none() {
                h.retransmit.stop();
            }
            reply
        };
        let ack = if msg.header.needs_ack() {
            Some(header.message_counter)
        } else {
            None
        };
        let sent = match (reply, ack) {
            (Some(reply), ack) => self.send_handshake_message(idx, reply, ack, now),
            (None, Some(counter)) => {
                let standalone = Self::standalone_ack(msg.header.exchange_id, initiator, counter);
                self.send_handshake_message(idx, standalone, Some(counter), now)
            }
            (None, None) => Ok(()),
        };
        if let Err(e) = sent {
            log::debug!("handshake reply failed: {}", e);
        }
    }

    /// Installs finished handshakes into their slots and drops the dead ones.
    fn finish_handshakes(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.handshakes.len() {
            let h = &mut self.handshakes[i];
            if let Some(result) = h.pase.take_established() {
                let installed = match self.table.get_mut(h.slot) {
                    Some(entry) => entry.establish(result, now),
                    None => Err(Error::invalid("handshake slot vanished")),
                };
                match installed {
                    Ok(()) => h.populated = true,
                    Err(e) => {
                        log::warn!("can't install pase session: {}", e);
                        h.pase.shutdown();
                        h.retransmit.stop();
                    }
                }
            }
            if h.pase.state() == PaseState::Failed && !h.populated && !h.slot_released {
                if self.table.get(h.slot).is_some() {
                    let _ = self.table.release(h.slot);
                }
                h.slot_released = true;
            }
            let remove = match h.pase.state() {
                PaseState::Failed => !h.retransmit.has_pending(),
                PaseState::Established => h.populated && !h.retransmit.has_pending(),
                _ => false,
            };
            if remove {
                let h = self.handshakes.remove(i);
                if !h.populated && !h.slot_released {
                    self.release_reserved(h.slot);
                }
            } else {
                i += 1;
            }
        }
    }

    /// Encrypts `payload` (exchange header included) and sends it to the session's peer.
    pub fn send(&mut self, handle: SlotHandle, payload: &[u8]) -> Result<()> {
        let entry = self
            .table
            .get_mut(handle)
            .ok_or_else(|| Error::invalid("stale session handle"))?;
        let peer = *entry.peer_address().ok_or(Error::SessionNotEstablished)?;
        let datagram = match entry.encrypt_message(payload) {
            Ok(d) => d,
            Err(Error::CounterExhausted) => {
                let info = entry.info(handle);
                log::warn!(
                    "session {} ran out of message counters, releasing",
                    info.local_session_id
                );
                self.table.release(handle)?;
                self.delegate.on_session_released(&info);
                return Err(Error::CounterExhausted);
            }
            Err(e) => return Err(e),
        };
        self.transport.send(&peer, &datagram)?;
        Ok(())
    }

    /// Tears a session down. Also cancels a pairing still running on that slot.
    pub fn release(&mut self, handle: SlotHandle) -> Result<()> {
        if let Some(idx) = self
            .handshakes
            .iter()
            .position(|h| h.slot == handle && !h.slot_released)
        {
            let mut h = self.handshakes.remove(idx);
            if !h.populated {
                h.pase.shutdown();
            }
        }
        let info = self
            .table
            .get(handle)
            .map(|e| (e.is_established(), e.info(handle)))
            .ok_or_else(|| Error::invalid("stale session handle"))?;
        self.table.release(handle)?;
        if info.0 {
            self.delegate.on_session_released(&info.1);
        }
        Ok(())
    }

    /// Drives handshake timeouts, retransmissions and idle expiry.
    pub fn on_timer(&mut self, now: Instant) {
        for idx in 0..self.handshakes.len() {
            let action = {
                let h = &mut self.handshakes[idx];
                let was_running = !h.pase.state().is_terminal();
                h.pase.on_timer(now);
                if was_running && h.pase.state() == PaseState::Failed {
                    h.retransmit.stop();
                }
                h.retransmit.poll(now)
            };
            match action {
                RetransmitAction::Resend(datagram) => {
                    let peer = self.handshakes[idx].peer;
                    if let Err(e) = self.transport.send(&peer, &datagram) {
                        log::debug!("retransmission to {} failed: {}", peer, e);
                    }
                }
                RetransmitAction::GiveUp => {
                    log::debug!("peer {} stopped acknowledging", self.handshakes[idx].peer)
                }
                RetransmitAction::Nothing => {}
            }
        }
        self.finish_handshakes(now);
        for info in self.table.expire_idle(now) {
            self.delegate.on_session_released(&info);
        }
    }

    /// Persists an established session under `resumption_id` and frees its slot.
    pub fn suspend(&mut self, handle: SlotHandle, resumption_id: &[u8]) -> Result<()> {
        let store = self
            .resumption
            .as_ref()
            .ok_or_else(|| Error::invalid("no persistent storage configured"))?;
        let entry = self
            .table
            .get(handle)
            .ok_or_else(|| Error::invalid("stale session handle"))?;
        store.save(resumption_id, entry)?;
        let info = entry.info(handle);
        self.table.release(handle)?;
        self.delegate.on_session_released(&info);
        Ok(())
    }

    /// Deletes a suspended session that will not be resumed.
    pub fn discard_suspended(&mut self, resumption_id: &[u8]) -> Result<()> {
        self.resumption
            .as_ref()
            .ok_or_else(|| Error::invalid("no persistent storage configured"))?
            .discard(resumption_id)
    }

    /// Brings a suspended session back. The stored record is consumed.
    pub fn resume(
        &mut self,
        resumption_id: &[u8],
        peer: PeerAddress,
        now: Instant,
    ) -> Result<SlotHandle> {
        if self.resumption.is_none() {
            return Err(Error::invalid("no persistent storage configured"));
        }
        let slot = self.table.allocate(peer, now)?;
        self.notify_evicted();
        match self.restore(slot, resumption_id, now) {
            Ok(()) => Ok(slot),
            Err(e) => {
                self.release_reserved(slot);
                Err(e)
            }
        }
    }

    fn restore(&mut self, slot: SlotHandle, resumption_id: &[u8], now: Instant) -> Result<()> {
        let store = self
            .resumption
            .as_ref()
            .ok_or_else(|| Error::invalid("no persistent storage configured"))?;
        let resumed = store.take(resumption_id)?;
        let local_id = resumed.pairing.local_session_id;
        if self.table.is_session_id_in_use(local_id)
            || self.handshakes.iter().any(|h| h.pase.local_session_id() == local_id)
        {
            return Err(Error::invalid(format!("session id {} already in use", local_id)));
        }
        let entry = self.table.get_mut(slot).ok_or(Error::ResourceExhausted)?;
        entry.establish(resumed.pairing, now)?;
        if let Some(node_id) = resumed.peer_node_id {
            entry.set_peer_identity(node_id, resumed.fabric_index);
        }
        let counter = entry.counter_mut();
        *counter = SessionMessageCounter::with_send_counter(resumed.next_send_counter);
        counter.restore_receive_window(resumed.receive_window);
        log::debug!("resumed session {}", local_id);
        Ok(())
    }

    /// Cancels every handshake and releases every session.
    pub fn shutdown(&mut self) {
        for mut h in std::mem::take(&mut self.handshakes) {
            if !h.populated && !h.slot_released {
                h.pase.shutdown();
                self.release_reserved(h.slot);
            }
        }
        self.window = None;
        let handles: Vec<SlotHandle> = self.table.iter().map(|(h, _)| h).collect();
        for handle in handles {
            if let Err(e) = self.release(handle) {
                log::debug!("release during shutdown: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandshakeFailure;
    use crate::pase::tests::{Event, Recorder, PIN};
    use crate::storage::MemoryStorage;
    use crate::transport::MemoryTransport;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct App {
        messages: Mutex<Vec<(PeerInfo, Vec<u8>)>>,
        released: Mutex<Vec<PeerInfo>>,
    }

    impl SessionDelegate for App {
        fn on_message_received(&self, peer: &PeerInfo, _header: &ProtocolHeader, payload: &[u8]) {
            self.messages
                .lock()
                .unwrap()
                .push((peer.clone(), payload.to_vec()));
        }
        fn on_session_released(&self, peer: &PeerInfo) {
            self.released.lock().unwrap().push(peer.clone());
        }
    }

    impl App {
        fn received(&self) -> Vec<Vec<u8>> {
            self.messages.lock().unwrap().iter().map(|m| m.1.clone()).collect()
        }
        fn released(&self) -> usize {
            self.released.lock().unwrap().len()
        }
    }

    struct Node {
        mgr: SessionManager,
        transport: Arc<MemoryTransport>,
        app: Arc<App>,
        addr: PeerAddress,
        rendezvous: Arc<Recorder>,
    }

    fn node(last_octet: u8, config: SessionConfig) -> Node {
        let transport = MemoryTransport::new();
        let app = Arc::new(App::default());
        let storage = Arc::new(MemoryStorage::new());
        Node {
            mgr: SessionManager::new(config, transport.clone(), app.clone()).with_storage(storage),
            transport,
            app,
            addr: PeerAddress::Udp(std::net::SocketAddr::from(([10, 0, 0, last_octet], 5540))),
            rendezvous: Arc::new(Recorder::default()),
        }
    }

    fn pbkdf() -> PbkdfParams {
        PbkdfParams {
            iterations: 1000,
            salt: b"SPAKE2P Key Salt".to_vec(),
        }
    }

    fn open_window(n: &mut Node, pin: u32) {
        n.mgr
            .open_commissioning_window(
                CommissioningWindowParams {
                    setup_pin: Some(pin),
                    verifier: None,
                    pbkdf: pbkdf(),
                    discriminator: 3840,
                },
                n.rendezvous.clone(),
            )
            .unwrap();
    }

    /// Delivers queued datagrams both ways until the wire is quiet.
    fn pump(a: &mut Node, b: &mut Node, now: Instant, duplicate: bool) {
        for _ in 0..64 {
            let from_a = a.transport.take_sent();
            let from_b = b.transport.take_sent();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (to, d) in from_a {
                assert_eq!(to, b.addr);
                let _ = b.mgr.on_datagram(a.addr, &d, now);
                if duplicate {
                    let _ = b.mgr.on_datagram(a.addr, &d, now);
                }
            }
            for (to, d) in from_b {
                assert_eq!(to, a.addr);
                let _ = a.mgr.on_datagram(b.addr, &d, now);
                if duplicate {
                    let _ = a.mgr.on_datagram(b.addr, &d, now);
                }
            }
        }
        panic!("traffic did not settle");
    }

    fn app_message(body: &[u8]) -> Vec<u8> {
        ProtocolMessage {
            header: ProtocolHeader {
                exchange_flags: ProtocolHeader::FLAG_INITIATOR,
                opcode: 2,
                exchange_id: 1,
                vendor_id: None,
                protocol_id: 1,
                ack_counter: None,
            },
            payload: body.to_vec(),
        }
        .encode()
        .unwrap()
    }

    fn paired(duplicate: bool) -> (Node, Node, SlotHandle, SlotHandle, Instant) {
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let mut b = node(2, SessionConfig::default());
        open_window(&mut b, PIN);
        let ha = a
            .mgr
            .pair_pase(b.addr, PIN, a.rendezvous.clone(), now)
            .unwrap();
        pump(&mut a, &mut b, now, duplicate);
        let hb = b.mgr.table().iter().next().map(|(h, _)| h).unwrap();
        (a, b, ha, hb, now)
    }

    #[test]
    fn pase_pairing_then_encrypted_traffic() {
        let (mut a, mut b, ha, hb, _) = paired(false);
        assert_eq!(a.rendezvous.terminal(), vec![Event::Opened]);
        assert_eq!(b.rendezvous.terminal(), vec![Event::Opened]);
        assert_eq!(a.mgr.pending_handshakes(), 0);
        assert_eq!(b.mgr.pending_handshakes(), 0);

        let ia = a.mgr.peer_info(ha).unwrap();
        let ib = b.mgr.peer_info(hb).unwrap();
        assert_eq!(ia.local_session_id, ib.peer_session_id);
        assert_eq!(ia.peer_session_id, ib.local_session_id);

        a.mgr.send(ha, &app_message(b"hello")).unwrap();
        b.mgr.send(hb, &app_message(b"world")).unwrap();
        let now = Instant::now();
        pump(&mut a, &mut b, now, false);
        assert_eq!(b.app.received(), vec![b"hello".to_vec()]);
        assert_eq!(a.app.received(), vec![b"world".to_vec()]);
        assert_eq!(b.app.messages.lock().unwrap()[0].0.handle, hb);
    }

    #[test]
    fn duplicated_datagrams_still_pair() {
        let (a, b, ha, hb, _) = paired(true);
        assert_eq!(a.rendezvous.terminal(), vec![Event::Opened]);
        assert_eq!(b.rendezvous.terminal(), vec![Event::Opened]);
        assert!(a.mgr.peer_info(ha).is_some());
        assert!(b.mgr.peer_info(hb).is_some());
        assert_eq!(b.mgr.table().len(), 1);
    }

    #[test]
    fn wrong_pin_creates_no_session() {
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let mut b = node(2, SessionConfig::default());
        open_window(&mut b, PIN);
        a.mgr
            .pair_pase(b.addr, PIN + 1, a.rendezvous.clone(), now)
            .unwrap();
        pump(&mut a, &mut b, now, false);
        assert_eq!(
            a.rendezvous.terminal(),
            vec![Event::Error(HandshakeFailure::ConfirmationMismatch)]
        );
        assert_eq!(b.rendezvous.terminal().len(), 1);
        assert!(a.mgr.table().is_empty());
        assert!(b.mgr.table().is_empty());
    }

    #[test]
    fn replayed_datagram_dropped_new_one_accepted() {
        let (mut a, mut b, ha, _, now) = paired(false);
        a.mgr.send(ha, &app_message(b"1")).unwrap();
        a.mgr.send(ha, &app_message(b"2")).unwrap();
        a.mgr.send(ha, &app_message(b"3")).unwrap();
        let sent = a.transport.take_sent();
        assert_eq!(sent.len(), 3);

        b.mgr.on_datagram(a.addr, &sent[1].1, now).unwrap();
        b.mgr.on_datagram(a.addr, &sent[0].1, now).unwrap();
        assert!(matches!(
            b.mgr.on_datagram(a.addr, &sent[0].1, now),
            Err(Error::ReplayOrOutOfWindow(_))
        ));
        b.mgr.on_datagram(a.addr, &sent[2].1, now).unwrap();
        assert_eq!(
            b.app.received(),
            vec![b"2".to_vec(), b"1".to_vec(), b"3".to_vec()]
        );
        assert!(b.transport.take_sent().is_empty());
    }

    #[test]
    fn garbage_and_unknown_sessions_dropped() {
        let (_, mut b, _, _, now) = paired(false);
        let peer = PeerAddress::Ble(9);
        assert!(b.mgr.on_datagram(peer, &[0], now).is_err());
        let unknown = MessageHeader::unicast(0x7777, 1).encode().unwrap();
        assert!(matches!(
            b.mgr.on_datagram(peer, &unknown, now),
            Err(Error::UnknownSession(0x7777))
        ));
        assert!(b.transport.take_sent().is_empty());
    }

    #[test]
    fn counter_exhaustion_releases_session() {
        let (mut a, _, ha, _, _) = paired(false);
        *a.mgr.table.get_mut(ha).unwrap().counter_mut() =
            SessionMessageCounter::with_send_counter(u32::MAX - 1);
        a.mgr.send(ha, &app_message(b"last")).unwrap();
        assert!(matches!(
            a.mgr.send(ha, &app_message(b"one too many")),
            Err(Error::CounterExhausted)
        ));
        assert_eq!(a.app.released(), 1);
        assert!(a.mgr.peer_info(ha).is_none());
    }

    #[test]
    fn transport_failure_keeps_session() {
        let (mut a, _, ha, _, _) = paired(false);
        a.transport.set_failing(true);
        assert!(matches!(
            a.mgr.send(ha, &app_message(b"x")),
            Err(Error::Transport(_))
        ));
        a.transport.set_failing(false);
        assert!(a.mgr.peer_info(ha).is_some());
        a.mgr.send(ha, &app_message(b"y")).unwrap();
    }

    #[test]
    fn table_full_rejects_new_pairing() {
        let config = SessionConfig {
            table_capacity: 1,
            ..Default::default()
        };
        let now = Instant::now();
        let mut a = node(1, config);
        let b = node(2, SessionConfig::default());
        let c = node(3, SessionConfig::default());
        a.mgr.pair_pase(b.addr, PIN, a.rendezvous.clone(), now).unwrap();
        assert!(matches!(
            a.mgr.pair_pase(c.addr, PIN, a.rendezvous.clone(), now),
            Err(Error::ResourceExhausted)
        ));
        // the reserved slot is not evictable even when idle
        assert!(matches!(
            a.mgr.pair_pase(c.addr, PIN, a.rendezvous.clone(), now + Duration::from_secs(3600)),
            Err(Error::ResourceExhausted)
        ));
    }

    #[test]
    fn commissionee_answers_busy_when_full() {
        let config = SessionConfig {
            table_capacity: 1,
            ..Default::default()
        };
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let mut b = node(2, config);
        let mut c = node(3, SessionConfig::default());
        open_window(&mut b, PIN);
        a.mgr.pair_pase(b.addr, PIN, a.rendezvous.clone(), now).unwrap();
        c.mgr.pair_pase(b.addr, PIN, c.rendezvous.clone(), now).unwrap();
        // b receives a's request first, its only slot is taken by that handshake
        for (_, d) in a.transport.take_sent() {
            b.mgr.on_datagram(a.addr, &d, now).unwrap();
        }
        for (_, d) in c.transport.take_sent() {
            b.mgr.on_datagram(c.addr, &d, now).unwrap();
        }
        let replies = b.transport.take_sent();
        let busy = replies.iter().find(|(to, _)| *to == c.addr).unwrap();
        let (_, len) = MessageHeader::decode(&busy.1).unwrap();
        let msg = ProtocolMessage::decode(&busy.1[len..]).unwrap();
        assert!(msg.header.is_secure_channel(opcode::STATUS_REPORT));
        assert_eq!(StatusReport::parse(&msg.payload).unwrap(), StatusReport::busy());
        c.mgr.on_datagram(b.addr, &busy.1, now).unwrap();
        assert_eq!(
            c.rendezvous.terminal(),
            vec![Event::Error(HandshakeFailure::ResourceExhausted)]
        );
        assert!(c.mgr.table().is_empty());
        assert!(c.mgr.handshakes.is_empty());
    }

    #[test]
    fn lost_response_is_resent_on_duplicate_request() {
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let mut b = node(2, SessionConfig::default());
        open_window(&mut b, PIN);
        a.mgr.pair_pase(b.addr, PIN, a.rendezvous.clone(), now).unwrap();
        let request = a.transport.take_sent();
        assert_eq!(request.len(), 1);

        b.mgr.on_datagram(a.addr, &request[0].1, now).unwrap();
        let lost = b.transport.take_sent();
        assert_eq!(lost.len(), 1);

        // a retransmits its request since the response never arrived
        a.mgr.on_timer(now + Duration::from_secs(1));
        let again = a.transport.take_sent();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].1, request[0].1);
        b.mgr.on_datagram(a.addr, &again[0].1, now).unwrap();
        let resent = b.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0], lost[0]);
        assert_eq!(b.mgr.pending_handshakes(), 1);

        a.mgr.on_datagram(b.addr, &resent[0].1, now).unwrap();
        pump(&mut a, &mut b, now, false);
        assert_eq!(a.rendezvous.terminal(), vec![Event::Opened]);
        assert_eq!(b.rendezvous.terminal(), vec![Event::Opened]);
        assert_eq!(b.mgr.table().len(), 1);
    }

    #[test]
    fn lost_failure_report_is_retransmitted() {
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let mut b = node(2, SessionConfig::default());
        open_window(&mut b, PIN);
        a.mgr
            .pair_pase(b.addr, PIN + 1, a.rendezvous.clone(), now)
            .unwrap();
        // request, response, pake1, pake2
        for _ in 0..2 {
            for (_, d) in a.transport.take_sent() {
                b.mgr.on_datagram(a.addr, &d, now).unwrap();
            }
            for (_, d) in b.transport.take_sent() {
                a.mgr.on_datagram(b.addr, &d, now).unwrap();
            }
        }
        assert_eq!(
            a.rendezvous.terminal(),
            vec![Event::Error(HandshakeFailure::ConfirmationMismatch)]
        );
        let lost = a.transport.take_sent();
        assert_eq!(lost.len(), 1);
        assert!(a.mgr.table().is_empty());
        assert_eq!(a.mgr.pending_handshakes(), 0);
        assert_eq!(a.mgr.handshakes.len(), 1);

        a.mgr.on_timer(now + Duration::from_secs(1));
        let resent = a.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1, lost[0].1);

        b.mgr.on_datagram(a.addr, &resent[0].1, now).unwrap();
        assert_eq!(
            b.rendezvous.terminal(),
            vec![Event::Error(HandshakeFailure::PeerRejected)]
        );
        assert!(b.mgr.table().is_empty());
        for (_, d) in b.transport.take_sent() {
            a.mgr.on_datagram(b.addr, &d, now).unwrap();
        }
        assert!(a.mgr.handshakes.is_empty());
        assert!(b.mgr.handshakes.is_empty());
        assert!(a.transport.take_sent().is_empty());
    }

    #[test]
    fn handshake_retransmits_then_times_out() {
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let nowhere = PeerAddress::Ble(1);
        a.mgr.pair_pase(nowhere, PIN, a.rendezvous.clone(), now).unwrap();
        let first = a.transport.take_sent();
        assert_eq!(first.len(), 1);

        a.mgr.on_timer(now + Duration::from_secs(1));
        let resent = a.transport.take_sent();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1, first[0].1);
        assert!(a.rendezvous.events().is_empty());

        a.mgr.on_timer(now + a.mgr.config().handshake_timeout());
        assert_eq!(
            a.rendezvous.terminal(),
            vec![Event::Error(HandshakeFailure::Timeout)]
        );
        assert!(a.mgr.table().is_empty());
        assert_eq!(a.mgr.pending_handshakes(), 0);
    }

    #[test]
    fn cancel_pairing_releases_slot() {
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let h = a.mgr.pair_pase(PeerAddress::Ble(1), PIN, a.rendezvous.clone(), now).unwrap();
        a.mgr.cancel_pairing(h).unwrap();
        assert!(a.mgr.cancel_pairing(h).is_err());
        assert_eq!(
            a.rendezvous.terminal(),
            vec![Event::Error(HandshakeFailure::Cancelled)]
        );
        assert!(a.mgr.table().is_empty());
    }

    #[test]
    fn closed_window_ignores_requests() {
        let now = Instant::now();
        let mut a = node(1, SessionConfig::default());
        let mut b = node(2, SessionConfig::default());
        open_window(&mut b, PIN);
        b.mgr.close_commissioning_window();
        a.mgr.pair_pase(b.addr, PIN, a.rendezvous.clone(), now).unwrap();
        pump(&mut a, &mut b, now, false);
        assert!(b.mgr.table().is_empty());
        assert!(b.rendezvous.events().is_empty());
    }

    #[test]
    fn suspend_and_resume_keep_counters_moving() {
        let (mut a, mut b, ha, hb, now) = paired(false);
        a.mgr.send(ha, &app_message(b"before")).unwrap();
        let old = a.transport.take_sent();
        b.mgr.on_datagram(a.addr, &old[0].1, now).unwrap();

        a.mgr.suspend(ha, b"resume-id").unwrap();
        b.mgr.suspend(hb, b"resume-id").unwrap();
        assert_eq!(a.app.released(), 1);
        assert!(a.mgr.table().is_empty());

        let ha = a.mgr.resume(b"resume-id", b.addr, now).unwrap();
        let hb = b.mgr.resume(b"resume-id", a.addr, now).unwrap();
        assert!(a.mgr.resume(b"resume-id", b.addr, now).is_err());

        // the pre-suspend datagram is still a replay
        assert!(matches!(
            b.mgr.on_datagram(a.addr, &old[0].1, now),
            Err(Error::ReplayOrOutOfWindow(_))
        ));
        a.mgr.send(ha, &app_message(b"after")).unwrap();
        b.mgr.send(hb, &app_message(b"back")).unwrap();
        pump(&mut a, &mut b, now, false);
        assert_eq!(b.app.received(), vec![b"before".to_vec(), b"after".to_vec()]);
        assert_eq!(a.app.received(), vec![b"back".to_vec()]);
    }

    #[test]
    fn discarded_suspension_cannot_be_resumed() {
        let (mut a, b, ha, _, now) = paired(false);
        a.mgr.suspend(ha, b"gone").unwrap();
        a.mgr.discard_suspended(b"gone").unwrap();
        assert!(matches!(
            a.mgr.resume(b"gone", b.addr, now),
            Err(Error::Storage(_))
        ));
        assert!(a.mgr.table().is_empty());
        assert!(a.mgr.discard_suspended(b"gone").is_err());
    }

    #[test]
    fn idle_sessions_expire_on_timer() {
        let (mut a, _, ha, _, now) = paired(false);
        a.mgr.on_timer(now + Duration::from_secs(1));
        assert!(a.mgr.peer_info(ha).is_some());
        a.mgr.on_timer(now + a.mgr.config().idle_timeout() + Duration::from_secs(1));
        assert!(a.mgr.peer_info(ha).is_none());
        assert_eq!(a.app.released(), 1);
    }

    #[test]
    fn shutdown_releases_everything() {
        let (mut a, _, _, _, now) = paired(false);
        a.mgr
            .pair_pase(PeerAddress::Ble(5), PIN, a.rendezvous.clone(), now)
            .unwrap();
        a.mgr.shutdown();
        assert!(a.mgr.table().is_empty());
        assert_eq!(a.app.released(), 1);
        assert_eq!(
            a.rendezvous.terminal(),
            vec![Event::Opened, Event::Error(HandshakeFailure::Cancelled)]
        );
    }
}
