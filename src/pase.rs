//! PASE handshake state machine.
//!
//! The machine is sans-IO: the caller feeds it decoded secure channel messages and
//! timer ticks and sends whatever it returns over the unsecured session. Progress and
//! outcome are reported through a [RendezvousDelegate].
//!
//! Message sequence:
//! ```text
//! commissioner                       commissionee
//!   PBKDFParamRequest   ------------>
//!                       <------------ PBKDFParamResponse
//!   Pake1 (pA)          ------------>
//!                       <------------ Pake2 (pB, cB)
//!   Pake3 (cA)          ------------>
//!                       <------------ StatusReport
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use zeroize::Zeroizing;

use crate::{
    error::{Error, HandshakeFailure, Result},
    messages::{self, opcode, ProtocolHeader, ProtocolMessage, ReliabilityParams, StatusReport},
    onboarding,
    secure_session::{SessionKeys, SessionRole},
    spake2p::{self, PaseVerifier},
    transport::{PeerAddress, RendezvousConnection},
};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Observer of one handshake. Each terminal callback fires at most once.
pub trait RendezvousDelegate: Send + Sync {
    fn on_rendezvous_error(&self, error: HandshakeFailure);
    fn on_rendezvous_connection_opened(&self);
    fn on_rendezvous_connection_closed(&self);
    fn on_rendezvous_message_received(&self, _payload: &[u8]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaseState {
    Idle,
    AwaitingPeerResponse,
    VerifyingCredentials,
    Established,
    Failed,
}

impl PaseState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaseState::Established | PaseState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaseRole {
    /// Knows the passcode and initiates the exchange.
    Commissioner,
    /// The device being commissioned. Holds the passcode or its verifier.
    Commissionee,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PbkdfParams {
    pub iterations: u32,
    pub salt: Vec<u8>,
}

impl PbkdfParams {
    pub fn random(iterations: u32) -> Self {
        Self {
            iterations,
            salt: rand::random::<[u8; spake2p::MAX_SALT_LEN]>().to_vec(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(spake2p::MIN_ITERATIONS..=spake2p::MAX_ITERATIONS).contains(&self.iterations) {
            return Err(Error::invalid(format!(
                "pbkdf iterations {} out of range",
                self.iterations
            )));
        }
        if !(spake2p::MIN_SALT_LEN..=spake2p::MAX_SALT_LEN).contains(&self.salt.len()) {
            return Err(Error::invalid(format!(
                "pbkdf salt length {} out of range",
                self.salt.len()
            )));
        }
        Ok(())
    }
}

pub struct PaseParams {
    pub role: PaseRole,
    pub setup_pin: Option<u32>,
    pub verifier: Option<PaseVerifier>,
    pub pbkdf: Option<PbkdfParams>,
    pub discriminator: u16,
    pub peer_address: Option<PeerAddress>,
    /// Released exactly once, when the handshake fails or is shut down.
    pub connection: Option<Box<dyn RendezvousConnection>>,
    pub local_session_id: u16,
    pub reliability: ReliabilityParams,
    pub timeout: Duration,
}

impl PaseParams {
    pub fn commissioner(setup_pin: u32, peer_address: PeerAddress, local_session_id: u16) -> Self {
        Self {
            role: PaseRole::Commissioner,
            setup_pin: Some(setup_pin),
            verifier: None,
            pbkdf: None,
            discriminator: 0,
            peer_address: Some(peer_address),
            connection: None,
            local_session_id,
            reliability: ReliabilityParams::default(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn commissionee(pbkdf: PbkdfParams, discriminator: u16, local_session_id: u16) -> Self {
        Self {
            role: PaseRole::Commissionee,
            setup_pin: None,
            verifier: None,
            pbkdf: Some(pbkdf),
            discriminator,
            peer_address: None,
            connection: None,
            local_session_id,
            reliability: ReliabilityParams::default(),
            timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_pin(mut self, pin: u32) -> Self {
        self.setup_pin = Some(pin);
        self
    }

    pub fn with_verifier(mut self, verifier: PaseVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }
}

/// What a successful handshake hands to the session table.
pub struct PairingResult {
    pub local_session_id: u16,
    pub peer_session_id: u16,
    pub role: SessionRole,
    pub keys: SessionKeys,
    pub peer_reliability: ReliabilityParams,
}

enum Credential {
    Pin(Zeroizing<u32>),
    Verifier(PaseVerifier),
}

pub struct PaseSession {
    role: PaseRole,
    state: PaseState,
    expected: Option<u8>,
    credential: Credential,
    pbkdf: Option<PbkdfParams>,
    discriminator: u16,
    peer_address: Option<PeerAddress>,
    connection: Option<Box<dyn RendezvousConnection>>,
    local_session_id: u16,
    peer_session_id: u16,
    reliability: ReliabilityParams,
    peer_reliability: ReliabilityParams,
    timeout: Duration,
    last_progress: Option<Instant>,
    exchange_id: u16,
    local_random: [u8; messages::RANDOM_LEN],
    pbkdf_request: Vec<u8>,
    pbkdf_response: Vec<u8>,
    engine: spake2p::Engine,
    prover: Option<spake2p::ProverContext>,
    verifier_output: Option<spake2p::VerifierOutput>,
    pending_keys: Option<SessionKeys>,
    result: Option<PairingResult>,
    delegate: Arc<dyn RendezvousDelegate>,
}

fn check_pin(pin: u32) -> Result<u32> {
    if onboarding::is_valid_setup_pin(pin) {
        Ok(pin)
    } else {
        Err(Error::invalid("invalid setup pin"))
    }
}

impl PaseSession {
    pub fn init(params: PaseParams, delegate: Arc<dyn RendezvousDelegate>) -> Result<Self> {
        if params.discriminator > onboarding::MAX_DISCRIMINATOR {
            return Err(Error::invalid(format!(
                "discriminator {:#x} out of range",
                params.discriminator
            )));
        }
        if params.local_session_id == 0 {
            return Err(Error::invalid("local session id must be non-zero"));
        }
        let credential = match params.role {
            PaseRole::Commissioner => {
                if params.peer_address.is_none() {
                    return Err(Error::invalid("commissioner needs a peer address"));
                }
                let pin = params
                    .setup_pin
                    .ok_or_else(|| Error::invalid("commissioner needs a setup pin"))?;
                Credential::Pin(Zeroizing::new(check_pin(pin)?))
            }
            PaseRole::Commissionee => {
                let pbkdf = params
                    .pbkdf
                    .as_ref()
                    .ok_or_else(|| Error::invalid("commissionee needs pbkdf parameters"))?;
                pbkdf.validate()?;
                match (params.verifier, params.setup_pin) {
                    (Some(verifier), _) => Credential::Verifier(verifier),
                    (None, Some(pin)) => Credential::Verifier(PaseVerifier::generate(
                        check_pin(pin)?,
                        &pbkdf.salt,
                        pbkdf.iterations,
                    )),
                    (None, None) => {
                        return Err(Error::invalid("neither setup pin nor pase verifier supplied"))
                    }
                }
            }
        };
        Ok(Self {
            role: params.role,
            state: PaseState::Idle,
            expected: None,
            credential,
            pbkdf: params.pbkdf,
            discriminator: params.discriminator,
            peer_address: params.peer_address,
            connection: params.connection,
            local_session_id: params.local_session_id,
            peer_session_id: 0,
            reliability: params.reliability,
            peer_reliability: ReliabilityParams::default(),
            timeout: params.timeout,
            last_progress: None,
            exchange_id: 0,
            local_random: rand::random(),
            pbkdf_request: Vec::new(),
            pbkdf_response: Vec::new(),
            engine: spake2p::Engine::new()?,
            prover: None,
            verifier_output: None,
            pending_keys: None,
            result: None,
            delegate,
        })
    }

    pub fn state(&self) -> PaseState {
        self.state
    }

    pub fn role(&self) -> PaseRole {
        self.role
    }

    pub fn local_session_id(&self) -> u16 {
        self.local_session_id
    }

    pub fn peer_address(&self) -> Option<&PeerAddress> {
        self.peer_address.as_ref()
    }

    pub fn discriminator(&self) -> u16 {
        self.discriminator
    }

    pub fn exchange_id(&self) -> u16 {
        self.exchange_id
    }

    /// Negotiated retransmission intervals of the peer, defaults until it told us.
    pub fn peer_reliability(&self) -> ReliabilityParams {
        self.peer_reliability
    }

    /// Arms the handshake. The commissioner gets its PBKDFParamRequest back, the
    /// commissionee starts waiting for one.
    pub fn start(&mut self, now: Instant) -> Result<Option<ProtocolMessage>> {
        if self.state != PaseState::Idle {
            return Err(Error::invalid("handshake already started"));
        }
        self.last_progress = Some(now);
        self.state = PaseState::AwaitingPeerResponse;
        match self.role {
            PaseRole::Commissioner => {
                self.exchange_id = rand::random();
                let request = messages::PbkdfParamRequest {
                    initiator_random: self.local_random,
                    initiator_session_id: self.local_session_id,
                    passcode_id: 0,
                    has_pbkdf_parameters: false,
                    session_params: Some(self.reliability),
                };
                self.pbkdf_request = request.encode().map_err(Error::malformed)?;
                self.expected = Some(opcode::PBKDF_PARAM_RESPONSE);
                Ok(Some(self.message(
                    opcode::PBKDF_PARAM_REQUEST,
                    self.pbkdf_request.clone(),
                )))
            }
            PaseRole::Commissionee => {
                self.expected = Some(opcode::PBKDF_PARAM_REQUEST);
                Ok(None)
            }
        }
    }

    fn message(&self, opcode: u8, payload: Vec<u8>) -> ProtocolMessage {
        ProtocolMessage {
            header: ProtocolHeader::secure_channel(
                opcode,
                self.exchange_id,
                self.role == PaseRole::Commissioner,
            ),
            payload,
        }
    }

    /// Feeds one secure channel message of this exchange. Returns the reply to send, if any.
    pub fn handle_message(
        &mut self,
        msg: &ProtocolMessage,
        now: Instant,
    ) -> Option<ProtocolMessage> {
        if self.state.is_terminal() || self.state == PaseState::Idle {
            log::debug!(
                "pase in state {:?}, dropping opcode {:#x}",
                self.state,
                msg.header.opcode
            );
            return None;
        }
        if msg.header.vendor_id.is_some()
            || msg.header.protocol_id != messages::PROTOCOL_ID_SECURE_CHANNEL
        {
            log::debug!("pase ignoring non secure channel message");
            return None;
        }
        let first = self.expected == Some(opcode::PBKDF_PARAM_REQUEST);
        if !first && msg.header.exchange_id != self.exchange_id {
            log::debug!(
                "pase dropping message of exchange {} (ours {})",
                msg.header.exchange_id,
                self.exchange_id
            );
            return None;
        }

        if msg.header.opcode == opcode::STATUS_REPORT
            && self.expected != Some(opcode::STATUS_REPORT)
        {
            match StatusReport::parse(&msg.payload) {
                Ok(report) if report.is_busy() => {
                    log::debug!("pase peer has no room: {}", report);
                    self.fail(HandshakeFailure::ResourceExhausted);
                }
                Ok(report) if !report.is_ok() => {
                    log::debug!("pase peer aborted: {}", report);
                    self.fail(HandshakeFailure::PeerRejected);
                }
                _ => log::debug!("pase dropping unexpected status report"),
            }
            return None;
        }
        if self.expected != Some(msg.header.opcode) {
            log::debug!(
                "pase out of sequence opcode {:#x}, expecting {:?}",
                msg.header.opcode,
                self.expected
            );
            return None;
        }

        self.delegate.on_rendezvous_message_received(&msg.payload);
        self.last_progress = Some(now);
        let step = match msg.header.opcode {
            opcode::PBKDF_PARAM_REQUEST => self.on_pbkdf_request(msg),
            opcode::PBKDF_PARAM_RESPONSE => self.on_pbkdf_response(&msg.payload),
            opcode::PASE_PAKE1 => self.on_pake1(&msg.payload),
            opcode::PASE_PAKE2 => self.on_pake2(&msg.payload),
            opcode::PASE_PAKE3 => self.on_pake3(&msg.payload),
            opcode::STATUS_REPORT => self.on_status_report(&msg.payload),
            other => Err(Error::malformed(format!("unexpected opcode {:#x}", other))),
        };
        match step {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("pase failed: {}", e);
                let failure = match e {
                    Error::HandshakeFailed(f) => f,
                    Error::CryptoFailure(_) => HandshakeFailure::CryptoFailure,
                    _ => HandshakeFailure::MalformedMessage,
                };
                if failure == HandshakeFailure::CryptoFailure {
                    log::warn!("crypto failure during pase");
                }
                let notify_peer = failure != HandshakeFailure::PeerRejected;
                self.fail(failure);
                if notify_peer {
                    self.generic_failure()
                } else {
                    None
                }
            }
        }
    }

    fn generic_failure(&self) -> Option<ProtocolMessage> {
        match StatusReport::generic_failure().encode() {
            Ok(payload) => Some(self.message(opcode::STATUS_REPORT, payload)),
            Err(e) => {
                log::warn!("can't encode status report: {}", e);
                None
            }
        }
    }

    fn context_seed(&self) -> Vec<u8> {
        spake2p::context_seed(&self.pbkdf_request, &self.pbkdf_response)
    }

    fn on_pbkdf_request(&mut self, msg: &ProtocolMessage) -> Result<Option<ProtocolMessage>> {
        let request = messages::PbkdfParamRequest::parse(&msg.payload).map_err(Error::malformed)?;
        if request.passcode_id != 0 {
            return Err(Error::malformed(format!("unknown passcode id {}", request.passcode_id)));
        }
        if request.initiator_session_id == 0 {
            return Err(Error::malformed("initiator session id is zero"));
        }
        let pbkdf = self
            .pbkdf
            .clone()
            .ok_or_else(|| Error::invalid("pbkdf parameters missing"))?;
        self.exchange_id = msg.header.exchange_id;
        self.peer_session_id = request.initiator_session_id;
        self.peer_reliability = request.session_params.unwrap_or_default();
        self.pbkdf_request = msg.payload.clone();

        let response = messages::PbkdfParamResponse {
            initiator_random: request.initiator_random,
            responder_random: self.local_random,
            responder_session_id: self.local_session_id,
            iterations: pbkdf.iterations,
            salt: pbkdf.salt,
            session_params: Some(self.reliability),
        };
        self.pbkdf_response = response.encode().map_err(Error::malformed)?;
        self.expected = Some(opcode::PASE_PAKE1);
        Ok(Some(self.message(
            opcode::PBKDF_PARAM_RESPONSE,
            self.pbkdf_response.clone(),
        )))
    }

    fn on_pbkdf_response(&mut self, payload: &[u8]) -> Result<Option<ProtocolMessage>> {
        let response = messages::PbkdfParamResponse::parse(payload).map_err(Error::malformed)?;
        if response.initiator_random != self.local_random {
            return Err(Error::malformed("initiator random not echoed"));
        }
        if response.responder_session_id == 0 {
            return Err(Error::malformed("responder session id is zero"));
        }
        let pbkdf = PbkdfParams {
            iterations: response.iterations,
            salt: response.salt,
        };
        pbkdf.validate().map_err(Error::malformed)?;
        let pin = match &self.credential {
            Credential::Pin(pin) => **pin,
            Credential::Verifier(_) => return Err(Error::invalid("commissioner needs the pin")),
        };
        self.peer_session_id = response.responder_session_id;
        self.peer_reliability = response.session_params.unwrap_or_default();
        self.pbkdf_response = payload.to_vec();

        let prover = self.engine.start_prover(pin, &pbkdf.salt, pbkdf.iterations);
        let pake1 = messages::encode_single_octet_string(prover.x.as_bytes())
            .map_err(Error::malformed)?;
        self.prover = Some(prover);
        self.pbkdf = Some(pbkdf);
        self.expected = Some(opcode::PASE_PAKE2);
        Ok(Some(self.message(opcode::PASE_PAKE1, pake1)))
    }

    fn on_pake1(&mut self, payload: &[u8]) -> Result<Option<ProtocolMessage>> {
        let x = messages::parse_single_octet_string(payload).map_err(Error::malformed)?;
        let verifier = match &self.credential {
            Credential::Verifier(v) => v,
            Credential::Pin(_) => return Err(Error::invalid("commissionee needs a verifier")),
        };
        let ctx = self.engine.start_verifier(verifier)?;
        let output = self.engine.finish_verifier(&ctx, &self.context_seed(), &x)?;
        let pake2 = messages::Pake2 {
            pb: ctx.y.as_bytes().to_vec(),
            cb: output.cb.clone(),
        }
        .encode()
        .map_err(Error::malformed)?;
        self.verifier_output = Some(output);
        self.state = PaseState::VerifyingCredentials;
        self.expected = Some(opcode::PASE_PAKE3);
        Ok(Some(self.message(opcode::PASE_PAKE2, pake2)))
    }

    fn on_pake2(&mut self, payload: &[u8]) -> Result<Option<ProtocolMessage>> {
        let pake2 = messages::Pake2::parse(payload).map_err(Error::malformed)?;
        let prover = self
            .prover
            .take()
            .ok_or_else(|| Error::malformed("pake2 before pake1"))?;
        self.state = PaseState::VerifyingCredentials;
        let output = self
            .engine
            .finish_prover(&prover, &self.context_seed(), &pake2.pb, &pake2.cb)?;
        let pake3 = messages::encode_single_octet_string(&output.ca).map_err(Error::malformed)?;
        self.pending_keys = Some(output.keys);
        self.expected = Some(opcode::STATUS_REPORT);
        Ok(Some(self.message(opcode::PASE_PAKE3, pake3)))
    }

    fn on_pake3(&mut self, payload: &[u8]) -> Result<Option<ProtocolMessage>> {
        let ca = messages::parse_single_octet_string(payload).map_err(Error::malformed)?;
        let output = self
            .verifier_output
            .take()
            .ok_or_else(|| Error::malformed("pake3 before pake1"))?;
        let keys = output.confirm(&ca)?;
        let report = StatusReport::session_established()
            .encode()
            .map_err(Error::malformed)?;
        self.establish(keys, SessionRole::Responder);
        Ok(Some(self.message(opcode::STATUS_REPORT, report)))
    }

    fn on_status_report(&mut self, payload: &[u8]) -> Result<Option<ProtocolMessage>> {
        let report = StatusReport::parse(payload).map_err(Error::malformed)?;
        if !report.is_ok() {
            log::debug!("pase peer rejected confirmation: {}", report);
            return Err(Error::HandshakeFailed(HandshakeFailure::PeerRejected));
        }
        let keys = self
            .pending_keys
            .take()
            .ok_or_else(|| Error::malformed("status report before pake3"))?;
        self.establish(keys, SessionRole::Initiator);
        Ok(None)
    }

    fn establish(&mut self, keys: SessionKeys, role: SessionRole) {
        self.result = Some(PairingResult {
            local_session_id: self.local_session_id,
            peer_session_id: self.peer_session_id,
            role,
            keys,
            peer_reliability: self.peer_reliability,
        });
        self.state = PaseState::Established;
        self.expected = None;
        log::debug!(
            "pase established local session {} peer session {}",
            self.local_session_id,
            self.peer_session_id
        );
        self.delegate.on_rendezvous_connection_opened();
    }

    /// Hands out the pairing result once, after the handshake reached `Established`.
    pub fn take_established(&mut self) -> Option<PairingResult> {
        if self.state == PaseState::Established {
            self.result.take()
        } else {
            None
        }
    }

    fn wipe(&mut self) {
        self.prover = None;
        self.verifier_output = None;
        self.pending_keys = None;
        self.result = None;
        self.expected = None;
    }

    fn release_connection(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }

    fn fail(&mut self, failure: HandshakeFailure) {
        if self.state.is_terminal() {
            return;
        }
        self.state = PaseState::Failed;
        self.wipe();
        self.release_connection();
        self.delegate.on_rendezvous_error(failure);
    }

    /// Fails the handshake when it made no progress within the timeout.
    pub fn on_timer(&mut self, now: Instant) {
        if !matches!(
            self.state,
            PaseState::AwaitingPeerResponse | PaseState::VerifyingCredentials
        ) {
            return;
        }
        if let Some(last) = self.last_progress {
            if now.saturating_duration_since(last) >= self.timeout {
                log::debug!("pase timed out in state {:?}", self.state);
                self.fail(HandshakeFailure::Timeout);
            }
        }
    }

    /// Cancels the handshake from any state. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        match self.state {
            PaseState::Failed => {}
            PaseState::Established => {
                self.state = PaseState::Failed;
                self.wipe();
                self.release_connection();
                self.delegate.on_rendezvous_connection_closed();
            }
            _ => self.fail(HandshakeFailure::Cancelled),
        }
    }
}

impl Drop for PaseSession {
    fn drop(&mut self) {
        self.release_connection();
    }
}
