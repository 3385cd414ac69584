//! Matter secure unicast session core
//!
//! This library establishes PASE sessions between a commissioner and a commissionee and protects
//! the messages exchanged over them. It is sans-IO at its core; a small Tokio based stack
//! drives it over UDP.
//! Following are main parts of api:
//! - [SessionManager](session_manager::SessionManager) - owns the peer connection table, runs PASE handshakes
//!                             over the unsecured session, encrypts and decrypts application payloads.
//! - [PaseSession](pase::PaseSession) - PASE state machine (PBKDFParamRequest .. Pake3 + status report).
//!                             Reports progress through [RendezvousDelegate](pase::RendezvousDelegate).
//! - [PeerConnectionTable](peer_table::PeerConnectionTable) - fixed capacity table of
//!                             [PeerConnectionState](peer_state::PeerConnectionState) entries with idle eviction.
//! - [SecureSession](secure_session::SecureSession) / [SessionMessageCounter](counter::SessionMessageCounter) -
//!                             AES-CCM protection and replay window of one session.
//! - [stack](stack) - tokio task owning a manager, reachable through a [StackHandle](stack::StackHandle).
//! - [onboarding](onboarding) - manual pairing code decoding.
//!
//! Example how to pair with a device waiting for commissioning:
//! ```no_run
//! # use matsess::{config::SessionConfig, stack, session_manager::SessionDelegate, peer_state::PeerInfo};
//! # use matsess::{error::HandshakeFailure, messages::ProtocolHeader, pase::RendezvousDelegate, transport::PeerAddress};
//! # use anyhow::Result;
//! # use std::sync::Arc;
//! # struct App;
//! # impl SessionDelegate for App {
//! #     fn on_message_received(&self, _: &PeerInfo, _: &ProtocolHeader, _: &[u8]) {}
//! #     fn on_session_released(&self, _: &PeerInfo) {}
//! # }
//! # struct Pairing;
//! # impl RendezvousDelegate for Pairing {
//! #     fn on_rendezvous_error(&self, _: HandshakeFailure) {}
//! #     fn on_rendezvous_connection_opened(&self) {}
//! #     fn on_rendezvous_connection_closed(&self) {}
//! # }
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let (stack, _task) = stack::start(SessionConfig::default(), Arc::new(App), None).await?;
//! let info = matsess::onboarding::decode_manual_pairing_code("2585-103-3238")?;
//! let device = PeerAddress::Udp("192.168.5.70:5540".parse()?);
//! let handle = stack
//!     .call(move |m| m.pair_pase(device, info.passcode, Arc::new(Pairing), std::time::Instant::now()))
//!     .await??;
//! // once on_rendezvous_connection_opened fired the handle refers to the secure session
//! stack.call(move |m| m.send(handle, b"...")).await??;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod counter;
pub mod error;
pub mod messages;
pub mod onboarding;
pub mod pase;
pub mod peer_state;
pub mod peer_table;
pub mod pool;
pub mod resumption;
mod retransmit;
pub mod secure_session;
pub mod session_manager;
pub mod spake2p;
pub mod stack;
pub mod storage;
pub mod tlv;
pub mod transport;
mod util;
