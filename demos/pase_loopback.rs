/// Runs a commissionee and a commissioner stack on loopback, pairs them over PASE and
/// sends one message through the secure session.
///
/// cargo run --example pase_loopback -- --code 34970112332 --verbose
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use clap::Parser;
use matsess::{
    config::{self, SessionConfig},
    error::HandshakeFailure,
    messages::{ProtocolHeader, ProtocolMessage},
    onboarding,
    pase::{PbkdfParams, RendezvousDelegate},
    peer_state::PeerInfo,
    session_manager::{CommissioningWindowParams, SessionDelegate},
    stack,
    storage::{JsonFileStorage, PersistentStorageDelegate},
    transport::PeerAddress,
};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command()]
struct Cli {
    #[clap(long)]
    #[arg(default_value_t = false)]
    verbose: bool,

    /// Manual pairing code of the simulated device
    #[clap(long)]
    #[arg(default_value_t = String::from("34970112332"))]
    code: String,

    /// Session configuration (json). Defaults are used when missing.
    #[clap(long)]
    config: Option<String>,

    /// Keep suspended sessions in this json file
    #[clap(long)]
    storage: Option<String>,
}

struct Printer(&'static str, mpsc::UnboundedSender<Vec<u8>>);

impl SessionDelegate for Printer {
    fn on_message_received(&self, peer: &PeerInfo, header: &ProtocolHeader, payload: &[u8]) {
        println!(
            "{}: session {} opcode {} payload {}",
            self.0,
            peer.local_session_id,
            header.opcode,
            hex::encode(payload)
        );
        let _ = self.1.send(payload.to_vec());
    }

    fn on_session_released(&self, peer: &PeerInfo) {
        println!("{}: session {} released", self.0, peer.local_session_id);
    }
}

struct Pairing(&'static str, mpsc::UnboundedSender<bool>);

impl RendezvousDelegate for Pairing {
    fn on_rendezvous_error(&self, error: HandshakeFailure) {
        println!("{}: pairing failed: {}", self.0, error);
        let _ = self.1.send(false);
    }

    fn on_rendezvous_connection_opened(&self) {
        println!("{}: pase session established", self.0);
        let _ = self.1.send(true);
    }

    fn on_rendezvous_connection_closed(&self) {
        println!("{}: rendezvous closed", self.0);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let info = onboarding::decode_manual_pairing_code(&cli.code)?;
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => SessionConfig::default(),
    };
    cfg.listen_address = "127.0.0.1:0".to_owned();

    let storage: Option<Arc<dyn PersistentStorageDelegate>> = match &cli.storage {
        Some(path) => Some(Arc::new(JsonFileStorage::load(path)?)),
        None => None,
    };

    let (dev_tx, mut dev_rx) = mpsc::unbounded_channel();
    let (device, _) = stack::start(cfg.clone(), Arc::new(Printer("device", dev_tx)), None).await?;
    let (ctl_tx, _ctl_rx) = mpsc::unbounded_channel();
    let (controller, _) =
        stack::start(cfg.clone(), Arc::new(Printer("controller", ctl_tx)), storage).await?;

    let (pair_tx, mut pair_rx) = mpsc::unbounded_channel();
    let device_pairing = Arc::new(Pairing("device", pair_tx.clone()));
    let iterations = cfg.pbkdf_iterations;
    device
        .call(move |m| {
            m.open_commissioning_window(
                CommissioningWindowParams {
                    setup_pin: Some(info.passcode),
                    verifier: None,
                    pbkdf: PbkdfParams::random(iterations),
                    discriminator: info.discriminator,
                },
                device_pairing,
            )
        })
        .await??;

    let device_addr = PeerAddress::Udp(device.local_addr());
    let controller_pairing = Arc::new(Pairing("controller", pair_tx));
    let handle = controller
        .call(move |m| m.pair_pase(device_addr, info.passcode, controller_pairing, Instant::now()))
        .await??;
    for _ in 0..2 {
        let ok = tokio::time::timeout(Duration::from_secs(10), pair_rx.recv())
            .await
            .context("pairing timed out")?;
        if ok != Some(true) {
            anyhow::bail!("pairing failed");
        }
    }

    let msg = ProtocolMessage {
        header: ProtocolHeader {
            exchange_flags: ProtocolHeader::FLAG_INITIATOR,
            opcode: 2,
            exchange_id: 1,
            vendor_id: None,
            protocol_id: 1,
            ack_counter: None,
        },
        payload: b"hello".to_vec(),
    }
    .encode()?;
    controller.call(move |m| m.send(handle, &msg)).await??;
    tokio::time::timeout(Duration::from_secs(5), dev_rx.recv())
        .await
        .context("message not delivered")?;

    if cli.storage.is_some() {
        controller
            .call(move |m| m.suspend(handle, b"loopback"))
            .await??;
        println!("controller: session suspended");
    }

    controller.shutdown();
    device.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = {
        if cli.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Error
        }
    };
    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();

    if let Err(e) = run(cli).await {
        println!("error: {:?}", e);
    }
}
