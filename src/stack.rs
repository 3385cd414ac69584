//! Tokio task owning a [SessionManager].
//!
//! The task multiplexes the UDP socket, a periodic timer and a work queue. Everything
//! that touches sessions runs on it; other tasks and threads hand closures to it through
//! [StackHandle].

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use tokio::{
    net::UdpSocket,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::SessionConfig,
    session_manager::{SessionDelegate, SessionManager},
    storage::PersistentStorageDelegate,
    transport::{PeerAddress, UdpTransport},
};

const TICK: Duration = Duration::from_millis(50);
const MAX_DATAGRAM: usize = 1280;

type Work = Box<dyn FnOnce(&mut SessionManager) + Send>;

enum Event {
    Datagram(usize, SocketAddr),
    Work(Work),
    Tick,
}

/// Cloneable entry point into a running stack.
#[derive(Clone)]
pub struct StackHandle {
    work_tx: UnboundedSender<Work>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl StackHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues `f` to run on the stack task.
    pub fn post(&self, f: impl FnOnce(&mut SessionManager) + Send + 'static) -> Result<()> {
        self.work_tx
            .send(Box::new(f))
            .map_err(|_| anyhow::anyhow!("session stack is not running"))
    }

    /// Runs `f` on the stack task and waits for its result.
    pub async fn call<R: Send + 'static>(
        &self,
        f: impl FnOnce(&mut SessionManager) -> R + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.post(move |manager| {
            let _ = tx.send(f(manager));
        })?;
        rx.await.context("session stack stopped before answering")
    }

    /// Stops the task. Handshakes are cancelled and sessions released first.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Binds the socket from `config` and spawns the stack task.
pub async fn start(
    config: SessionConfig,
    delegate: Arc<dyn SessionDelegate>,
    storage: Option<Arc<dyn PersistentStorageDelegate>>,
) -> Result<(StackHandle, JoinHandle<()>)> {
    config.validate()?;
    let transport = Arc::new(UdpTransport::bind(&config.listen_address).await?);
    let local_addr = transport.local_addr()?;
    let socket = transport.socket();
    let mut manager = SessionManager::new(config, transport, delegate);
    if let Some(storage) = storage {
        manager = manager.with_storage(storage);
    }

    let (work_tx, work_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = {
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            run(manager, socket, work_rx, cancel).await;
        })
    };
    log::debug!("session stack listening on {}", local_addr);
    Ok((
        StackHandle {
            work_tx,
            cancel,
            local_addr,
        },
        task,
    ))
}

async fn run(
    mut manager: SessionManager,
    socket: Arc<UdpSocket>,
    mut work_rx: UnboundedReceiver<Work>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut interval = tokio::time::interval(TICK);
    loop {
        let event = tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, addr)) => Event::Datagram(n, addr),
                    Err(e) => {
                        log::debug!("recv error: {}", e);
                        continue;
                    }
                }
            }
            work = work_rx.recv() => match work {
                Some(work) => Event::Work(work),
                None => break,
            },
            _ = interval.tick() => Event::Tick,
            _ = cancel.cancelled() => break,
        };
        match event {
            Event::Datagram(n, addr) => {
                let peer = PeerAddress::Udp(addr);
                match manager.on_datagram(peer, &buf[..n], Instant::now()) {
                    Ok(()) => {}
                    Err(e) if e.is_silent_drop() => {
                        log::trace!("dropped datagram from {}: {}", addr, e)
                    }
                    Err(e) => log::debug!("datagram from {} failed: {}", addr, e),
                }
            }
            Event::Work(work) => work(&mut manager),
            Event::Tick => manager.on_timer(Instant::now()),
        }
    }
    manager.shutdown();
    log::debug!("session stack stopped");
}
