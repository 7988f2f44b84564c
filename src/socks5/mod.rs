//! SOCKS5 listener: one per advertised transport method.

use std::net::SocketAddr;

use safelog::sensitive;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::session::{self, SessionSet};
use crate::transport::Transport;
use crate::Result;

pub mod proto;

/// Loopback-only bind; the port is chosen by the OS and reported to the
/// parent process via the PT protocol.
const LISTEN_ADDR: &str = "127.0.0.1:0";

pub struct Socks5Server {
    transport: Transport,
    listener: TcpListener,
    sessions: SessionSet,
}

impl Socks5Server {
    /// Binds a listener for `transport` on an ephemeral loopback port.
    pub async fn bind(transport: Transport) -> Result<Self> {
        let listener = TcpListener::bind(LISTEN_ADDR).await?;
        Ok(Self {
            transport,
            listener,
            sessions: SessionSet::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle to this listener's live sessions; aborting them is how the
    /// dispatcher implements its second-interrupt teardown.
    pub fn sessions(&self) -> SessionSet {
        self.sessions.clone()
    }

    /// Accepts sessions until `cancel` fires.  Existing sessions keep
    /// running after the listener closes; only [`SessionSet::abort_all`]
    /// ends them early.
    pub async fn run(self, cancel: CancellationToken) {
        let transport = self.transport;
        info!("{transport}: accepting connections");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("{transport}: closing listener");
                    break;
                }
                res = self.listener.accept() => {
                    let (conn, peer) = match res {
                        Ok(c) => c,
                        Err(e) => {
                            error!("{transport}: closing listener, accept failed: {e}");
                            break;
                        }
                    };

                    let id = self.sessions.next_id();
                    let sessions = self.sessions.clone();
                    let handle = tokio::spawn(async move {
                        if let Err(e) = session::run(transport, conn, peer).await {
                            warn!(
                                peer = %sensitive(peer),
                                "{transport}: session failed: {e}"
                            );
                        }
                        sessions.remove(id);
                    });
                    self.sessions.insert(id, handle.abort_handle());
                    debug!("{transport}: session {id} registered");
                }
            }
        }
    }
}
