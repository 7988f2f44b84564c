//! Per-connection session driver and the listener's session bookkeeping.
//!
//! A session is one accepted SOCKS5 connection: negotiate, parse per-method
//! parameters, dial the bridge, run the transport handshake under a
//! deadline, emit the deferred CONNECT reply, then pump bytes both ways
//! until either side closes.  Sessions register in a [`SessionSet`] keyed
//! by an opaque id; they never hold a reference back into the listener.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use safelog::sensitive;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::socks5::proto::{self, Reply, TargetAddr};
use crate::transport::Transport;
use crate::{Error, Result};

/// Deadline covering the outbound connect plus the transport handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Opaque session identifier.
pub type SessionId = u64;

/// Live sessions of one listener.  Insert/remove are bookkeeping only; the
/// lock is never held across an await.
#[derive(Clone, Default)]
pub struct SessionSet {
    inner: Arc<Mutex<SessionSetInner>>,
}

#[derive(Default)]
struct SessionSetInner {
    next_id: SessionId,
    live: HashMap<SessionId, AbortHandle>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        inner.next_id
    }

    pub fn insert(&self, id: SessionId, handle: AbortHandle) {
        self.inner.lock().unwrap().live.insert(id, handle);
    }

    pub fn remove(&self, id: SessionId) {
        self.inner.lock().unwrap().live.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tears down every remaining session.
    pub fn abort_all(&self) {
        let handles: Vec<AbortHandle> = {
            let inner = self.inner.lock().unwrap();
            inner.live.values().cloned().collect()
        };
        for h in handles {
            h.abort();
        }
    }
}

enum EstablishError {
    Connect(std::io::Error),
    Transport(Error),
}

fn connect_error_reply(e: &std::io::Error) -> Reply {
    match e.kind() {
        ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
        ErrorKind::TimedOut => Reply::HostUnreachable,
        _ => Reply::GeneralFailure,
    }
}

async fn connect(target: &TargetAddr) -> std::io::Result<TcpStream> {
    match target {
        TargetAddr::Ip(sa) => TcpStream::connect(sa).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
}

/// Drives one accepted connection to completion.  Returns once the relay
/// ends or any stage fails; the caller owns logging and deregistration.
pub async fn run(transport: Transport, mut inbound: TcpStream, peer: SocketAddr) -> Result<()> {
    debug!(
        peer = %sensitive(peer),
        "{transport}: accepted socks connection"
    );

    let request = proto::negotiate(&mut inbound, transport.wants_credentials()).await?;

    // Parameter problems surface on the CONNECT reply, per the SOCKS5
    // layering: the auth sub-negotiation already acknowledged.
    let params = match transport.parse_params(request.credentials.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            let _ = proto::send_reply(&mut inbound, Reply::GeneralFailure, None).await;
            return Err(e);
        }
    };

    let target = request.target;
    let established = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        let outbound = connect(&target).await.map_err(EstablishError::Connect)?;
        let local = outbound.local_addr().map_err(EstablishError::Connect)?;
        let pt = transport
            .establish(outbound, &params)
            .await
            .map_err(EstablishError::Transport)?;
        Ok((pt, local))
    })
    .await
    .unwrap_or(Err(EstablishError::Transport(Error::HandshakeTimeout)));

    let (mut pt, local_addr) = match established {
        Ok(ok) => ok,
        Err(EstablishError::Connect(e)) => {
            warn!(
                bridge = %sensitive(&target),
                "{transport}: outbound connection failed: {e}"
            );
            let _ = proto::send_reply(&mut inbound, connect_error_reply(&e), None).await;
            return Err(e.into());
        }
        Err(EstablishError::Transport(e)) => {
            warn!(
                bridge = %sensitive(&target),
                "{transport}: handshake failed: {e}"
            );
            let _ = proto::send_reply(&mut inbound, Reply::GeneralFailure, None).await;
            return Err(e);
        }
    };

    proto::send_reply(&mut inbound, Reply::Succeeded, Some(local_addr)).await?;
    info!(peer = %sensitive(peer), "{transport}: session established");

    // Steady state: errors here are a silent close, fatal only for this
    // session.
    match copy_bidirectional(&mut inbound, &mut pt).await {
        Ok((up, down)) => {
            debug!("{transport}: session closed, {up}B up / {down}B down");
        }
        Err(e) => {
            debug!("{transport}: session closed with error: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_set_bookkeeping() {
        let set = SessionSet::new();
        assert!(set.is_empty());

        let id = set.next_id();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        set.insert(id, task.abort_handle());
        assert_eq!(set.len(), 1);

        set.abort_all();
        assert!(task.await.unwrap_err().is_cancelled());

        set.remove(id);
        assert!(set.is_empty());
    }

    #[test]
    fn connect_errors_map_to_replies() {
        let refused = std::io::Error::new(ErrorKind::ConnectionRefused, "refused");
        assert_eq!(connect_error_reply(&refused), Reply::ConnectionRefused);

        let timeout = std::io::Error::new(ErrorKind::TimedOut, "timed out");
        assert_eq!(connect_error_reply(&timeout), Reply::HostUnreachable);

        let other = std::io::Error::new(ErrorKind::Other, "other");
        assert_eq!(connect_error_reply(&other), Reply::GeneralFailure);
    }
}
