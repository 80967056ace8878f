//! Local TCP relay for direct-proxy agents.
//!
//! When the local service listens somewhere the relay can't dial, the agent
//! binds `proxy_port` on all interfaces and pipes every accepted connection to
//! `localhost:port`. The relay is then told to dial `proxy_port` instead.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed `accept()` so descriptor exhaustion doesn't spin.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct TcpRelay {
    listener: TcpListener,
    target: String,
}

impl TcpRelay {
    pub async fn bind(listen: &str, target: impl Into<String>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(listen).await?;
        Ok(Self {
            listener,
            target: target.into(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and pipe connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            listen = ?self.listener.local_addr().ok(),
            target = %self.target,
            "TCP relay listening"
        );
        loop {
            let (mut inbound, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "TCP relay accept failed");
                        if backoff(&cancel).await {
                            continue;
                        }
                        break;
                    }
                },
                () = cancel.cancelled() => break,
            };

            let target = self.target.clone();
            tokio::spawn(async move {
                let mut outbound = match TcpStream::connect(&target).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(%peer, %target, error = %e, "TCP relay dial failed");
                        return;
                    }
                };
                match tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await {
                    Ok((up, down)) => debug!(%peer, up, down, "TCP relay connection closed"),
                    Err(e) => debug!(%peer, error = %e, "TCP relay connection reset"),
                }
            });
        }
    }
}

/// Sleeps for `ACCEPT_BACKOFF`. Returns `false` if cancelled first.
async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(ACCEPT_BACKOFF) => true,
        () = cancel.cancelled() => false,
    }
}
