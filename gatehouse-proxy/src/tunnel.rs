//! Relay for connections taken over by a protocol upgrade.
//!
//! Once a backend accepts an upgrade (`101 Switching Protocols`) the client
//! and backend connections stop speaking HTTP. A [`Tunnel`] waits for hyper
//! to hand over both sides, then copies bytes in both directions until one
//! side closes or the websockets timeout elapses.
//!
//! The tunnel outlives the request that opened it: the request's
//! cancellation token fires as soon as the 101 response is returned, so
//! only the timeout and the peers bound its lifetime.

use std::time::Duration;

use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Both pending halves of an accepted upgrade.
pub struct Tunnel {
    client: OnUpgrade,
    backend: OnUpgrade,
    timeout: Option<Duration>,
    request_id: String,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("timeout", &self.timeout)
            .field("request_id", &self.request_id)
            .finish()
    }
}

impl Tunnel {
    pub fn new(
        client: OnUpgrade,
        backend: OnUpgrade,
        timeout: Option<Duration>,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            client,
            backend,
            timeout,
            request_id: request_id.into(),
        }
    }

    /// Relay in a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.relay())
    }

    async fn relay(self) {
        let request_id = self.request_id;
        let (client, backend) = match tokio::try_join!(self.client, self.backend) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(request_id = %request_id, error = %e, "Upgraded connection not handed over");
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut backend = TokioIo::new(backend);
        let copy = tokio::io::copy_bidirectional(&mut client, &mut backend);

        let copied = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, copy).await {
                Ok(copied) => copied,
                Err(_) => {
                    info!(
                        request_id = %request_id,
                        timeout = ?limit,
                        "Upgraded connection timed out"
                    );
                    return;
                }
            },
            None => copy.await,
        };

        match copied {
            Ok((from_client, from_backend)) => info!(
                request_id = %request_id,
                from_client,
                from_backend,
                "Upgraded connection closed"
            ),
            Err(e) => debug!(request_id = %request_id, error = %e, "Upgraded connection ended"),
        }
    }
}
