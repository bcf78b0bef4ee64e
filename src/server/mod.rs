//! Inbound SMTP listener: accepts connections and runs one task per
//! connection, each with its own [`Session`](crate::session::Session).

pub mod connection;
pub mod data;
pub mod timeout;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::ListenerConfig;
use crate::session::Backend;

pub use connection::Connection;

pub struct Server {
    listener: TcpListener,
    backend: Arc<Backend>,
    config: Arc<ListenerConfig>,
}

impl Server {
    pub async fn bind(config: ListenerConfig, backend: Arc<Backend>) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        info!(addr = %listener.local_addr()?, domain = %config.domain, "SMTP listener bound");
        Ok(Self {
            listener,
            backend,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` resolves. Connections already
    /// running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("SMTP listener shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(err = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    self.spawn_connection(stream, peer);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let backend = Arc::clone(&self.backend);
        let config = Arc::clone(&self.config);
        let span = info_span!("connection", id = %Uuid::new_v4(), %peer);

        tokio::spawn(
            async move {
                debug!("Connection accepted");
                let (reader, writer) = stream.into_split();
                match Connection::new(reader, writer, &backend, config).run().await {
                    Ok(()) => debug!("Connection closed"),
                    Err(e) => debug!(err = %e, "Connection ended with error"),
                }
            }
            .instrument(span),
        );
    }
}
