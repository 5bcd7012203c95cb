//! Administrative TCP listener.
//!
//! A single-purpose local endpoint: any accepted connection whose first
//! segment begins with `KILL` stops the engine loop. There is no
//! authentication; the port is expected to be firewalled.

use crate::error::{NetworkError, NetworkResult};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Command that stops the node.
pub const INSTRUCTION_KILL: &[u8] = b"KILL";

/// Bind the admin socket with the configured listen backlog. Failing to
/// bind is one of the few fatal startup errors.
pub fn bind(port: u16, backlog: u32) -> NetworkResult<TcpListener> {
    let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    let bind_socket = || -> std::io::Result<TcpListener> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    };
    let listener = bind_socket().map_err(|source| NetworkError::Bind { port, source })?;
    info!(%addr, backlog, "admin listener ready");
    Ok(listener)
}

/// Accept admin connections forever, signalling `kill` on a `KILL` payload.
pub async fn serve(listener: TcpListener, kill: mpsc::Sender<()>) {
    loop {
        let (mut stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "admin accept failed");
                continue;
            }
        };
        debug!(%remote, "admin connection accepted");

        let kill = kill.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            match stream.read(&mut buf).await {
                Ok(n) if buf[..n].starts_with(INSTRUCTION_KILL) => {
                    info!(%remote, "kill instruction received");
                    let _ = kill.send(()).await;
                }
                Ok(n) => debug!(%remote, bytes = n, "ignored admin payload"),
                Err(e) => warn!(%remote, error = %e, "admin read failed"),
            }
        });
    }
}
