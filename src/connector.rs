use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::addr::{Host, WsAddr};
use crate::codec::FrameCodec;
use crate::endpoint::{self, Command};
use crate::errors::WsError;
use crate::frame::{close_code, Frame};
use crate::handshake;
use crate::socket::SocketCore;

/// Connect endpoint task: resolve, connect, upgrade, run the endpoint,
/// and reconnect with exponential backoff. A peer that failed the
/// connection over our traffic parks the connector instead; only a new
/// explicit connect restarts the cycle.
pub(crate) async fn run(
    core: Arc<SocketCore>,
    addr: WsAddr,
    local: Option<Ipv4Addr>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = core.options().reconnect_ivl;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match attempt(&core, &addr, local).await {
            Ok(framed) => {
                backoff = core.options().reconnect_ivl;
                let (cmd_tx, cmd_rx) = mpsc::channel(16);
                let pipe = core.add_pipe(cmd_tx.clone());
                let run_fut = endpoint::run(framed, cmd_rx, core.inbound(), core.shared_options());
                tokio::pin!(run_fut);
                let mut closing = false;
                let reason = loop {
                    tokio::select! {
                        reason = &mut run_fut => break reason,
                        _ = shutdown.changed(), if !closing => {
                            closing = true;
                            let _ = cmd_tx.try_send(Command::Close {
                                code: close_code::NORMAL,
                            });
                        }
                    }
                };
                core.remove_pipe(pipe);
                if closing || *shutdown.borrow() {
                    return;
                }
                if reason.forbids_reconnect() {
                    debug!(?reason, "peer failed the connection, parking");
                    return;
                }
                debug!(?reason, "connection ended, reconnecting");
            }
            // handshake failures surface to callers as timeouts on the
            // socket API; the distinct cause only shows up here
            Err(e @ WsError::HandshakeFailed(_)) => warn!("connect attempt failed: {e}"),
            Err(e) => debug!("connect attempt failed: {e}"),
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(core.options().reconnect_ivl_max);
    }
}

async fn attempt(
    core: &Arc<SocketCore>,
    addr: &WsAddr,
    local: Option<Ipv4Addr>,
) -> Result<Framed<TcpStream, FrameCodec>, WsError> {
    let opts = core.options();
    let remote = resolve(addr).await?;
    let mut stream = match local {
        Some(ip) => {
            let socket = TcpSocket::new_v4()?;
            socket.bind(SocketAddr::new(ip.into(), 0))?;
            socket.connect(remote).await?
        }
        None => TcpStream::connect(remote).await?,
    };

    let upgrade = match tokio::time::timeout(
        opts.handshake_timeout,
        handshake::client_upgrade(&mut stream, addr, &opts.protocol),
    )
    .await
    {
        Ok(Ok(upgrade)) => upgrade,
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(WsError::Timeout),
    };

    let mut parts = FramedParts::new::<Frame>(stream, FrameCodec::client());
    parts.read_buf = upgrade.remain;
    Ok(Framed::from_parts(parts))
}

async fn resolve(addr: &WsAddr) -> Result<SocketAddr, WsError> {
    match &addr.host {
        Host::Ipv4(ip) => Ok(SocketAddr::new((*ip).into(), addr.port)),
        Host::Name(name) => {
            let mut records = tokio::net::lookup_host((name.as_str(), addr.port)).await?;
            records
                .find(|record| record.is_ipv4())
                .ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no ipv4 address records")
                        .into()
                })
        }
        // the connect grammar rejects the wildcard host
        Host::Any => Err(WsError::InvalidAddress(addr.host_header())),
    }
}
