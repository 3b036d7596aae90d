use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::codec::FrameCodec;
use crate::endpoint::{self, Command};
use crate::frame::{close_code, Frame};
use crate::handshake;
use crate::socket::SocketCore;

/// Process-wide bind arbitration. Only the claim at the front of a
/// queue holds the OS listening socket; later claims wait without any
/// kernel resource and are promoted in order when the holder releases.
struct Claim {
    id: u64,
    ready: Arc<Notify>,
}

static REGISTRY: OnceLock<Mutex<HashMap<SocketAddrV4, Vec<Claim>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<SocketAddrV4, Vec<Claim>>> {
    REGISTRY.get_or_init(Default::default)
}

fn claim(key: SocketAddrV4, id: u64) -> Arc<Notify> {
    let ready = Arc::new(Notify::new());
    let mut map = registry().lock().expect("bind registry lock");
    let queue = map.entry(key).or_default();
    if queue.is_empty() {
        ready.notify_one();
    }
    queue.push(Claim {
        id,
        ready: ready.clone(),
    });
    ready
}

fn is_front(key: SocketAddrV4, id: u64) -> bool {
    let map = registry().lock().expect("bind registry lock");
    map.get(&key)
        .and_then(|queue| queue.first())
        .map(|claim| claim.id == id)
        .unwrap_or(false)
}

fn release(key: SocketAddrV4, id: u64) {
    let mut map = registry().lock().expect("bind registry lock");
    if let Some(queue) = map.get_mut(&key) {
        let was_front = queue.first().map(|claim| claim.id) == Some(id);
        queue.retain(|claim| claim.id != id);
        if queue.is_empty() {
            map.remove(&key);
        } else if was_front {
            queue[0].ready.notify_one();
        }
    }
}

/// Bind endpoint task: queue for the address, and once promoted run the
/// accept loop, one server endpoint per connection. Closing the
/// listener also closes the connections it accepted; closing while
/// still waiting touches nothing but the queue.
pub(crate) async fn run(
    core: Arc<SocketCore>,
    local: SocketAddrV4,
    mut shutdown: watch::Receiver<bool>,
    ep_id: u64,
) {
    let ready = claim(local, ep_id);
    loop {
        if is_front(local, ep_id) {
            break;
        }
        debug!(%local, "waiting to bind");
        tokio::select! {
            _ = ready.notified() => {}
            _ = shutdown.changed() => {
                release(local, ep_id);
                return;
            }
        }
    }

    // the previous holder's socket may not be fully released yet
    let listener = loop {
        match TcpListener::bind(SocketAddr::V4(local)).await {
            Ok(listener) => break listener,
            Err(e) => {
                debug!(%local, "bind not ready: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => {}
                    _ = shutdown.changed() => {
                        release(local, ep_id);
                        return;
                    }
                }
            }
        }
    };
    debug!(%local, "listening");

    let mut children: Vec<(mpsc::Sender<Command>, tokio::task::JoinHandle<()>)> = Vec::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted");
                    children.retain(|(_, task)| !task.is_finished());
                    let (cmd_tx, cmd_rx) = mpsc::channel(16);
                    let task = tokio::spawn(serve(core.clone(), stream, cmd_tx.clone(), cmd_rx));
                    children.push((cmd_tx, task));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }

    drop(listener);
    release(local, ep_id);
    for (cmd, _) in &children {
        let _ = cmd.try_send(Command::Close {
            code: close_code::NORMAL,
        });
    }
    for (_, task) in children {
        let _ = task.await;
    }
    debug!(%local, "listener closed");
}

async fn serve(
    core: Arc<SocketCore>,
    mut stream: TcpStream,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
) {
    let opts = core.options();
    let upgrade = match tokio::time::timeout(
        opts.handshake_timeout,
        handshake::server_upgrade(&mut stream, &opts.protocol),
    )
    .await
    {
        Ok(Ok(upgrade)) => upgrade,
        Ok(Err(e)) => {
            warn!("server handshake failed: {e}");
            return;
        }
        Err(_) => {
            warn!("server handshake timed out");
            return;
        }
    };

    let mut parts = FramedParts::new::<Frame>(stream, FrameCodec::server());
    parts.read_buf = upgrade.remain;
    let framed = Framed::from_parts(parts);

    let pipe = core.add_pipe(cmd_tx);
    let reason = endpoint::run(framed, cmd_rx, core.inbound(), core.shared_options()).await;
    core.remove_pipe(pipe);
    debug!(?reason, resource = %upgrade.resource, "server endpoint finished");
}
