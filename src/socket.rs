use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::addr::{self, AddrKind, Host, WsAddr};
use crate::connector;
use crate::endpoint::Command;
use crate::errors::WsError;
use crate::frame::{close_code, OpCode};
use crate::listener;
use crate::options::{self, MsgType, Options, SharedOptions};
use crate::Message;

/// ancillary metadata level for WebSocket-specific items
pub const OPT_LEVEL_WS: i32 = 4;
/// ancillary item carrying the message opcode
pub const OPT_WS_MSG_TYPE: i32 = 1;

/// out-of-band attributes delivered alongside every received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgMeta {
    /// metadata namespace, always [`OPT_LEVEL_WS`]
    pub level: i32,
    /// item identifier, always [`OPT_WS_MSG_TYPE`]
    pub name: i32,
    /// `0x80 | opcode`: the low nibble is the originating opcode, the
    /// high bit marks the message final (reassembly is complete by the
    /// time a message is delivered, so it is always set)
    pub value: u8,
}

/// identifies one bind or connect endpoint of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

struct Pipe {
    id: u64,
    cmd: mpsc::Sender<Command>,
}

/// shared state between the socket handle and its endpoint tasks
pub(crate) struct SocketCore {
    opts: SharedOptions,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: AsyncMutex<mpsc::Receiver<Message>>,
    pipes: StdMutex<Vec<Pipe>>,
    pipe_ready: Notify,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl SocketCore {
    pub(crate) fn options(&self) -> Options {
        options::snapshot(&self.opts)
    }

    pub(crate) fn shared_options(&self) -> SharedOptions {
        self.opts.clone()
    }

    pub(crate) fn inbound(&self) -> mpsc::Sender<Message> {
        self.inbound_tx.clone()
    }

    /// register an active connection; send waiters are woken
    pub(crate) fn add_pipe(&self, cmd: mpsc::Sender<Command>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pipes.lock().expect("pipes lock").push(Pipe { id, cmd });
        self.pipe_ready.notify_waiters();
        id
    }

    pub(crate) fn remove_pipe(&self, id: u64) {
        self.pipes.lock().expect("pipes lock").retain(|pipe| pipe.id != id);
    }

    fn pick_pipe(&self) -> Option<(u64, mpsc::Sender<Command>)> {
        self.pipes
            .lock()
            .expect("pipes lock")
            .first()
            .map(|pipe| (pipe.id, pipe.cmd.clone()))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct EndpointHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// A pair socket carried over the WebSocket transport.
///
/// One peer at a time exchanges discrete messages with the other side;
/// `bind` and `connect` may each be called more than once and every
/// resulting endpoint keeps itself connected in the background.
///
/// Endpoint tasks run on the ambient tokio runtime, so the socket must
/// be created and used inside one.
pub struct PairSocket {
    core: Arc<SocketCore>,
    endpoints: StdMutex<HashMap<EndpointId, EndpointHandle>>,
}

impl Default for PairSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl PairSocket {
    /// create an unconnected socket with default options
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(128);
        Self {
            core: Arc::new(SocketCore {
                opts: options::shared(Options::default()),
                inbound_tx,
                inbound_rx: AsyncMutex::new(inbound_rx),
                pipes: StdMutex::new(Vec::new()),
                pipe_ready: Notify::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
            endpoints: StdMutex::new(HashMap::new()),
        }
    }

    /// start listening on a bind address
    ///
    /// Address errors are reported synchronously; the listening socket
    /// itself is acquired in the background, queueing behind an earlier
    /// holder of the same address if there is one.
    pub fn bind(&self, address: &str) -> Result<EndpointId, WsError> {
        if self.core.is_closed() {
            return Err(WsError::Closed);
        }
        let parsed = WsAddr::parse(address, AddrKind::Bind)?;
        let ip = match (&parsed.iface, &parsed.host) {
            (Some(iface), Host::Ipv4(ip)) => {
                addr::resolve_iface(iface)?;
                *ip
            }
            (Some(iface), _) => addr::resolve_iface(iface)?,
            (None, Host::Ipv4(ip)) => *ip,
            (None, Host::Any) => Ipv4Addr::UNSPECIFIED,
            // a bare name on a bind address is an interface name
            (None, Host::Name(name)) => addr::resolve_iface(name)?,
        };
        let local = SocketAddrV4::new(ip, parsed.port);

        let id = EndpointId(self.core.next_id.fetch_add(1, Ordering::Relaxed));
        let (sd_tx, sd_rx) = watch::channel(false);
        let task = tokio::spawn(listener::run(self.core.clone(), local, sd_rx, id.0));
        self.endpoints
            .lock()
            .expect("endpoints lock")
            .insert(id, EndpointHandle { shutdown: sd_tx, task });
        debug!(%local, "bind endpoint created");
        Ok(id)
    }

    /// start connecting to a peer
    ///
    /// Address and device errors are reported synchronously; the
    /// connection is established and re-established in the background.
    pub fn connect(&self, address: &str) -> Result<EndpointId, WsError> {
        if self.core.is_closed() {
            return Err(WsError::Closed);
        }
        let parsed = WsAddr::parse(address, AddrKind::Connect)?;
        let local = parsed
            .iface
            .as_deref()
            .map(addr::resolve_iface)
            .transpose()?;

        let id = EndpointId(self.core.next_id.fetch_add(1, Ordering::Relaxed));
        let (sd_tx, sd_rx) = watch::channel(false);
        let task = tokio::spawn(connector::run(self.core.clone(), parsed, local, sd_rx));
        self.endpoints
            .lock()
            .expect("endpoints lock")
            .insert(id, EndpointHandle { shutdown: sd_tx, task });
        debug!(address, "connect endpoint created");
        Ok(id)
    }

    /// send one message under the configured message type
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<(), WsError> {
        let code = self.core.options().msg_type.opcode();
        self.send_msg(data.into(), code).await
    }

    /// send one message under an explicit opcode (the raw-frame mode:
    /// ping, pong and close frames can be produced directly)
    pub async fn send_msg(&self, data: Bytes, code: OpCode) -> Result<(), WsError> {
        if code == OpCode::Continuation {
            return Err(WsError::InvalidArgument(
                "continuation frames cannot be sent directly",
            ));
        }
        match self.core.options().send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.send_inner(data, code))
                .await
                .map_err(|_| WsError::Timeout)?,
            None => self.send_inner(data, code).await,
        }
    }

    async fn send_inner(&self, data: Bytes, code: OpCode) -> Result<(), WsError> {
        loop {
            if self.core.is_closed() {
                return Err(WsError::Closed);
            }
            let notified = self.core.pipe_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let Some((pipe_id, cmd)) = self.core.pick_pipe() else {
                notified.await;
                continue;
            };
            if code == OpCode::Close {
                if cmd
                    .send(Command::Close {
                        code: close_code::NORMAL,
                    })
                    .await
                    .is_err()
                {
                    self.core.remove_pipe(pipe_id);
                    continue;
                }
                return Ok(());
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            let command = Command::Send {
                code,
                payload: data.clone(),
                ack: Some(ack_tx),
            };
            if cmd.send(command).await.is_err() {
                self.core.remove_pipe(pipe_id);
                continue;
            }
            match ack_rx.await {
                Ok(Ok(())) => return Ok(()),
                // a dying pipe is retried until a live one shows up or
                // the send timeout expires
                Ok(Err(_)) | Err(_) => {
                    self.core.remove_pipe(pipe_id);
                }
            }
        }
    }

    /// non-blocking send; `WouldBlock` when no connected pipe can take
    /// the message without waiting
    pub fn try_send(&self, data: impl Into<Bytes>) -> Result<(), WsError> {
        if self.core.is_closed() {
            return Err(WsError::Closed);
        }
        let code = self.core.options().msg_type.opcode();
        let Some((pipe_id, cmd)) = self.core.pick_pipe() else {
            return Err(WsError::WouldBlock);
        };
        let command = Command::Send {
            code,
            payload: data.into(),
            ack: None,
        };
        match cmd.try_send(command) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(WsError::WouldBlock),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.core.remove_pipe(pipe_id);
                Err(WsError::WouldBlock)
            }
        }
    }

    /// receive one whole reassembled message
    pub async fn recv(&self) -> Result<Message, WsError> {
        if self.core.is_closed() {
            return Err(WsError::Closed);
        }
        let limit = self.core.options().recv_timeout;
        let mut rx = self.core.inbound_rx.lock().await;
        match limit {
            Some(limit) => match tokio::time::timeout(limit, rx.recv()).await {
                Ok(Some(message)) => Ok(message),
                Ok(None) => Err(WsError::Closed),
                Err(_) => Err(WsError::Timeout),
            },
            None => rx.recv().await.ok_or(WsError::Closed),
        }
    }

    /// non-blocking receive
    pub fn try_recv(&self) -> Result<Message, WsError> {
        if self.core.is_closed() {
            return Err(WsError::Closed);
        }
        let mut rx = self
            .core
            .inbound_rx
            .try_lock()
            .map_err(|_| WsError::WouldBlock)?;
        match rx.try_recv() {
            Ok(message) => Ok(message),
            Err(mpsc::error::TryRecvError::Empty) => Err(WsError::WouldBlock),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(WsError::Closed),
        }
    }

    /// default outbound message type
    pub fn msg_type(&self) -> MsgType {
        self.core.options().msg_type
    }

    /// set the default outbound message type
    pub fn set_msg_type(&self, msg_type: MsgType) {
        self.core.opts.lock().expect("options lock").msg_type = msg_type;
    }

    /// inbound message size cap, -1 when unbounded
    pub fn recv_max_size(&self) -> i64 {
        self.core.options().recv_max_size
    }

    /// cap reassembled inbound messages at `limit` bytes; -1 removes
    /// the cap, anything below -1 is rejected
    pub fn set_recv_max_size(&self, limit: i64) -> Result<(), WsError> {
        if limit < -1 {
            return Err(WsError::InvalidArgument("recv_max_size must be >= -1"));
        }
        self.core.opts.lock().expect("options lock").recv_max_size = limit;
        Ok(())
    }

    /// per-call send timeout; `None` blocks indefinitely
    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.core.opts.lock().expect("options lock").send_timeout = timeout;
    }

    /// per-call receive timeout; `None` blocks indefinitely
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.core.opts.lock().expect("options lock").recv_timeout = timeout;
    }

    /// reconnect backoff range: first interval and doubling cap
    pub fn set_reconnect_ivl(&self, ivl: Duration, max: Duration) {
        let mut opts = self.core.opts.lock().expect("options lock");
        opts.reconnect_ivl = ivl;
        opts.reconnect_ivl_max = max.max(ivl);
    }

    /// limit on the HTTP upgrade exchange
    pub fn set_handshake_timeout(&self, timeout: Duration) {
        self.core.opts.lock().expect("options lock").handshake_timeout = timeout;
    }

    /// grace period for the closing handshake
    pub fn set_linger(&self, linger: Duration) {
        self.core.opts.lock().expect("options lock").linger = linger;
    }

    /// close one endpoint, waiting up to `linger` for the closing
    /// handshake on its connections
    pub async fn close_endpoint(&self, id: EndpointId, linger: Duration) -> Result<(), WsError> {
        let handle = self
            .endpoints
            .lock()
            .expect("endpoints lock")
            .remove(&id)
            .ok_or(WsError::Closed)?;
        let _ = handle.shutdown.send(true);
        let mut task = handle.task;
        if tokio::time::timeout(linger, &mut task).await.is_err() {
            debug!(?id, "endpoint exceeded linger, aborting");
            task.abort();
        }
        Ok(())
    }

    /// close the socket and every endpoint on it; pending operations
    /// fail with `Closed`
    pub async fn close(self) {
        self.core.closed.store(true, Ordering::SeqCst);
        self.core.pipe_ready.notify_waiters();
        let handles: Vec<EndpointHandle> = {
            let mut endpoints = self.endpoints.lock().expect("endpoints lock");
            endpoints.drain().map(|(_, handle)| handle).collect()
        };
        let linger = self.core.options().linger;
        for handle in handles {
            let _ = handle.shutdown.send(true);
            let mut task = handle.task;
            if tokio::time::timeout(linger, &mut task).await.is_err() {
                task.abort();
            }
        }
        debug!("socket closed");
    }
}

impl Message {
    /// ancillary metadata for this message
    pub fn meta(&self) -> MsgMeta {
        MsgMeta {
            level: OPT_LEVEL_WS,
            name: OPT_WS_MSG_TYPE,
            value: 0x80 | self.code.as_u8(),
        }
    }
}
