use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::codec::FrameCodec;
use crate::errors::WsError;
use crate::frame::{close_code, Frame, OpCode};
use crate::options::{snapshot, SharedOptions};
use crate::reassembly::MessageAssembler;
use crate::Message;

/// command from the socket layer to one endpoint task
pub(crate) enum Command {
    /// write one frame; data opcodes normally, ping/pong for the
    /// raw-frame mode (close requests are routed to `Close`)
    Send {
        code: OpCode,
        payload: Bytes,
        ack: Option<oneshot::Sender<Result<(), WsError>>>,
    },
    /// start the closing handshake with this status code
    Close { code: u16 },
}

/// why the endpoint ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// peer initiated the closing handshake
    PeerClosed { code: Option<u16> },
    /// we were asked to close, or the socket went away
    LocalClosed,
    /// we detected a peer violation and failed the connection
    Protocol { code: u16 },
    /// transport error or EOF without a closing handshake
    Io,
}

impl Teardown {
    /// a peer that failed the connection over our traffic must not be
    /// reconnected to automatically; only an explicit connect restarts
    /// the cycle
    pub(crate) fn forbids_reconnect(&self) -> bool {
        matches!(
            self,
            Teardown::PeerClosed { code: Some(code) }
                if *code != close_code::NORMAL && *code != 1001
        )
    }
}

/// Drive one established connection until it tears down.
///
/// The task owns the framed stream, so frame writes are serialized and a
/// frame is never interrupted mid-transmission. The select is biased
/// toward the wire: pending pongs and close echoes go out ahead of
/// not-yet-started data frames.
pub(crate) async fn run<S>(
    mut framed: Framed<S, FrameCodec>,
    mut commands: mpsc::Receiver<Command>,
    inbound: mpsc::Sender<Message>,
    opts: SharedOptions,
) -> Teardown
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut assembler = MessageAssembler::default();
    loop {
        tokio::select! {
            biased;
            item = framed.next() => match item {
                None => return Teardown::Io,
                Some(Err(WsError::Protocol { close_code: code, error })) => {
                    warn!(%error, code, "protocol violation, failing the connection");
                    let _ = framed.send(Frame::close(Some(code), &error.to_string())).await;
                    return drain(framed, commands, linger(&opts), Teardown::Protocol { code }).await;
                }
                Some(Err(e)) => {
                    debug!("transport error: {e}");
                    return Teardown::Io;
                }
                Some(Ok(frame)) => match frame.header.opcode {
                    OpCode::Ping => {
                        trace!(len = frame.payload.len(), "ping");
                        if framed.send(Frame::pong(frame.payload)).await.is_err() {
                            return Teardown::Io;
                        }
                    }
                    OpCode::Pong => {}
                    OpCode::Close => match frame.close_body() {
                        Ok(code) => {
                            debug!(?code, "close received, echoing");
                            let _ = framed.send(Frame::close(code, "")).await;
                            return drain(
                                framed,
                                commands,
                                linger(&opts),
                                Teardown::PeerClosed { code },
                            )
                            .await;
                        }
                        Err(error) => {
                            let code = error.close_code();
                            warn!(%error, "invalid close frame");
                            let _ = framed.send(Frame::close(Some(code), &error.to_string())).await;
                            return drain(framed, commands, linger(&opts), Teardown::Protocol { code })
                                .await;
                        }
                    },
                    _ => {
                        let limit = snapshot(&opts).recv_max_size;
                        match assembler.push(frame, limit) {
                            Ok(None) => {}
                            Ok(Some((code, data))) => {
                                if inbound.send(Message { code, data }).await.is_err() {
                                    // receive side of the socket is gone
                                    let _ = framed
                                        .send(Frame::close(Some(close_code::NORMAL), ""))
                                        .await;
                                    return drain(framed, commands, linger(&opts), Teardown::LocalClosed)
                                        .await;
                                }
                            }
                            Err(error) => {
                                let code = error.close_code();
                                warn!(%error, code, "failing the connection");
                                let _ = framed.send(Frame::close(Some(code), &error.to_string())).await;
                                return drain(framed, commands, linger(&opts), Teardown::Protocol { code })
                                    .await;
                            }
                        }
                    }
                },
            },
            cmd = commands.recv() => match cmd {
                None => {
                    // the socket dropped this endpoint: close gracefully
                    let _ = framed.send(Frame::close(Some(close_code::NORMAL), "")).await;
                    return drain(framed, commands, linger(&opts), Teardown::LocalClosed).await;
                }
                Some(Command::Send { code, payload, ack }) => {
                    let result = framed.send(Frame::new(true, code, payload)).await;
                    let failed = result.is_err();
                    if let Some(ack) = ack {
                        let _ = ack.send(result);
                    }
                    if failed {
                        return Teardown::Io;
                    }
                }
                Some(Command::Close { code }) => {
                    let _ = framed.send(Frame::close(Some(code), "")).await;
                    return drain(framed, commands, linger(&opts), Teardown::LocalClosed).await;
                }
            },
        }
    }
}

fn linger(opts: &SharedOptions) -> Duration {
    snapshot(opts).linger
}

/// Closing state: the Close frame is already written. Wait for the
/// peer's Close or EOF up to the linger deadline, never delivering data
/// upward, then drop the TCP socket. Pending user sends fail with
/// `Closed`.
async fn drain<S>(
    mut framed: Framed<S, FrameCodec>,
    mut commands: mpsc::Receiver<Command>,
    linger: Duration,
    outcome: Teardown,
) -> Teardown
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let deadline = Instant::now() + linger;
    let mut commands_open = true;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            item = framed.next() => match item {
                None | Some(Err(_)) => break,
                Some(Ok(frame)) if frame.header.opcode == OpCode::Close => break,
                Some(Ok(_)) => {}
            },
            cmd = commands.recv(), if commands_open => match cmd {
                None => commands_open = false,
                Some(Command::Send { ack, .. }) => {
                    if let Some(ack) = ack {
                        let _ = ack.send(Err(WsError::Closed));
                    }
                }
                Some(Command::Close { .. }) => {}
            },
        }
    }
    let _ = framed.close().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options;
    use tokio::io::DuplexStream;

    type Peer = Framed<DuplexStream, FrameCodec>;

    /// spawn a server-side endpoint over an in-memory stream and hand
    /// back the client half plus the task's channels
    fn harness() -> (
        Peer,
        mpsc::Sender<Command>,
        mpsc::Receiver<Message>,
        tokio::task::JoinHandle<Teardown>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let framed = Framed::new(server, FrameCodec::server());
        let peer = Framed::new(client, FrameCodec::client());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (in_tx, in_rx) = mpsc::channel(8);
        let opts = options::shared(options::Options {
            linger: Duration::from_millis(200),
            ..Default::default()
        });
        let task = tokio::spawn(run(framed, cmd_rx, in_tx, opts));
        (peer, cmd_tx, in_rx, task)
    }

    #[tokio::test]
    async fn ping_is_answered_with_matching_pong() {
        let (mut peer, _cmd, _in, _task) = harness();
        peer.send(Frame::new(true, OpCode::Ping, Bytes::from_static(b"tick")))
            .await
            .unwrap();
        let pong = peer.next().await.unwrap().unwrap();
        assert_eq!(pong.header.opcode, OpCode::Pong);
        assert_eq!(&pong.payload[..], b"tick");
    }

    #[tokio::test]
    async fn data_frames_are_delivered_whole() {
        let (mut peer, _cmd, mut inbound, _task) = harness();
        peer.send(Frame::data(OpCode::Text, Bytes::from_static(b"hi")))
            .await
            .unwrap();
        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.code, OpCode::Text);
        assert_eq!(&msg.data[..], b"hi");
    }

    #[tokio::test]
    async fn fragments_reassemble_with_a_ping_in_between() {
        let (mut peer, _cmd, mut inbound, _task) = harness();
        peer.send(Frame::new(false, OpCode::Text, Bytes::from_static(b"one ")))
            .await
            .unwrap();
        // control frames may sit between fragments without joining them
        peer.send(Frame::new(true, OpCode::Ping, Bytes::from_static(b"mid")))
            .await
            .unwrap();
        peer.send(Frame::new(
            true,
            OpCode::Continuation,
            Bytes::from_static(b"two"),
        ))
        .await
        .unwrap();

        let pong = peer.next().await.unwrap().unwrap();
        assert_eq!(pong.header.opcode, OpCode::Pong);
        assert_eq!(&pong.payload[..], b"mid");

        let msg = inbound.recv().await.unwrap();
        assert_eq!(msg.code, OpCode::Text);
        assert_eq!(&msg.data[..], b"one two");
    }

    #[tokio::test]
    async fn close_is_echoed_with_the_same_code() {
        let (mut peer, _cmd, _in, task) = harness();
        peer.send(Frame::close(Some(close_code::NORMAL), "bye"))
            .await
            .unwrap();
        let echo = peer.next().await.unwrap().unwrap();
        assert_eq!(echo.header.opcode, OpCode::Close);
        assert_eq!(echo.close_body().unwrap(), Some(close_code::NORMAL));
        let teardown = task.await.unwrap();
        assert_eq!(
            teardown,
            Teardown::PeerClosed {
                code: Some(close_code::NORMAL)
            }
        );
    }

    #[tokio::test]
    async fn oversize_message_fails_with_1009() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let framed = Framed::new(server, FrameCodec::server());
        let mut peer: Peer = Framed::new(client, FrameCodec::client());
        let (_cmd_tx, cmd_rx) = mpsc::channel::<Command>(8);
        let (in_tx, mut in_rx) = mpsc::channel(8);
        let opts = options::shared(options::Options {
            recv_max_size: 4,
            linger: Duration::from_millis(200),
            ..Default::default()
        });
        let task = tokio::spawn(run(framed, cmd_rx, in_tx, opts));

        peer.send(Frame::data(OpCode::Binary, Bytes::from_static(b"ABCDE")))
            .await
            .unwrap();
        let close = peer.next().await.unwrap().unwrap();
        assert_eq!(close.header.opcode, OpCode::Close);
        assert_eq!(close.close_body().unwrap(), Some(close_code::TOO_BIG));
        assert_eq!(
            task.await.unwrap(),
            Teardown::Protocol {
                code: close_code::TOO_BIG
            }
        );
        assert!(in_rx.recv().await.is_none(), "no delivery for the dropped message");
    }

    #[tokio::test]
    async fn send_command_writes_a_masked_frame_and_acks() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        // client-side endpoint this time, so its frames must be masked
        let framed = Framed::new(client, FrameCodec::client());
        let mut peer = Framed::new(server, FrameCodec::server());
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let _task = tokio::spawn(run(framed, cmd_rx, in_tx, options::shared(Default::default())));

        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                code: OpCode::Binary,
                payload: Bytes::from_static(b"out"),
                ack: Some(ack_tx),
            })
            .await
            .unwrap();
        ack_rx.await.unwrap().unwrap();
        let frame = peer.next().await.unwrap().unwrap();
        assert!(frame.header.mask.is_some());
        assert_eq!(&frame.payload[..], b"out");
    }

    #[tokio::test]
    async fn local_close_refuses_further_sends() {
        let (mut peer, cmd_tx, _in, task) = harness();
        cmd_tx
            .send(Command::Close {
                code: close_code::NORMAL,
            })
            .await
            .unwrap();
        let close = peer.next().await.unwrap().unwrap();
        assert_eq!(close.header.opcode, OpCode::Close);

        let (ack_tx, ack_rx) = oneshot::channel();
        cmd_tx
            .send(Command::Send {
                code: OpCode::Binary,
                payload: Bytes::from_static(b"late"),
                ack: Some(ack_tx),
            })
            .await
            .unwrap();
        assert!(matches!(ack_rx.await.unwrap(), Err(WsError::Closed)));

        // answering close completes the handshake
        peer.send(Frame::close(Some(close_code::NORMAL), ""))
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), Teardown::LocalClosed);
    }

    #[tokio::test]
    async fn unmasked_client_frame_fails_the_connection() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let framed = Framed::new(server, FrameCodec::server());
        // misbehaving peer writes server-style unmasked frames
        let mut peer = Framed::new(client, FrameCodec::server());
        let (_cmd_tx, cmd_rx) = mpsc::channel::<Command>(8);
        let (in_tx, _in_rx) = mpsc::channel(8);
        let opts = options::shared(options::Options {
            linger: Duration::from_millis(200),
            ..Default::default()
        });
        let task = tokio::spawn(run(framed, cmd_rx, in_tx, opts));

        peer.send(Frame::data(OpCode::Binary, Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(
            task.await.unwrap(),
            Teardown::Protocol {
                code: close_code::PROTOCOL
            }
        );
    }

    #[test]
    fn reconnect_policy_follows_the_close_code() {
        assert!(!Teardown::PeerClosed { code: Some(1000) }.forbids_reconnect());
        assert!(!Teardown::PeerClosed { code: None }.forbids_reconnect());
        assert!(!Teardown::Io.forbids_reconnect());
        assert!(Teardown::PeerClosed { code: Some(1009) }.forbids_reconnect());
        assert!(Teardown::PeerClosed { code: Some(1002) }.forbids_reconnect());
    }
}
