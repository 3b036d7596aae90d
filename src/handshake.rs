use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::addr::WsAddr;
use crate::errors::WsError;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WS_VERSION: &str = "13";

/// refuse to buffer unbounded garbage while looking for the header end
const MAX_HEAD: usize = 8 * 1024;

/// outcome of a completed upgrade exchange
#[derive(Debug)]
pub struct Upgrade {
    /// bytes read past the header that belong to the frame stream
    pub remain: BytesMut,
    /// agreed subprotocol
    pub protocol: String,
    /// request resource path (the request target on the server side)
    pub resource: String,
}

fn gen_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// `Sec-WebSocket-Accept` value for a request key
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    BASE64.encode(sha1.finalize())
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|at| at + 4)
}

async fn read_head<S>(stream: &mut S) -> Result<(BytesMut, usize), WsError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = head_end(&buf) {
            return Ok((buf, end));
        }
        if buf.len() > MAX_HEAD {
            return Err(WsError::HandshakeFailed("oversized header".into()));
        }
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            return Err(WsError::HandshakeFailed(
                "connection closed during handshake".into(),
            ));
        }
    }
}

fn token_list_contains(value: &str, token: &str) -> bool {
    value.split(',').any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// perform the client half of the upgrade: send the GET, read and verify
/// the 101 response
pub async fn client_upgrade<S>(
    stream: &mut S,
    addr: &WsAddr,
    protocol: &str,
) -> Result<Upgrade, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = gen_key();
    let expected_accept = accept_key(&key);

    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri(addr.resource.as_str())
        .header("Host", addr.host_header())
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", &key)
        .header("Sec-WebSocket-Version", WS_VERSION)
        .header("Sec-WebSocket-Protocol", protocol)
        .body(())
        .expect("static request parts");
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v.to_str().unwrap_or_default()))
        .collect::<Vec<String>>()
        .join("\r\n");
    let text = format!(
        "{} {} {:?}\r\n{}\r\n\r\n",
        req.method(),
        addr.resource,
        req.version(),
        headers
    );
    stream.write_all(text.as_bytes()).await?;

    let (mut buf, end) = read_head(stream).await?;
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    resp.parse(&buf[..end])
        .map_err(|_| WsError::HandshakeFailed("malformed response".into()))?;
    if resp.code != Some(101) {
        return Err(WsError::HandshakeFailed(format!(
            "expected 101 response, got {:?} {:?}",
            resp.code, resp.reason
        )));
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut accept_ok = false;
    let mut echoed_protocol = None;
    for header in resp.headers.iter() {
        let value = std::str::from_utf8(header.value).unwrap_or_default();
        match header.name.to_ascii_lowercase().as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => connection_ok = token_list_contains(value, "upgrade"),
            "sec-websocket-accept" => accept_ok = value == expected_accept,
            "sec-websocket-protocol" => echoed_protocol = Some(value.to_string()),
            _ => {}
        }
    }
    if !upgrade_ok {
        return Err(WsError::HandshakeFailed("missing upgrade header".into()));
    }
    if !connection_ok {
        return Err(WsError::HandshakeFailed("missing connection header".into()));
    }
    if !accept_ok {
        return Err(WsError::HandshakeFailed("sec-websocket-accept mismatch".into()));
    }
    let echoed = match echoed_protocol {
        Some(p) if p == protocol => p,
        Some(p) => {
            return Err(WsError::HandshakeFailed(format!(
                "server picked unrequested subprotocol {p}"
            )))
        }
        None => return Err(WsError::HandshakeFailed("subprotocol not echoed".into())),
    };

    tracing::debug!("client handshake complete");
    let remain = buf.split_off(end);
    Ok(Upgrade {
        remain,
        protocol: echoed,
        resource: addr.resource.clone(),
    })
}

/// perform the server half of the upgrade: read and validate the GET,
/// reply 101 (or the appropriate 4xx on failure)
pub async fn server_upgrade<S>(stream: &mut S, protocol: &str) -> Result<Upgrade, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut buf, end) = read_head(stream).await?;
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    if req.parse(&buf[..end]).is_err() {
        return refuse(stream, "HTTP/1.1 400 Bad Request\r\n\r\nmalformed request").await;
    }
    if req.method != Some("GET") || req.version != Some(1) {
        return refuse(stream, "HTTP/1.1 400 Bad Request\r\n\r\nexpected HTTP/1.1 GET").await;
    }

    let mut host_seen = false;
    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut key = String::new();
    let mut version = None;
    let mut protocol_ok = false;
    for header in req.headers.iter() {
        let value = std::str::from_utf8(header.value).unwrap_or_default();
        match header.name.to_ascii_lowercase().as_str() {
            "host" => host_seen = !value.is_empty(),
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => connection_ok = token_list_contains(value, "upgrade"),
            "sec-websocket-key" => key = value.to_string(),
            "sec-websocket-version" => version = Some(value.to_string()),
            "sec-websocket-protocol" => protocol_ok = token_list_contains(value, protocol),
            _ => {}
        }
    }

    match version.as_deref() {
        Some(WS_VERSION) => {}
        _ => {
            let reply = format!(
                "HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: {WS_VERSION}\r\n\r\n"
            );
            return refuse(stream, &reply).await;
        }
    }
    if !host_seen || !upgrade_ok || !connection_ok {
        return refuse(
            stream,
            "HTTP/1.1 400 Bad Request\r\n\r\nmissing upgrade, connection or host header",
        )
        .await;
    }
    if key.is_empty() {
        return refuse(
            stream,
            "HTTP/1.1 400 Bad Request\r\n\r\nmissing sec-websocket-key or key is empty",
        )
        .await;
    }
    if !protocol_ok {
        return refuse(
            stream,
            "HTTP/1.1 400 Bad Request\r\n\r\nunsupported subprotocol",
        )
        .await;
    }

    let resource = req.path.unwrap_or("/").to_string();
    let resp = http::Response::builder()
        .status(http::StatusCode::SWITCHING_PROTOCOLS)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(&key))
        .header("Sec-WebSocket-Protocol", protocol)
        .body(())
        .expect("static response parts");
    let mut resp_lines = vec![format!("{:?} {}", resp.version(), resp.status())];
    resp.headers().iter().for_each(|(k, v)| {
        resp_lines.push(format!("{}: {}", k, v.to_str().unwrap_or_default()))
    });
    resp_lines.push("\r\n".to_string());
    stream.write_all(resp_lines.join("\r\n").as_bytes()).await?;

    tracing::debug!(resource = %resource, "server handshake complete");
    let remain = buf.split_off(end);
    Ok(Upgrade {
        remain,
        protocol: protocol.to_string(),
        resource,
    })
}

async fn refuse<S>(stream: &mut S, reply: &str) -> Result<Upgrade, WsError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(reply.as_bytes()).await?;
    let reason = reply.lines().next().unwrap_or_default().to_string();
    Err(WsError::HandshakeFailed(reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AddrKind;

    fn test_addr() -> WsAddr {
        WsAddr::parse("ws://127.0.0.1:5555", AddrKind::Connect).unwrap()
    }

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn upgrade_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let addr = test_addr();
        let (c, s) = tokio::join!(
            client_upgrade(&mut client, &addr, "pair.sp.nanomsg.org"),
            server_upgrade(&mut server, "pair.sp.nanomsg.org"),
        );
        let c = c.expect("client side");
        let s = s.expect("server side");
        assert_eq!(c.protocol, "pair.sp.nanomsg.org");
        assert_eq!(s.protocol, "pair.sp.nanomsg.org");
        assert_eq!(s.resource, "/");
        assert!(c.remain.is_empty());
        assert!(s.remain.is_empty());
    }

    #[tokio::test]
    async fn server_refuses_subprotocol_mismatch() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let addr = test_addr();
        let (c, s) = tokio::join!(
            client_upgrade(&mut client, &addr, "pair.sp.nanomsg.org"),
            server_upgrade(&mut server, "reqrep.sp.nanomsg.org"),
        );
        assert!(matches!(s, Err(WsError::HandshakeFailed(_))));
        assert!(c.is_err());
    }

    #[tokio::test]
    async fn server_refuses_missing_upgrade_header() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = "GET / HTTP/1.1\r\nHost: x\r\nSec-WebSocket-Key: AQIDBAUGBwgJCgsMDQ4PEA==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let (_, s) = tokio::join!(
            async {
                client.write_all(request.as_bytes()).await.unwrap();
                let mut reply = vec![0u8; 256];
                let n = client.read(&mut reply).await.unwrap();
                let reply = String::from_utf8_lossy(&reply[..n]).to_string();
                assert!(reply.starts_with("HTTP/1.1 400"), "got {reply}");
            },
            server_upgrade(&mut server, "pair.sp.nanomsg.org"),
        );
        assert!(s.is_err());
    }

    #[tokio::test]
    async fn server_refuses_wrong_version() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = "GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: AQIDBAUGBwgJCgsMDQ4PEA==\r\nSec-WebSocket-Version: 8\r\nSec-WebSocket-Protocol: pair.sp.nanomsg.org\r\n\r\n";
        let (_, s) = tokio::join!(
            async {
                client.write_all(request.as_bytes()).await.unwrap();
                let mut reply = vec![0u8; 256];
                let n = client.read(&mut reply).await.unwrap();
                let reply = String::from_utf8_lossy(&reply[..n]).to_string();
                assert!(reply.starts_with("HTTP/1.1 426"), "got {reply}");
                assert!(reply.contains("Sec-WebSocket-Version: 13"));
            },
            server_upgrade(&mut server, "pair.sp.nanomsg.org"),
        );
        assert!(s.is_err());
    }

    #[tokio::test]
    async fn client_rejects_bad_accept_key() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let addr = test_addr();
        let (c, _) = tokio::join!(
            client_upgrade(&mut client, &addr, "pair.sp.nanomsg.org"),
            async {
                let mut req = vec![0u8; 2048];
                let _ = server.read(&mut req).await.unwrap();
                let reply = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\nSec-WebSocket-Protocol: pair.sp.nanomsg.org\r\n\r\n";
                server.write_all(reply.as_bytes()).await.unwrap();
            },
        );
        assert!(matches!(c, Err(WsError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn leftover_bytes_are_returned() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let (c, _) = tokio::join!(server_upgrade(&mut server, "pair.sp.nanomsg.org"), async {
            let key = "AQIDBAUGBwgJCgsMDQ4PEA==";
            let request = format!(
                "GET /chat HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: pair.sp.nanomsg.org\r\n\r\n"
            );
            let mut bytes = request.into_bytes();
            bytes.extend_from_slice(&[0x82, 0x80, 1, 2, 3, 4]);
            client.write_all(&bytes).await.unwrap();
            let mut reply = vec![0u8; 2048];
            let _ = client.read(&mut reply).await.unwrap();
        });
        let up = c.expect("handshake");
        assert_eq!(up.resource, "/chat");
        assert_eq!(&up.remain[..], &[0x82, 0x80, 1, 2, 3, 4]);
    }
}
