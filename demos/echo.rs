use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_pair::PairSocket;

/// echo server: binds a pair socket and sends every message back under
/// the opcode it arrived with
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9000".to_string());
    let server = PairSocket::new();
    server.bind(&address).expect("bind");
    tracing::info!("echoing on {address}");

    loop {
        match server.recv().await {
            Ok(message) => {
                tracing::info!(len = message.data.len(), code = ?message.code, "echo");
                if let Err(e) = server.send_msg(message.data, message.code).await {
                    tracing::warn!("send failed: {e}");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("recv failed: {e}");
                break;
            }
        }
    }
}
