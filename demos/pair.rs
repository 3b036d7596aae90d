use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_pair::PairSocket;

/// both halves of a pair conversation in one process
#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001".to_string());

    let server = PairSocket::new();
    server.bind(&address).expect("bind");
    let client = PairSocket::new();
    client.connect(&address).expect("connect");

    for i in 0..10 {
        client.send(format!("ping {i}")).await.expect("send");
        let message = server.recv().await.expect("recv");
        tracing::info!("server got {:?}", message.as_text());

        server.send(format!("pong {i}")).await.expect("send");
        let message = client.recv().await.expect("recv");
        tracing::info!("client got {:?}", message.as_text());
    }

    client.close().await;
    server.close().await;
}
