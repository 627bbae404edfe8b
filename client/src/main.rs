use std::time::Duration;
use swiftwire_client::HandshakeInitiator;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    const LOG_ENV: &str = "RUST_LOG";
    use std::str::FromStr;
    use tracing::Level;
    use tracing_subscriber::EnvFilter;

    let filter = std::env::var(LOG_ENV)
        .map(|env| {
            EnvFilter::from_str(env.as_str())
                .unwrap_or_else(|err| panic!("invalid `{}` environment variable {}", LOG_ENV, err))
        })
        .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_owned());
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => swiftwire::PORT,
    };
    let client_id: u64 = match args.next() {
        Some(client_id) => client_id.parse()?,
        None => 42,
    };

    let mut initiator = HandshakeInitiator::new();
    let result: Result<_, swiftwire_client::Error> = async {
        initiator.connect(&host, port, CONNECT_TIMEOUT).await?;
        initiator.handshake(client_id, HANDSHAKE_TIMEOUT).await
    }
    .await;
    initiator.close().await;

    let (id, status) = result?;
    tracing::info!(id, status, "HELLO_ACK");
    Ok(())
}
