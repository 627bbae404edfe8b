use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use swiftwire_server::{Listener, ServerConfig};

const CONFIG_ENV: &str = "SWIFTWIRE_CONFIG";

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

fn load_config() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let config = match std::env::var(CONFIG_ENV) {
        Ok(path) => {
            tracing::info!(%path, "Loading config");
            ServerConfig::from_json_file(path)?
        }
        Err(_) => ServerConfig::default(),
    };
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let config = load_config()?;

    let mut args = std::env::args().skip(1);
    let host = match args.next() {
        Some(host) => host.parse()?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let port = match args.next() {
        Some(port) => port.parse()?,
        None => swiftwire::PORT,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(serve(SocketAddr::new(host, port), config))
}

async fn serve(addr: SocketAddr, config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let threads = config.threads;
    let listener = Listener::bind(addr, config).await?;
    tracing::info!(threads, "Starting server");
    tokio::select! {
        () = listener.run() => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutting down");
        }
    }
    Ok(())
}
