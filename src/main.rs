use idlegate::config::Config;
use idlegate::http::handler::Hello;
use idlegate::server::listener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let server = listener::start(&cfg, Hello)?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    server.shutdown();
    tokio::task::spawn_blocking(move || server.join()).await??;

    Ok(())
}
