use std::sync::Arc;

use anyhow::Context;
use dmarc_analyzer::config::Config;
use dmarc_analyzer::forward::SmtpRelay;
use dmarc_analyzer::observation::TracingSink;
use dmarc_analyzer::server::Server;
use dmarc_analyzer::session::{Backend, Fallback};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    eprintln!("📬 DMARC Analyzer v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: {} ({})", config.listener.addr, config.listener.domain);
    eprintln!(
        "   Fallback: {} via {}:{}",
        config.forwarder.to.join(", "),
        config.forwarder.host,
        config.forwarder.port
    );

    // ── Fallback relay ────────────────────────────────────────────────
    let relay = SmtpRelay::new(&config.forwarder).context("Failed to configure fallback relay")?;
    let backend = Arc::new(Backend::new(Arc::new(TracingSink)).with_fallback(Fallback {
        from: config.forwarder.from.clone(),
        to: config.forwarder.to.clone(),
        sink: Arc::new(relay),
    }));

    // ── Listener ──────────────────────────────────────────────────────
    let server = Server::bind(config.listener, backend)
        .await
        .context("Failed to bind SMTP listener")?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(err = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
