use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "slideshow-relay", version, about = "Slideshow event relay")]
struct Args {
    /// Address to listen on
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0:7878")]
    bind: String,
    /// Lines a client may fall behind before it starts losing them
    #[arg(long, default_value_t = 256)]
    capacity: usize,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("slideshow_relay={level},info"))),
        )
        .with_target(false)
        .compact()
        .init();

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    slideshow_relay::serve(listener, args.capacity, cancel).await
}
