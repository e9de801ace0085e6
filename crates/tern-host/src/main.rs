use clap::Parser;
use tracing_subscriber::EnvFilter;

use tern_host::{AttachArgs, DebuggerEvent, DebuggerHost};

/// Headless Tern debugger host.
///
/// Attaches to a JDWP-enabled JVM hosting Nashorn scripts and logs the
/// debugger event stream. The DevTools-facing WebSocket frontend connects on
/// top of the same host API; this binary exists for smoke-testing an
/// attachment without one.
#[derive(Debug, Parser)]
#[command(name = "tern-host", version, about)]
struct Cli {
    /// Debug target, host:port. The target must run with a JDWP agent
    /// (server=y,suspend=n).
    #[arg(long, default_value = "localhost:7777")]
    connect: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let (host, port) = parse_connect(&cli.connect)?;

    let debugger = DebuggerHost::attach(AttachArgs { host, port }).await?;
    let mut events = debugger.events();

    loop {
        match events.next().await {
            Some(Ok(event)) => log_event(&event),
            Some(Err(error)) => {
                tracing::error!(target = "tern.host", %error, "event bus failed");
                std::process::exit(2);
            }
            None => {
                tracing::info!(target = "tern.host", "target disconnected");
                return Ok(());
            }
        }
    }
}

fn parse_connect(connect: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = connect
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("--connect wants host:port, got {connect}"))?;
    Ok((host.to_string(), port.parse()?))
}

fn log_event(event: &DebuggerEvent) {
    match event {
        DebuggerEvent::ScriptAdded(script) => {
            tracing::info!(target = "tern.host", url = %script.url(), id = %script.id(), "script added");
        }
        DebuggerEvent::HitBreakpoint(frames) => {
            let top = frames.first();
            tracing::info!(
                target = "tern.host",
                frames = frames.len(),
                url = top.map(|f| f.url.to_string()).unwrap_or_default(),
                line = top.map(|f| f.location.line).unwrap_or(0),
                "paused"
            );
        }
        DebuggerEvent::Resumed => {
            tracing::info!(target = "tern.host", "resumed");
        }
        DebuggerEvent::UncaughtError(error) => {
            tracing::warn!(target = "tern.host", name = %error.name, message = %error.message, "uncaught script error");
        }
        DebuggerEvent::InitialInitializationComplete => {
            tracing::info!(target = "tern.host", "initialization complete");
        }
    }
}
