// filerpc: serve and call RPC endpoints that live in synchronized datasite directories.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use filerpc_core::{
    handler_fn, Address, Call, Context, HandlerError, Runtime, RpcError, SendOptions,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "filerpc", version, about)]
struct Cli {
    /// Config file (default: ~/.config/filerpc/config.toml, then /etc/filerpc/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve an application's endpoints until interrupted. Exposes a built-in `ping`.
    Serve {
        #[arg(long)]
        app: String,
    },
    /// Send one request and print the response.
    Call {
        /// syft://<identity>/api_data/<app>/rpc/<endpoint>
        url: String,
        #[arg(long, default_value = "call")]
        method: String,
        #[arg(long, default_value = "")]
        body: String,
        /// Seconds to wait for the response.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        /// Request lifetime in seconds (config default when omitted).
        #[arg(long)]
        expiry: Option<u64>,
        /// Reuse an identical in-flight call.
        #[arg(long)]
        cache: bool,
    },
    /// Show effective rights on a path.
    Perms {
        path: PathBuf,
        /// Principal to evaluate (defaults to the configured identity).
        #[arg(long)]
        principal: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;
    init_logging(&cfg.log);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Command::Serve { app } => serve(&cfg, &app).await,
            Command::Call {
                url,
                method,
                body,
                timeout,
                expiry,
                cache,
            } => {
                let options = SendOptions {
                    expiry: expiry.map(Duration::from_secs),
                    cache,
                };
                call(&cfg, &url, &method, body, Duration::from_secs(timeout), options).await
            }
            Command::Perms { path, principal } => perms(&cfg, &path, principal),
        }
    })
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(cfg: &config::Config, app: &str) -> anyhow::Result<()> {
    let runtime = Runtime::new(cfg.runtime_config()?);
    let mut server = runtime.server(app)?;
    server.register(
        "ping",
        handler_fn(|body: String, _ctx: Context| async move {
            Ok::<_, HandlerError>(format!("pong:{body}"))
        }),
    )?;
    let handle = server.start()?;
    tracing::info!(rpc_dir = %handle.rpc_dir().display(), "serving; Ctrl+C to stop");
    shutdown_signal().await?;
    handle.stop().await?;
    Ok(())
}

async fn call(
    cfg: &config::Config,
    url: &str,
    method: &str,
    body: String,
    timeout: Duration,
    options: SendOptions,
) -> anyhow::Result<()> {
    let runtime = Runtime::new(cfg.runtime_config()?);
    let url = Address::parse(url)?;
    let future = runtime
        .client()
        .send(Call::new(url, method).body(body), options)?;
    tracing::debug!(id = %future.id(), path = %future.request_path().display(), "request written");

    let response = match future.wait(timeout).await {
        Ok(response) => response,
        Err(RpcError::Timeout(_)) => {
            anyhow::bail!("no response to {} within {timeout:?}", future.id())
        }
        Err(e) => return Err(e.into()),
    };
    println!("{response}");
    response
        .error_for_status()
        .context("remote endpoint returned an error")?;
    Ok(())
}

fn perms(
    cfg: &config::Config,
    path: &std::path::Path,
    principal: Option<String>,
) -> anyhow::Result<()> {
    let principal = match principal.or_else(|| cfg.email.clone()) {
        Some(p) => p,
        None => anyhow::bail!("no principal given and no identity configured"),
    };
    let datasites = filerpc_core::Datasites::new(&cfg.datasites);
    let rights = filerpc_core::PermissionEngine::new(datasites.clone()).compute(path, &principal);
    match datasites.address_of(path) {
        Some(address) => println!("{principal} {rights} {address}"),
        None => println!("{principal} {rights} {}", path.display()),
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_call() {
        let cli = Cli::try_parse_from([
            "filerpc",
            "call",
            "syft://bob@x/api_data/chat/rpc/ping",
            "--body",
            "hello",
            "--cache",
        ])
        .unwrap();
        match cli.command {
            Command::Call {
                url, body, cache, timeout, ..
            } => {
                assert_eq!(url, "syft://bob@x/api_data/chat/rpc/ping");
                assert_eq!(body, "hello");
                assert!(cache);
                assert_eq!(timeout, 30);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
