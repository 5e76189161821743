// review-bridge/src/main.rs

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use review_bridge::{
    app::App,
    config::{Config, ConfigManager},
    http,
    lockfile::{new_auth_token, LockFile, LockInfo},
    nvim_rpc::NvimConnection,
};

#[derive(Parser, Debug)]
#[command(name = "review-bridge", version, about = "Neovim review surface for terminal coding agents")]
struct Args {
    /// Editor RPC socket: a unix socket path or host:port
    #[arg(long, env = "NVIM")]
    socket: Option<String>,
    /// Listen port on 127.0.0.1 (0 picks a free one)
    #[arg(long)]
    port: Option<u16>,
    /// Workspace root reported to agents (defaults to the current directory)
    #[arg(long)]
    workspace: Option<PathBuf>,
    /// Display name written to the lock file
    #[arg(long)]
    ide_name: Option<String>,
}

impl Args {
    fn overlay(&self) -> Config {
        let mut cfg = Config::default();
        cfg.editor.socket = self.socket.clone();
        cfg.server.port = self.port;
        cfg.server.ide_name = self.ide_name.clone();
        cfg
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let workspace = match &args.workspace {
        Some(w) => w.clone(),
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let manager = ConfigManager::load(&workspace)?;
    manager.apply_runtime_overlay(args.overlay())?;
    let cfg = manager.get();

    let Some(socket) = cfg.editor.socket.clone() else {
        bail!("no editor socket: pass --socket or run inside Neovim (NVIM)");
    };
    let conn = NvimConnection::connect(&socket, cfg.request_timeout())
        .await
        .with_context(|| format!("connecting to editor at {socket}"))?;

    let app = App::build(Arc::new(conn.clone()), &cfg, &workspace).await?;

    let listener = TcpListener::bind(("127.0.0.1", cfg.port())).await.context("binding listen port")?;
    let port = listener.local_addr()?.port();
    let token = new_auth_token();
    let lock = match cfg.lock_dir() {
        Some(dir) => Some(LockFile::write(&dir, port, &LockInfo::new(&workspace, cfg.ide_name(), token.clone()))?),
        None => {
            warn!("no home directory; agents will not discover this instance");
            None
        }
    };
    info!(port, "listening on http://127.0.0.1:{port}/mcp");

    let router = app.router.clone();
    let editor = conn.clone();
    let shutdown = async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!(error = %e, "ctrl-c handler failed");
                }
                info!("interrupted, shutting down");
            }
            _ = editor.closed() => warn!("editor connection closed, shutting down"),
        }
        // Open push streams would otherwise hold graceful shutdown forever.
        router.close_all();
    };

    http::serve(listener, http::routes(app.router.clone(), token), shutdown).await.context("http server")?;

    app.shutdown().await;
    drop(lock);
    Ok(())
}
