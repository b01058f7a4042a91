//! Panel server command — `deckhand serve`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Args;

use deckhand::config::PanelConfig;

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Port to listen on (overrides config and PORT)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Workspace directory the deployed program runs in
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Serve static files from this directory for unmatched routes
    #[arg(long)]
    pub public_dir: Option<PathBuf>,

    /// Allow cross-origin requests from any origin
    #[arg(long)]
    pub cors: bool,
}

impl ServeArgs {
    /// Apply flags on top of the file and environment layers.
    pub fn apply(&self, config: &mut PanelConfig) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(workspace) = &self.workspace {
            config.workspace.root = workspace.clone();
        }
        if let Some(public_dir) = &self.public_dir {
            config.server.public_dir = Some(public_dir.clone());
        }
        if self.cors {
            config.server.permissive_cors = true;
        }
    }
}

pub async fn cmd_serve(config_path: &Path, args: &ServeArgs) -> Result<()> {
    let mut config = PanelConfig::load_or_default(config_path)?;
    config.apply_env();
    args.apply(&mut config);
    config.ensure_valid()?;

    deckhand::panel::server::start_server(config).await
}
