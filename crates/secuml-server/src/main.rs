//! secuml-server: start the SecuML web server.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use secuml_server::{bootstrap, serve, ServerConfig};

#[derive(Parser)]
#[command(name = "secuml-server", about = "SecuML web server", version)]
struct Cli {
    /// Path to the SecuML configuration file (defaults to $SECUMLCONF, then ./secuml.yaml)
    #[arg(long = "secuml-conf")]
    secuml_conf: Option<PathBuf>,
    /// Record the user actions performed in the web UI
    #[arg(long)]
    user_exp: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let ctx = bootstrap(cli.secuml_conf.as_deref(), cli.user_exp)?;
    let config = ServerConfig::default();

    println!("SecuML server");
    println!("   Store:       {}", ctx.store().descriptor());
    println!("   Input data:  {}", ctx.configuration().input_data_dir().display());
    println!("   URL:         http://{}:{}", config.host, config.port);
    if ctx.user_action_logging() {
        println!("   User actions: recorded");
    }
    println!();

    serve(ctx, config).await
}
