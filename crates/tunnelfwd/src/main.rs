mod tunnelfwd;

use clap::{CommandFactory, Parser, error::ErrorKind};

#[derive(Debug, Parser)]
#[command(
    name = "tunnelfwd",
    version,
    about = "tunnelfwd - forward tunneled connections to a local service"
)]
struct Cli {
    /// Path to a config file (.toml/.yaml/.yml). Flags given on the command line override its values.
    #[arg(long, env = "TUNNELFWD_CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(flatten)]
    flags: tunnelfwd::config::Flags,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = match tunnelfwd::config::load(cli.config.as_deref(), &cli.flags) {
        Ok(cfg) => cfg,
        Err(err) => Cli::command()
            .error(ErrorKind::ValueValidation, format!("{err:#}"))
            .exit(),
    };
    tunnelfwd::run(cfg).await
}
