pub mod app;
pub mod config;
pub mod dialer;
pub mod forward;
pub mod lifecycle;
pub mod logging;
pub mod net;
pub mod relay;
pub mod shutdown;
pub mod telemetry;
pub mod tls;
pub mod tunnel;

pub async fn run(cfg: config::Config) -> anyhow::Result<()> {
    app::run(cfg).await
}
