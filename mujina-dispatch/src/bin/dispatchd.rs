use mujina_dispatch::config::Config;
use mujina_dispatch::daemon::Daemon;
use mujina_dispatch::tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    tracing::init_journald_or_stdout(tracing::level_from_name(&config.daemon.log_level));

    Daemon::new(config).run().await
}
