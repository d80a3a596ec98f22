use anyhow::{Context, Result};
use clap::Parser;
use dirsyncd::config::{Config, Role};
use dirsyncd::{logging, receiver, sender};
use tokio::runtime::Builder;

fn main() -> Result<()> {
    let config = Config::parse();
    logging::init(config.log_level()).context("set log verbosity")?;

    let role = config.validate().context("validate configuration")?;

    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        match role {
            Role::Sender { host, source } => {
                sender::run(&host, &source, config.port(), config.sparse(), config.one_shot())
                    .await
            }
            Role::Receiver { target } => receiver::run(target, config.port()).await,
        }
    })
    .context("run")?;

    Ok(())
}
