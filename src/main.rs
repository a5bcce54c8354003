use clap::Parser;
use janus_client::Session;
use janus_signal::{
    app,
    config::{Cli, ClientConfig, load_env_file},
    logger::init_tracing,
};
use tokio::signal;
use tracing::{error, info};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let env_file = load_env_file();
    let config = ClientConfig::try_from(Cli::parse())?;
    init_tracing(&config.log)?;
    if let Some(path) = env_file {
        info!("Loaded .env from {}", path.display());
    }

    let mut session = Session::with_config(config.root(), config.session);

    let outcome = tokio::select! {
        res = app::run(&config, &mut session) => res.map(|_| ()),
        _ = signal::ctrl_c() => {
            info!("interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(err) = session.destroy().await {
        error!(error = %err, "session teardown was incomplete");
    }

    if let Err(err) = &outcome {
        error!(error = ?err, "janus-signal failed");
    }
    outcome
}
