use aws_config::BehaviorVersion;
use tokio::select;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use voicestream_bridge::{app, config::Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let settings = Settings::new()?;
    let shared_config = aws_config::load_defaults(BehaviorVersion::latest()).await;

    select! {
        res = app(&shared_config, &settings) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            Ok(())
        },
    }
}
