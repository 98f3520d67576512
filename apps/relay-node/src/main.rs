use anyhow::Result;
use relay_node::{NodeConfig, run};
use relay_telemetry::{install as init_telemetry, shutdown_telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry("relay-node", env!("CARGO_PKG_VERSION"))?;

    let config = NodeConfig::from_env()?;
    let result = run(config).await;
    shutdown_telemetry();
    result
}
