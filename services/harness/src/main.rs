// Harness entry point.
use anyhow::{Context, Result};
use clap::Parser;
use lossprobe_harness::config::HarnessConfig;

#[derive(Parser, Debug)]
#[command(name = "lossprobe")]
#[command(about = "Publishes synthetic messages, reads them back and reports what was lost")]
struct Args {
    /// YAML file patching the environment configuration
    #[arg(long)]
    config: Option<String>,

    /// Namespace for remote tracking keys
    #[arg(long, env = "LOSSPROBE_RUN_ID")]
    run_id: Option<String>,
}

impl Args {
    fn load_config(&self) -> Result<HarnessConfig> {
        let mut config = HarnessConfig::from_env_or_yaml()?;
        if let Some(path) = &self.config {
            config
                .apply_yaml_file(path)
                .with_context(|| format!("apply --config {path}"))?;
        }
        if let Some(run_id) = &self.run_id {
            config.store.run_id = run_id.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse().load_config()?;
    lossprobe_harness::run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}
