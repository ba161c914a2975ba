use anyhow::Context;
use sf_core::types::{AssistantSettings, InstanceSpec};
use sf_daemon::Daemon;

pub async fn run(
    daemon: &Daemon,
    name: String,
    token_env: &str,
    channels: Vec<String>,
    model: Option<String>,
    rate_limit: Option<u32>,
) -> anyhow::Result<()> {
    let token = std::env::var(token_env)
        .with_context(|| format!("environment variable {token_env} is not set"))?;
    super::restore(daemon).await?;

    let mut spec = InstanceSpec::new(name, token).with_channels(channels);
    if let Some(model) = model {
        spec = spec.with_assistant(AssistantSettings::new(model));
    }
    if let Some(per_minute) = rate_limit {
        spec = spec.with_rate_limit(per_minute);
    }

    let id = daemon.manager().register(spec).await?;
    println!("{id}");
    Ok(())
}
