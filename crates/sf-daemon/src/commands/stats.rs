use sf_daemon::Daemon;

pub async fn run(daemon: &Daemon, json: bool) -> anyhow::Result<()> {
    let stats = daemon.repository().statistics().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("instances:         {}", stats.total_instances);
    println!("assistant enabled: {}", stats.assistant_enabled);
    println!("channels:          {}", stats.total_channels);
    for (status, count) in &stats.by_status {
        println!("  {status:<12} {count}");
    }
    Ok(())
}
