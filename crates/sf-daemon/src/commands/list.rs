use sf_daemon::Daemon;

pub async fn run(daemon: &Daemon, json: bool) -> anyhow::Result<()> {
    super::restore(daemon).await?;
    let instances = daemon.manager().list().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }
    if instances.is_empty() {
        println!("no instances registered");
        return Ok(());
    }
    println!("{:<36}  {:<12}  NAME", "ID", "STATUS");
    for inst in &instances {
        println!("{:<36}  {:<12}  {}", inst.id, inst.status.as_str(), inst.name);
    }
    Ok(())
}
