use sf_daemon::Daemon;

pub async fn run(daemon: &Daemon) -> anyhow::Result<()> {
    super::restore(daemon).await?;
    let audit = daemon.manager().audit_credentials().await;

    for entry in &audit {
        let note = if entry.disabled { "  (disabled)" } else { "" };
        println!(
            "{:<36}  {:<9}  {}{note}",
            entry.id,
            format!("{:?}", entry.integrity).to_lowercase(),
            entry.name
        );
    }
    let bad = audit
        .iter()
        .filter(|a| a.integrity != sf_core::crypto::IntegrityStatus::Valid)
        .count();
    println!("{} credentials checked, {bad} need attention", audit.len());
    Ok(())
}
