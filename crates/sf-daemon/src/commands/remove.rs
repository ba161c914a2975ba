use sf_daemon::Daemon;
use uuid::Uuid;

pub async fn run(daemon: &Daemon, id: Uuid) -> anyhow::Result<()> {
    super::restore(daemon).await?;
    if daemon.manager().unregister(id).await? {
        println!("removed {id}");
    } else {
        anyhow::bail!("no instance with id {id}");
    }
    Ok(())
}
