pub mod audit;
pub mod list;
pub mod register;
pub mod remove;
pub mod stats;

use sf_daemon::Daemon;

/// Administrative commands operate on the persisted fleet.
async fn restore(daemon: &Daemon) -> anyhow::Result<usize> {
    Ok(daemon.manager().load_persisted().await?)
}
