use std::{net::TcpListener, sync::Arc, time::Duration};

use anyhow::Context;
use env_logger::Env;
use harvester::{
    configuration::{get_configuration, StorageSettings},
    dal::{JsonLeadStore, PgLeadStore},
    services::{DroidManager, Harvester, LeadStore, RunRegistry},
    startup::run,
};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let configuration = get_configuration().context("Failed to read configuration.")?;
    let profile = configuration
        .directory
        .profile()
        .map_err(anyhow::Error::msg)?;
    log::info!("Using selector profile {}", profile.name);

    let store: Arc<dyn LeadStore> = match &configuration.storage {
        StorageSettings::Json { path } => {
            log::info!("Persisting leads to {}", path.display());
            Arc::new(JsonLeadStore::new(path.clone()))
        }
        StorageSettings::Postgres(database) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(15 * 60)) // 15 minutes
                .connect_lazy_with(database.with_db());
            let store = PgLeadStore::new(pool);
            store.migrate().await?;
            log::info!("Persisting leads to postgres database {}", database.database_name);
            Arc::new(store)
        }
    };

    let harvester = Harvester::new(
        Arc::new(DroidManager::new(configuration.webdriver.clone())),
        store,
        configuration.directory.directory(),
        profile,
        configuration.harvest.scheduler_options(),
    );
    let registry = RunRegistry::new(Arc::new(harvester));

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener =
        TcpListener::bind(&address).with_context(|| format!("Failed to bind {}", address))?;
    log::info!("Listening on {}", address);

    run(listener, registry)?.await?;
    Ok(())
}
