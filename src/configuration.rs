use std::{path::PathBuf, time::Duration};

use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;
use sqlx::postgres::{PgConnectOptions, PgSslMode};

use crate::services::{
    ExtractionOptions, MapsDirectory, PaginationOptions, PersistenceOptions, SchedulerOptions,
    SelectorProfile,
};

#[derive(Deserialize, Clone, Debug)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub webdriver: WebDriverSettings,
    pub directory: DirectorySettings,
    pub harvest: HarvestSettings,
    pub storage: StorageSettings,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ApplicationSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
}

#[derive(Deserialize, Clone, Debug)]
pub struct WebDriverSettings {
    pub url: String,
    pub headless: bool,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub window_width: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub window_height: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub acquire_attempts: u8,
}

#[derive(Deserialize, Clone, Debug)]
pub struct DirectorySettings {
    pub base_url: String,
    pub selector_profile: String,
}

impl DirectorySettings {
    pub fn directory(&self) -> MapsDirectory {
        MapsDirectory::new(&self.base_url)
    }

    pub fn profile(&self) -> Result<SelectorProfile, String> {
        SelectorProfile::by_name(&self.selector_profile)
            .ok_or_else(|| format!("Unknown selector profile: {}", self.selector_profile))
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct HarvestSettings {
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub workers: usize,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub results_timeout_secs: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub heading_timeout_secs: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub heading_text_timeout_secs: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub poll_interval_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub settle_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub settle_jitter_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub confirm_settle_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_scroll_rounds: u32,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub max_scroll_secs: u64,
    pub max_links_per_task: Option<usize>,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub detail_delay_min_ms: u64,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub detail_delay_max_ms: u64,
    pub require_subject_in_name: bool,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub persist_attempts: u8,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub persist_backoff_ms: u64,
}

impl HarvestSettings {
    pub fn pagination_options(&self) -> PaginationOptions {
        PaginationOptions {
            results_timeout: Duration::from_secs(self.results_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            settle: Duration::from_millis(self.settle_ms),
            settle_jitter: Duration::from_millis(self.settle_jitter_ms),
            confirm_settle: Duration::from_millis(self.confirm_settle_ms),
            max_scroll_rounds: self.max_scroll_rounds,
            max_scroll_duration: Duration::from_secs(self.max_scroll_secs),
            max_links_per_task: self.max_links_per_task,
        }
    }

    pub fn extraction_options(&self) -> ExtractionOptions {
        ExtractionOptions {
            heading_timeout: Duration::from_secs(self.heading_timeout_secs),
            heading_text_timeout: Duration::from_secs(self.heading_text_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn persistence_options(&self) -> PersistenceOptions {
        PersistenceOptions {
            attempts: self.persist_attempts.max(2),
            backoff: Duration::from_millis(self.persist_backoff_ms),
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            workers: self.workers.max(1),
            detail_delay_min: Duration::from_millis(self.detail_delay_min_ms),
            detail_delay_max: Duration::from_millis(self.detail_delay_max_ms),
            require_subject_in_name: self.require_subject_in_name,
            pagination: self.pagination_options(),
            extraction: self.extraction_options(),
            persistence: self.persistence_options(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageSettings {
    Json { path: PathBuf },
    Postgres(DatabaseSettings),
}

#[derive(Deserialize, Clone, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: String,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub port: u16,
    pub host: String,
    pub database_name: String,
    pub require_ssl: bool,
}

impl DatabaseSettings {
    pub fn without_db(&self) -> PgConnectOptions {
        let ssl_mode = match self.require_ssl {
            true => PgSslMode::Require,
            false => PgSslMode::Prefer,
        };
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(&self.password)
            .port(self.port)
            .ssl_mode(ssl_mode)
    }

    pub fn with_db(&self) -> PgConnectOptions {
        self.without_db().database(&self.database_name)
    }
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;
    let environment_filename = format!("{}.yaml", environment.as_str());

    let settings = config::Config::builder()
        .add_source(config::File::from(configuration_directory.join("base.yaml")))
        .add_source(
            config::File::from(configuration_directory.join(environment_filename)).required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<Settings>()
}
