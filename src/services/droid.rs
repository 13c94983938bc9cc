use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use thirtyfour::{error::WebDriverError, prelude::*, ChromiumLikeCapabilities};
use thiserror::Error;

use crate::{configuration::WebDriverSettings, error::HarvestError};

const ACQUIRE_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PageError {
    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Script failed: {0}")]
    Script(String),

    #[error("Driver error: {0}")]
    Driver(String),
}

impl From<WebDriverError> for PageError {
    fn from(err: WebDriverError) -> Self {
        PageError::Driver(err.to_string())
    }
}

/// One isolated browsing context, driven by exactly one worker.
#[async_trait]
pub trait BrowserSession: Send {
    async fn goto(&mut self, url: &str) -> Result<(), PageError>;
    async fn current_url(&mut self) -> Result<String, PageError>;
    async fn source(&mut self) -> Result<String, PageError>;
    async fn exists(&mut self, css: &str) -> Result<bool, PageError>;
    /// Returns false when no element matches `css`.
    async fn scroll_to_bottom(&mut self, css: &str) -> Result<bool, PageError>;
    async fn scroll_height(&mut self, css: &str) -> Result<Option<i64>, PageError>;
    async fn quit(self: Box<Self>) -> Result<(), PageError>;
}

#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn BrowserSession>, HarvestError>;
    async fn release(&self, session: Box<dyn BrowserSession>);
}

pub struct Droid {
    pub driver: WebDriver,
}

/// Each call draws a fresh desktop Chrome user agent.
fn chrome_args(settings: &WebDriverSettings) -> Vec<String> {
    let mut args = vec![
        "--disable-blink-features=AutomationControlled".to_string(),
        format!(
            "--window-size={},{}",
            settings.window_width, settings.window_height
        ),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--lang=en-US".to_string(),
        "--log-level=3".to_string(),
        format!("--user-agent={}", fake_user_agent::get_chrome_rua()),
    ];
    if settings.headless {
        args.push("--headless=new".to_string());
        args.push("--disable-gpu".to_string());
    }
    args
}

impl Droid {
    pub async fn new(settings: &WebDriverSettings) -> Result<Self, WebDriverError> {
        let mut caps = DesiredCapabilities::chrome();
        for arg in chrome_args(settings) {
            caps.add_arg(&arg)?;
        }
        caps.add_experimental_option("excludeSwitches", vec!["enable-automation"])?;
        caps.add_experimental_option("useAutomationExtension", false)?;

        let driver = WebDriver::new(&settings.url, caps).await?;

        Ok(Droid { driver })
    }
}

#[async_trait]
impl BrowserSession for Droid {
    async fn goto(&mut self, url: &str) -> Result<(), PageError> {
        self.driver
            .goto(url)
            .await
            .map_err(|e| PageError::Navigation(format!("{}: {}", url, e)))
    }

    async fn current_url(&mut self) -> Result<String, PageError> {
        Ok(self.driver.current_url().await?.to_string())
    }

    async fn source(&mut self) -> Result<String, PageError> {
        Ok(self.driver.source().await?)
    }

    async fn exists(&mut self, css: &str) -> Result<bool, PageError> {
        Ok(!self.driver.find_all(By::Css(css)).await?.is_empty())
    }

    async fn scroll_to_bottom(&mut self, css: &str) -> Result<bool, PageError> {
        let ret = self
            .driver
            .execute(
                r#"
                const el = document.querySelector(arguments[0]);
                if (!el) { return false; }
                el.scrollTop = el.scrollHeight;
                return true;
                "#,
                vec![json!(css)],
            )
            .await
            .map_err(|e| PageError::Script(e.to_string()))?;

        Ok(ret.json().as_bool().unwrap_or(false))
    }

    async fn scroll_height(&mut self, css: &str) -> Result<Option<i64>, PageError> {
        let ret = self
            .driver
            .execute(
                r#"
                const el = document.querySelector(arguments[0]);
                return el ? el.scrollHeight : null;
                "#,
                vec![json!(css)],
            )
            .await
            .map_err(|e| PageError::Script(e.to_string()))?;

        Ok(ret.json().as_i64())
    }

    async fn quit(self: Box<Self>) -> Result<(), PageError> {
        Ok(self.driver.quit().await?)
    }
}

pub struct DroidManager {
    settings: WebDriverSettings,
}

impl DroidManager {
    pub fn new(settings: WebDriverSettings) -> Self {
        DroidManager { settings }
    }
}

#[async_trait]
impl SessionManager for DroidManager {
    async fn acquire(&self) -> Result<Box<dyn BrowserSession>, HarvestError> {
        let attempts = self.settings.acquire_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match Droid::new(&self.settings).await {
                Ok(droid) => return Ok(Box::new(droid)),
                Err(e) => {
                    log::warn!(
                        "Could not start browser session (attempt {}/{}): {}",
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(ACQUIRE_BACKOFF).await;
                    }
                }
            }
        }

        Err(HarvestError::SessionUnavailable(last_error))
    }

    async fn release(&self, session: Box<dyn BrowserSession>) {
        if let Err(e) = session.quit().await {
            log::error!("Failed to quit browser session: {:?}", e);
        }
    }
}
