use std::time::Duration;

use tokio::time::{sleep, Instant};

use super::{BrowserSession, PageError};

/// Polls until one of `selectors` is present. Returns the first present
/// selector, or `None` once `timeout` has elapsed.
pub async fn wait_for_any(
    session: &mut dyn BrowserSession,
    selectors: &[&'static str],
    timeout: Duration,
    poll: Duration,
) -> Result<Option<&'static str>, PageError> {
    let deadline = Instant::now() + timeout;

    loop {
        for selector in selectors {
            if session.exists(selector).await? {
                return Ok(Some(*selector));
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;
    }
}

pub async fn wait_for(
    session: &mut dyn BrowserSession,
    selector: &'static str,
    timeout: Duration,
    poll: Duration,
) -> Result<bool, PageError> {
    Ok(wait_for_any(session, &[selector], timeout, poll)
        .await?
        .is_some())
}
