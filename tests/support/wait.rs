use std::time::Duration;

use anyhow::Result;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const TIMEOUT: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds. Background workers get to run in between.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) -> Result<()> {
    let poll = async {
        while !condition() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };
    tokio::time::timeout(TIMEOUT, poll)
        .await
        .map_err(|_| anyhow::anyhow!("timeout waiting for {description}"))
}
