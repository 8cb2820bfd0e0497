//! Background job: proactive token renewal.
//!
//! Wakes up every `renewal_interval_secs` (10 min by default, against a
//! ~60 min token) and renews silently once the remaining lifetime drops
//! below the threshold. Failures are logged and retried on the next tick;
//! foreground work never waits on this job.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::auth::TokenManager;

/// Spawn the renewal task. Abort the returned handle to stop it.
pub fn spawn(tokens: Arc<TokenManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // the first tick fires immediately; a fresh session never needs it
        interval.tick().await;
        loop {
            interval.tick().await;
            if tokens.proactive_renew().await {
                tracing::info!("access token renewed in the background");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityLog;
    use crate::client::tests::ScriptedBroker;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::store::{CredentialStore, MemoryStore};
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    #[tokio::test(start_paused = true)]
    async fn test_job_renews_inside_threshold() {
        let broker = Arc::new(ScriptedBroker::new(true));
        let clock = ManualClock::new(Utc::now());
        let tokens = Arc::new(TokenManager::new(
            Arc::new(Config::for_base_url("cid", "http://127.0.0.1:9")),
            CredentialStore::new(Arc::new(MemoryStore::new())),
            broker.clone(),
            Arc::new(clock.clone()),
            ActivityLog::new(false),
            reqwest::Client::new(),
        ));
        tokens.get_valid_credential().await.unwrap();

        let handle = spawn(tokens.clone(), Duration::from_secs(600));

        // plenty of lifetime left: the tick is a no-op
        time::sleep(Duration::from_secs(601)).await;
        assert_eq!(broker.silent.load(Ordering::SeqCst), 0);

        clock.advance(chrono::Duration::minutes(50));
        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(broker.silent.load(Ordering::SeqCst), 1);
        assert_eq!(tokens.peek().await.unwrap().token, "silent-0");

        handle.abort();
    }
}
