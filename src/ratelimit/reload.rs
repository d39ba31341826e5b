//! Periodic policy reload from disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

use super::engine::RateLimiterEngine;
use super::matcher::PolicyCatalog;
use crate::error::Result;

/// Load a policy file and swap it into the engine.
///
/// An invalid file leaves the current policy set in place. Returns the number
/// of policies now loaded.
pub fn reload_from_file(engine: &RateLimiterEngine, path: &Path) -> Result<usize> {
    match PolicyCatalog::from_file(path) {
        Ok(catalog) => {
            let count = catalog.len();
            engine.reload(catalog);
            Ok(count)
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "Rejected policy reload, keeping current policies"
            );
            Err(e)
        }
    }
}

/// Re-read `path` every `interval` for as long as the returned task runs.
pub fn spawn_policy_reloader(
    engine: Arc<RateLimiterEngine>,
    path: PathBuf,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the file was just loaded.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let _ = reload_from_file(&engine, &path);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TollgateError;

    fn temp_policy_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("tollgate-{}-{}.yaml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_invalid_file_keeps_current_policies() {
        let engine = RateLimiterEngine::new(
            PolicyCatalog::from_yaml("[{name: a, rate: 1, period: 1, burst: 1}]").unwrap(),
        );
        let path = temp_policy_file("invalid", "[{name: a, rate: -1, period: 1, burst: 1}]");

        let err = reload_from_file(&engine, &path).unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
        assert!(engine.policy("a").is_ok());

        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let engine = RateLimiterEngine::new(PolicyCatalog::new());
        let err = reload_from_file(&engine, Path::new("/nonexistent/tollgate.yaml")).unwrap_err();
        assert!(matches!(err, TollgateError::Io(_)));
    }

    #[tokio::test]
    async fn test_reloader_picks_up_changes() {
        let path = temp_policy_file("watch", "[{name: before, rate: 1, period: 1, burst: 1}]");
        let engine = Arc::new(RateLimiterEngine::new(PolicyCatalog::from_file(&path).unwrap()));

        let handle = spawn_policy_reloader(engine.clone(), path.clone(), Duration::from_millis(20));
        std::fs::write(&path, "[{name: after, rate: 1, period: 1, burst: 1}]").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(engine.policy("after").is_ok());
        assert!(engine.policy("before").is_err());

        handle.abort();
        std::fs::remove_file(path).unwrap();
    }
}
