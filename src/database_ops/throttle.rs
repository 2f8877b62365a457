use crate::util::env::env_parse;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// Requests allowed per window; zero in either field disables throttling.
#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub max_ops_per_window: u32,
    pub window_secs: u64,
}

impl RateLimitSettings {
    pub fn per_minute(max_ops: u32) -> Self {
        Self {
            max_ops_per_window: max_ops,
            window_secs: 60,
        }
    }

    pub fn from_env(max_key: &str, default_max: u32) -> Self {
        Self::per_minute(env_parse(max_key, default_max))
    }

    pub fn per_request_interval(&self) -> Option<Duration> {
        if self.max_ops_per_window == 0 || self.window_secs == 0 {
            None
        } else {
            Some(Duration::from_secs_f64(
                self.window_secs as f64 / self.max_ops_per_window as f64,
            ))
        }
    }
}

/// Spaces requests evenly. Shared by every task issuing calls through one client.
#[derive(Clone, Debug)]
pub struct RequestThrottle {
    settings: RateLimitSettings,
    next_allowed: Option<Arc<Mutex<Instant>>>,
}

impl RequestThrottle {
    pub fn new(settings: RateLimitSettings) -> Self {
        let next_allowed = settings
            .per_request_interval()
            .map(|_| Arc::new(Mutex::new(Instant::now())));
        Self {
            settings,
            next_allowed,
        }
    }

    pub async fn wait(&self) {
        let (Some(interval), Some(state)) =
            (self.settings.per_request_interval(), &self.next_allowed)
        else {
            return;
        };

        let mut next_allowed = state.lock().await;
        let now = Instant::now();
        let wait_until = (*next_allowed).max(now);
        *next_allowed = wait_until + interval;
        drop(next_allowed);

        let pause = wait_until.saturating_duration_since(now);
        if !pause.is_zero() {
            sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spaces_consecutive_requests() {
        let settings = RateLimitSettings {
            max_ops_per_window: 100,
            window_secs: 1,
        };
        let interval = settings.per_request_interval().unwrap();
        let throttle = RequestThrottle::new(settings);

        throttle.wait().await;
        let start = Instant::now();
        throttle.wait().await;
        assert!(start.elapsed() >= interval);
    }

    #[tokio::test]
    async fn zero_rate_disables_waiting() {
        let throttle = RequestThrottle::new(RateLimitSettings::per_minute(0));
        let start = Instant::now();
        for _ in 0..5 {
            throttle.wait().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
