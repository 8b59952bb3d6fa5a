use chrono::{DateTime, Duration, Utc};

/// Limits how often live state is published, independent of how fast frames arrive.
///
/// Only publication is gated. Callers must feed the energy integrator before asking
/// the gate, so integration never skips a sample.
#[derive(Debug, Clone)]
pub struct ThrottleGate {
    enabled: bool,
    interval: Duration,
    last_published: Option<DateTime<Utc>>,
}

impl ThrottleGate {
    pub fn new(enabled: bool, interval: std::time::Duration) -> Self {
        Self {
            enabled,
            interval: Duration::from_std(interval).unwrap_or(Duration::MAX),
            last_published: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.enabled && self.interval > Duration::zero()
    }

    /// Forget the last publication so the next reading is published immediately.
    pub fn reset(&mut self) {
        self.last_published = None;
    }

    pub fn should_publish(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active() {
            self.last_published = Some(at);
            return true;
        }

        let publish = match self.last_published {
            None => true,
            Some(last) if at < last => {
                tracing::debug!(%at, %last, "clock moved backwards; re-basing throttle");
                true
            }
            Some(last) => at - last >= self.interval,
        };
        if publish {
            self.last_published = Some(at);
        }
        publish
    }
}
