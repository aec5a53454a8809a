//! Bounded error history with severity/category tagging and a
//! rate-limited recovery policy.
//!
//! This is a constructor-injected service rather than a singleton: each
//! owner (the mixer engine, a stream manager) holds its own `Arc<ErrorHandler>`
//! and hands clones to whatever needs to report into it.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

const DEFAULT_MAX_HISTORY: usize = 1000;
const RECOVERY_MIN_SPACING: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Audio,
    Network,
    Config,
    Calibration,
    Unknown,
}

impl Category {
    /// Bounded-retry budget per §7: audio gets 5 attempts, network 3,
    /// config is allowed to keep retrying (reloading a file is cheap and
    /// safe to repeat).
    fn max_retries(self) -> Option<u32> {
        match self {
            Category::Audio => Some(5),
            Category::Network => Some(3),
            Category::Config => None,
            Category::Calibration => Some(3),
            Category::Unknown => Some(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    pub detail: String,
    pub recoverable: bool,
    pub timestamp: DateTime<Utc>,
}

/// Rollup used for the external-facing health indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Caution,
    Warning,
    Degraded,
    Critical,
}

struct RetryState {
    attempts: u32,
    last_attempt: Option<Instant>,
}

pub struct ErrorHandler {
    history: Mutex<VecDeque<ErrorEvent>>,
    max_history: usize,
    retries: Mutex<HashMap<Category, RetryState>>,
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl ErrorHandler {
    pub fn new(max_history: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(max_history.min(64))),
            max_history,
            retries: Mutex::new(HashMap::new()),
        }
    }

    fn push(&self, event: ErrorEvent) {
        match event.severity {
            Severity::Info => info!(category = ?event.category, "{}: {}", event.message, event.detail),
            Severity::Warning => warn!(category = ?event.category, "{}: {}", event.message, event.detail),
            Severity::Error | Severity::Critical => {
                error!(category = ?event.category, severity = ?event.severity, "{}: {}", event.message, event.detail)
            }
        }

        let mut history = self.history.lock().expect("history lock poisoned");
        history.push_back(event);
        if history.len() > self.max_history {
            history.pop_front();
        }
    }

    pub fn log_info(&self, message: impl Into<String>, detail: impl Into<String>) {
        self.push(ErrorEvent {
            severity: Severity::Info,
            category: Category::Unknown,
            message: message.into(),
            detail: detail.into(),
            recoverable: true,
            timestamp: Utc::now(),
        });
    }

    pub fn log_warning(&self, category: Category, message: impl Into<String>, detail: impl Into<String>) {
        self.push(ErrorEvent {
            severity: Severity::Warning,
            category,
            message: message.into(),
            detail: detail.into(),
            recoverable: true,
            timestamp: Utc::now(),
        });
    }

    pub fn log_error(
        &self,
        category: Category,
        message: impl Into<String>,
        detail: impl Into<String>,
        recoverable: bool,
    ) {
        self.push(ErrorEvent {
            severity: Severity::Error,
            category,
            message: message.into(),
            detail: detail.into(),
            recoverable,
            timestamp: Utc::now(),
        });
    }

    /// Returns `true` if a recovery attempt should proceed now: at least
    /// `RECOVERY_MIN_SPACING` has passed since the last attempt in this
    /// category, and the category's retry budget isn't exhausted.
    pub fn should_attempt_recovery(&self, category: Category) -> bool {
        let mut retries = self.retries.lock().expect("retry lock poisoned");
        let state = retries.entry(category).or_insert(RetryState {
            attempts: 0,
            last_attempt: None,
        });

        if let Some(max) = category.max_retries() {
            if state.attempts >= max {
                return false;
            }
        }

        if let Some(last) = state.last_attempt {
            if last.elapsed() < RECOVERY_MIN_SPACING {
                return false;
            }
        }

        state.attempts += 1;
        state.last_attempt = Some(Instant::now());
        true
    }

    pub fn reset_retries(&self, category: Category) {
        self.retries.lock().expect("retry lock poisoned").remove(&category);
    }

    pub fn history_snapshot(&self) -> Vec<ErrorEvent> {
        self.history.lock().expect("history lock poisoned").iter().cloned().collect()
    }

    /// Pure function of the recent error history: dominated by the worst
    /// severity seen, escalated if errors are frequent.
    pub fn health_status(&self) -> HealthStatus {
        let history = self.history.lock().expect("history lock poisoned");
        let recent: Vec<&ErrorEvent> = history
            .iter()
            .rev()
            .take_while(|e| Utc::now() - e.timestamp < chrono::Duration::minutes(5))
            .collect();

        let critical = recent.iter().filter(|e| e.severity == Severity::Critical).count();
        let errors = recent.iter().filter(|e| e.severity == Severity::Error).count();
        let warnings = recent.iter().filter(|e| e.severity == Severity::Warning).count();

        if critical > 0 {
            HealthStatus::Critical
        } else if errors >= 5 {
            HealthStatus::Degraded
        } else if errors > 0 {
            HealthStatus::Warning
        } else if warnings >= 5 {
            HealthStatus::Caution
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let handler = ErrorHandler::new(4);
        for i in 0..10 {
            handler.log_info(format!("event {i}"), "");
        }
        assert_eq!(handler.history_snapshot().len(), 4);
    }

    #[test]
    fn recovery_is_rate_limited() {
        let handler = ErrorHandler::new(10);
        assert!(handler.should_attempt_recovery(Category::Network));
        assert!(!handler.should_attempt_recovery(Category::Network));
    }

    #[test]
    fn recovery_respects_retry_budget() {
        let handler = ErrorHandler::new(10);
        for cat in std::iter::repeat(Category::Network).take(3) {
            handler.reset_retries(cat);
            assert!(handler.should_attempt_recovery(cat));
            handler.retries.lock().unwrap().get_mut(&cat).unwrap().last_attempt =
                Some(Instant::now() - Duration::from_secs(10));
        }
        handler.reset_retries(Category::Network);
        for _ in 0..3 {
            assert!(handler.should_attempt_recovery(Category::Network));
            let mut retries = handler.retries.lock().unwrap();
            retries.get_mut(&Category::Network).unwrap().last_attempt =
                Some(Instant::now() - Duration::from_secs(10));
        }
        assert!(!handler.should_attempt_recovery(Category::Network));
    }

    #[test]
    fn config_category_has_unlimited_retries() {
        assert_eq!(Category::Config.max_retries(), None);
    }

    #[test]
    fn health_status_escalates_with_critical_errors() {
        let handler = ErrorHandler::new(100);
        assert_eq!(handler.health_status(), HealthStatus::Healthy);
        handler.push(ErrorEvent {
            severity: Severity::Critical,
            category: Category::Audio,
            message: "device lost".into(),
            detail: "".into(),
            recoverable: false,
            timestamp: Utc::now(),
        });
        assert_eq!(handler.health_status(), HealthStatus::Critical);
    }
}
