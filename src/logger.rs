//! Rate-limited status logging on top of the `log` facade.
//!
//! Periodic polling produces the same status lines over and over; those go
//! through [`SmartLogger::status`], which only emits a line when its content
//! changed. After three errors inside a rolling five-minute window the logger
//! switches to verbose mode and lets every status line through, so the lead-up
//! to a failure is visible without debug-flooding healthy sessions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling window in which repeated errors trigger verbose mode.
const ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Consecutive errors within the window that switch verbose mode on.
const VERBOSE_ERROR_THRESHOLD: u32 = 3;

#[derive(Default)]
struct State {
    error_count: u32,
    last_error_at: Option<Instant>,
    verbose: bool,
    /// Last emitted content per status key, for deduplication.
    last_status: HashMap<&'static str, String>,
}

/// Deduplicating logger handle. Cheap to create, one per component.
pub struct SmartLogger {
    target: &'static str,
    state: Mutex<State>,
}

impl SmartLogger {
    pub fn new(target: &'static str) -> Self {
        Self {
            target,
            state: Mutex::new(State::default()),
        }
    }

    pub fn debug(&self, msg: &str) {
        log::debug!(target: self.target, "{msg}");
    }

    pub fn info(&self, msg: &str) {
        log::info!(target: self.target, "{msg}");
    }

    pub fn warning(&self, msg: &str) {
        log::warn!(target: self.target, "{msg}");
    }

    /// Logs an error and advances the verbose-mode tracking.
    pub fn error(&self, msg: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.error_count += 1;
            state.last_error_at = Some(Instant::now());
            if state.error_count >= VERBOSE_ERROR_THRESHOLD {
                state.verbose = true;
            }
        }
        log::error!(target: self.target, "{msg}");
    }

    /// Logs a failure together with its source chain.
    pub fn exception(&self, msg: &str, err: &dyn std::error::Error) {
        let mut line = format!("{msg}: {err}");
        let mut source = err.source();
        while let Some(cause) = source {
            line.push_str(&format!(" (caused by: {cause})"));
            source = cause.source();
        }
        self.error(&line);
    }

    /// Debug-level status line, deduplicated per `key`.
    ///
    /// Emits only when the content for `key` changed since the last emission,
    /// unless verbose mode is active (then every call passes through).
    pub fn status(&self, key: &'static str, msg: &str) {
        let Ok(mut state) = self.state.lock() else {
            // A poisoned lock must not take logging down with it.
            log::debug!(target: self.target, "{msg}");
            return;
        };

        if state.verbose_active() {
            log::debug!(target: self.target, "{msg}");
            return;
        }

        let changed = state
            .last_status
            .get(key)
            .map_or(true, |last| last != msg);
        if changed {
            state.last_status.insert(key, msg.to_string());
            log::debug!(target: self.target, "{msg}");
        }
    }

    #[cfg(test)]
    fn is_verbose(&self) -> bool {
        self.state.lock().map(|mut s| s.verbose_active()).unwrap_or(false)
    }
}

impl State {
    /// Checks verbose mode, expiring it when the error window has passed.
    fn verbose_active(&mut self) -> bool {
        if let Some(last) = self.last_error_at {
            if last.elapsed() > ERROR_WINDOW {
                self.error_count = 0;
                self.verbose = false;
            }
        }
        self.verbose || self.error_count >= VERBOSE_ERROR_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_mode_off_by_default() {
        let logger = SmartLogger::new("test");
        assert!(!logger.is_verbose());
    }

    #[test]
    fn three_errors_enable_verbose_mode() {
        let logger = SmartLogger::new("test");
        logger.error("one");
        logger.error("two");
        assert!(!logger.is_verbose());
        logger.error("three");
        assert!(logger.is_verbose());
    }

    #[test]
    fn exceptions_count_toward_verbose_mode() {
        let logger = SmartLogger::new("test");
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        for _ in 0..3 {
            logger.exception("request failed", &err);
        }
        assert!(logger.is_verbose());
    }

    #[test]
    fn status_deduplicates_identical_content() {
        let logger = SmartLogger::new("test");
        logger.status("poll", "2 devices");
        {
            let state = logger.state.lock().unwrap();
            assert_eq!(state.last_status.get("poll").unwrap(), "2 devices");
        }
        // Same content again: dedup map unchanged
        logger.status("poll", "2 devices");
        // New content replaces the stored line
        logger.status("poll", "3 devices");
        {
            let state = logger.state.lock().unwrap();
            assert_eq!(state.last_status.get("poll").unwrap(), "3 devices");
        }
    }

    #[test]
    fn status_keys_are_tracked_independently() {
        let logger = SmartLogger::new("test");
        logger.status("poll", "a");
        logger.status("health", "b");
        let state = logger.state.lock().unwrap();
        assert_eq!(state.last_status.len(), 2);
    }

    #[test]
    fn verbose_mode_expires_after_window() {
        let logger = SmartLogger::new("test");
        for _ in 0..3 {
            logger.error("boom");
        }
        assert!(logger.is_verbose());
        // Age the last error beyond the window
        {
            let mut state = logger.state.lock().unwrap();
            state.last_error_at =
                Some(Instant::now() - ERROR_WINDOW - Duration::from_secs(1));
        }
        assert!(!logger.is_verbose());
    }
}
