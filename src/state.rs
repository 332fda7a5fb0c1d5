//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket connection.
//!
//! ## What is shared:
//! - **config**: runtime-updatable configuration behind a reader-writer lock
//! - **metrics**: lock-free counters describing sessions and turns
//! - **services**: the STT, LLM and TTS clients every session talks to
//!
//! Voice sessions never coordinate through this state. Each connection builds its own
//! turn pipeline and only reports counters here.

use crate::config::{read_shared, AppConfig, SharedConfig};
use crate::conversation::Services;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub metrics: Arc<ConversationMetrics>,
    pub services: Services,
    pub start_time: Instant,
}

/// Counters describing voice sessions since server start.
///
/// Plain atomics: these are written from many session tasks at once and only ever
/// read as a snapshot for the metrics endpoints.
#[derive(Debug, Default)]
pub struct ConversationMetrics {
    active_sessions: AtomicU64,
    total_sessions: AtomicU64,
    turns_completed: AtomicU64,
    turns_without_reply: AtomicU64,
    llm_failures: AtomicU64,
    rejected_messages: AtomicU64,
    rejected_audio_frames: AtomicU64,
    stt_reconnects: AtomicU64,
    fatal_errors: AtomicU64,
}

/// Point-in-time copy of [`ConversationMetrics`], ready to serialize.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub active_sessions: u64,
    pub total_sessions: u64,
    pub turns_completed: u64,
    pub turns_without_reply: u64,
    pub llm_failures: u64,
    pub rejected_messages: u64,
    pub rejected_audio_frames: u64,
    pub stt_reconnects: u64,
    pub fatal_errors: u64,
}

impl ConversationMetrics {
    /// Claim one of `limit` session slots. The check and the increment are one atomic
    /// step, so concurrent upgrades cannot overshoot the limit.
    pub fn try_reserve_session(self: &Arc<Self>, limit: usize) -> Option<SessionSlot> {
        let limit = limit as u64;
        self.active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()?;
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        Some(SessionSlot {
            metrics: self.clone(),
        })
    }

    /// Saturates at zero so an unmatched call cannot wrap the gauge.
    fn session_ended(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn turn_completed(&self) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_without_reply(&self) {
        self.turns_without_reply.fetch_add(1, Ordering::Relaxed);
    }

    pub fn llm_failure(&self) {
        self.llm_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rejected(&self) {
        self.rejected_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audio_frame_rejected(&self) {
        self.rejected_audio_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stt_reconnected(&self) {
        self.stt_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_without_reply: self.turns_without_reply.load(Ordering::Relaxed),
            llm_failures: self.llm_failures.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            rejected_audio_frames: self.rejected_audio_frames.load(Ordering::Relaxed),
            stt_reconnects: self.stt_reconnects.load(Ordering::Relaxed),
            fatal_errors: self.fatal_errors.load(Ordering::Relaxed),
        }
    }
}

/// One reserved place under `session.max_concurrent_sessions`. Released on drop, so a
/// session that never starts (failed handshake) gives its place back too.
#[derive(Debug)]
pub struct SessionSlot {
    metrics: Arc<ConversationMetrics>,
}

impl SessionSlot {
    pub fn metrics(&self) -> &Arc<ConversationMetrics> {
        &self.metrics
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.metrics.session_ended();
    }
}

impl AppState {
    pub fn new(config: AppConfig, services: Services) -> Self {
        Self::with_shared_config(Arc::new(RwLock::new(config)), services)
    }

    /// State around a config handle the provider clients also hold.
    pub fn with_shared_config(config: SharedConfig, services: Services) -> Self {
        Self {
            config,
            metrics: Arc::new(ConversationMetrics::default()),
            services,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    pub fn get_config(&self) -> AppConfig {
        read_shared(&self.config)
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
        Ok(())
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Reserve a voice session under the configured limit, or `None` when full.
    pub fn reserve_session(&self) -> Option<SessionSlot> {
        let limit = self.get_config().session.max_concurrent_sessions;
        self.metrics.try_reserve_session(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_slots_respect_limit_and_release_on_drop() {
        let metrics = Arc::new(ConversationMetrics::default());
        let first = metrics.try_reserve_session(2).expect("first slot");
        let second = metrics.try_reserve_session(2).expect("second slot");
        assert!(metrics.try_reserve_session(2).is_none());

        drop(first);
        assert_eq!(metrics.active_sessions(), 1);
        let third = metrics.try_reserve_session(2).expect("freed slot");

        drop(second);
        drop(third);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_sessions, 0);
        assert_eq!(snapshot.total_sessions, 3);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_limit() {
        let metrics = Arc::new(ConversationMetrics::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || metrics.try_reserve_session(4))
            })
            .collect();
        let slots: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(slots.len(), 4);
        assert_eq!(metrics.active_sessions(), 4);
        drop(slots);
        assert_eq!(metrics.active_sessions(), 0);
    }

    #[test]
    fn test_session_gauge_never_underflows() {
        let metrics = ConversationMetrics::default();
        metrics.session_ended();
        assert_eq!(metrics.active_sessions(), 0);
    }

    #[test]
    fn test_turn_counters() {
        let metrics = ConversationMetrics::default();
        metrics.turn_completed();
        metrics.turn_without_reply();
        metrics.stt_reconnected();
        metrics.audio_frame_rejected();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.turns_completed, 1);
        assert_eq!(snapshot.turns_without_reply, 1);
        assert_eq!(snapshot.stt_reconnects, 1);
        assert_eq!(snapshot.rejected_audio_frames, 1);
    }
}
