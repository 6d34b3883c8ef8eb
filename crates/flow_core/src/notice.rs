use std::time::{Duration, Instant};

const SHORT_MESSAGE_CHARS: usize = 48;
const MEDIUM_MESSAGE_CHARS: usize = 120;
const SHORT_DISMISS: Duration = Duration::from_millis(2_500);
const MEDIUM_DISMISS: Duration = Duration::from_millis(5_000);
const LONG_DISMISS: Duration = Duration::from_millis(9_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Success,
    Info,
    Error,
}

/// Transient toast. Errors linger half again as long as their band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
    pub shown_at: Instant,
    pub dismiss_after: Duration,
}

impl Notice {
    pub fn new(level: NoticeLevel, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            level,
            dismiss_after: dismiss_delay(level, &text),
            text,
            shown_at: Instant::now(),
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.shown_at) >= self.dismiss_after
    }
}

pub fn dismiss_delay(level: NoticeLevel, text: &str) -> Duration {
    let chars = text.chars().count();
    let base = if chars <= SHORT_MESSAGE_CHARS {
        SHORT_DISMISS
    } else if chars <= MEDIUM_MESSAGE_CHARS {
        MEDIUM_DISMISS
    } else {
        LONG_DISMISS
    };
    match level {
        NoticeLevel::Error => base + base / 2,
        NoticeLevel::Success | NoticeLevel::Info => base,
    }
}
