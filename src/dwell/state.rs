use std::{fmt, time::Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PagePhase {
    #[default]
    Init,
    Sampling,
    Flushing,
    Terminal,
}

impl fmt::Display for PagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PagePhase::Init => "init",
            PagePhase::Sampling => "sampling",
            PagePhase::Flushing => "flushing",
            PagePhase::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DwellState {
    pub phase: PagePhase,
    pub visibility: Visibility,
    pub dwell_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// Start of the interval not yet folded into `dwell_ms`. Only set while
    /// the page is visible and sampling.
    #[serde(skip)]
    pub last_sample: Option<Instant>,
}

impl Default for DwellState {
    fn default() -> Self {
        Self {
            phase: PagePhase::Init,
            visibility: Visibility::Visible,
            dwell_ms: 0,
            started_at: None,
            last_sample: None,
        }
    }
}

impl DwellState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self, visibility: Visibility, started_at: DateTime<Utc>, now: Instant) {
        *self = Self {
            phase: PagePhase::Sampling,
            visibility,
            dwell_ms: 0,
            started_at: Some(started_at),
            last_sample: (visibility == Visibility::Visible).then_some(now),
        };
    }

    /// Folds the time since the last sample into the accumulator. Returns
    /// the milliseconds added, zero when hidden or not sampling.
    pub fn sample(&mut self, now: Instant) -> u64 {
        if self.phase != PagePhase::Sampling || self.visibility != Visibility::Visible {
            return 0;
        }
        let Some(anchor) = self.last_sample else {
            return 0;
        };

        let added = now.saturating_duration_since(anchor).as_millis() as u64;
        self.dwell_ms = self.dwell_ms.saturating_add(added);
        self.last_sample = Some(now);
        added
    }

    /// Applies a visibility change. Returns false for a repeat of the
    /// current visibility, which leaves the state untouched.
    pub fn set_visibility(&mut self, visibility: Visibility, now: Instant) -> bool {
        if self.visibility == visibility {
            return false;
        }

        match visibility {
            Visibility::Hidden => {
                self.sample(now);
                self.last_sample = None;
            }
            Visibility::Visible => {
                self.last_sample = (self.phase == PagePhase::Sampling).then_some(now);
            }
        }
        self.visibility = visibility;
        true
    }

    /// Final accumulation and the one-way move into `Flushing`. Returns the
    /// phase that refused the transition when not sampling.
    pub fn begin_flush(&mut self, now: Instant) -> Result<u64, PagePhase> {
        if self.phase != PagePhase::Sampling {
            return Err(self.phase);
        }
        self.sample(now);
        self.phase = PagePhase::Flushing;
        self.last_sample = None;
        Ok(self.dwell_ms)
    }

    pub fn finish(&mut self) {
        self.phase = PagePhase::Terminal;
        self.last_sample = None;
    }

    /// Visible time so far without mutating the accumulator.
    pub fn current_dwell_ms(&self, now: Instant) -> u64 {
        match (self.phase, self.visibility, self.last_sample) {
            (PagePhase::Sampling, Visibility::Visible, Some(anchor)) => self
                .dwell_ms
                .saturating_add(now.saturating_duration_since(anchor).as_millis() as u64),
            _ => self.dwell_ms,
        }
    }

    pub fn time_spent_seconds(&self) -> u64 {
        round_to_seconds(self.dwell_ms)
    }
}

/// Rounds half-up to whole seconds.
pub fn round_to_seconds(ms: u64) -> u64 {
    ms.saturating_add(500) / 1000
}
