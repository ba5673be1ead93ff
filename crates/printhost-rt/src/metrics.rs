//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Runtime helpers supporting the orchestrator."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use printhost_common::time::duration_to_micros;

/// Running summary of how late timers fired relative to their deadlines.
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    dispatched: u64,
    late_samples: u64,
    late_total: Duration,
    late_max: Duration,
}

impl DispatchStats {
    /// Record one timer dispatch. `deadline` is `None` for timers that asked to
    /// run as soon as possible; those count as dispatched but carry no lateness.
    pub fn record(&mut self, deadline: Option<Instant>, fired_at: Instant) {
        self.dispatched += 1;
        let Some(deadline) = deadline else {
            return;
        };
        let late = fired_at.saturating_duration_since(deadline);
        self.late_samples += 1;
        self.late_total += late;
        self.late_max = self.late_max.max(late);
    }

    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    pub fn max_lateness(&self) -> Duration {
        self.late_max
    }

    pub fn mean_lateness(&self) -> Duration {
        if self.late_samples == 0 {
            return Duration::ZERO;
        }
        let samples = u32::try_from(self.late_samples).unwrap_or(u32::MAX);
        self.late_total / samples
    }

    pub fn summary(&self) -> String {
        format!(
            "dispatched={} late_mean_us={} late_max_us={}",
            self.dispatched,
            duration_to_micros(self.mean_lateness()),
            duration_to_micros(self.late_max)
        )
    }
}
