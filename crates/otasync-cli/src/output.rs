// Output formatting and styling

use chrono::{DateTime, Local, TimeZone, Utc};
use colored::Colorize;
use otasync_updates::{CheckOutcome, ScheduleState, UpdateInfo, UpdateOrigin};

/// Output styling configuration
pub struct OutputStyle {
    pub use_colors: bool,
}

impl Default for OutputStyle {
    fn default() -> Self {
        Self {
            use_colors: atty::is(atty::Stream::Stdout),
        }
    }
}

impl OutputStyle {
    pub fn plain() -> Self {
        Self { use_colors: false }
    }

    /// Format success message
    pub fn success(&self, msg: &str) -> String {
        if self.use_colors {
            format!("{} {}", "✓".green().bold(), msg)
        } else {
            format!("✓ {}", msg)
        }
    }

    /// Format error message
    pub fn error(&self, msg: &str) -> String {
        if self.use_colors {
            format!("{} {}", "✗".red().bold(), msg)
        } else {
            format!("✗ {}", msg)
        }
    }

    /// Format warning message
    pub fn warning(&self, msg: &str) -> String {
        if self.use_colors {
            format!("{} {}", "⚠".yellow(), msg)
        } else {
            format!("⚠ {}", msg)
        }
    }

    /// Format info message
    pub fn info(&self, msg: &str) -> String {
        if self.use_colors {
            format!("{} {}", "ℹ".blue(), msg)
        } else {
            format!("ℹ {}", msg)
        }
    }

    /// One line per update: id, build date, origin/availability, status
    pub fn update_line(&self, update: &UpdateInfo) -> String {
        let availability = match (update.origin, update.available_online) {
            (UpdateOrigin::Local, _) => "local",
            (UpdateOrigin::Remote, true) => "online",
            (UpdateOrigin::Remote, false) => "offline",
        };
        let id = if self.use_colors {
            update.id.bold().to_string()
        } else {
            update.id.clone()
        };
        let status = serde_json::to_value(update.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();

        format!(
            "{}  {}  {:<7}  {:<19}  {}",
            id,
            format_timestamp(update.timestamp),
            availability,
            status,
            update.metadata.name
        )
    }

    /// Summary of a finished check
    pub fn outcome(&self, outcome: &CheckOutcome) -> String {
        match outcome {
            CheckOutcome::Success {
                newly_discovered: true,
                ..
            } => self.success("New updates available"),
            CheckOutcome::Success { .. } => self.success("Update list is up to date"),
            CheckOutcome::Failed { reason } => self.error(&format!("Check failed: {}", reason)),
            CheckOutcome::Cancelled => self.warning("Check cancelled"),
        }
    }

    pub fn schedule(&self, state: &ScheduleState) -> Vec<String> {
        let periodic = match state.periodic {
            Some(interval) => format!("Periodic check every {}h", interval.as_secs() / 3600),
            None => "Periodic check disabled".to_string(),
        };
        let retry = match state.retry_due {
            Some(due) => format!("Retry due {}", format_datetime(due)),
            None => "No retry pending".to_string(),
        };
        vec![self.info(&periodic), self.info(&retry)]
    }
}

/// Local time for epoch seconds
pub fn format_timestamp(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(time) => format_datetime(time),
        None => timestamp.to_string(),
    }
}

pub fn format_datetime(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
