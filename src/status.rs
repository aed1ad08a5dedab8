//! Read-only runtime projection of the supervisor, and its display form

use crate::process::DispatcherState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// What presentation layers see of the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: DispatcherState,
    pub pid: Option<u32>,
    pub port: u16,
    pub started_at: Option<DateTime<Utc>>,
    /// Zero unless running
    #[serde(rename = "uptime_secs", serialize_with = "serialize_secs")]
    pub uptime: Duration,
    pub endpoint_count: usize,
    pub request_count: u64,
    /// Why the last start failed or the dispatcher died
    pub failure: Option<String>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl StatusSnapshot {
    pub fn stopped(port: u16) -> Self {
        Self {
            state: DispatcherState::Stopped,
            pid: None,
            port,
            started_at: None,
            uptime: Duration::ZERO,
            endpoint_count: 0,
            request_count: 0,
            failure: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == DispatcherState::Running
    }

    /// Lines a status display cycles through
    pub fn display_lines(&self) -> Vec<String> {
        let headline = match self.state {
            DispatcherState::Running => "SERVER RUNNING",
            DispatcherState::Starting => "STARTING...",
            DispatcherState::Stopping => "STOPPING...",
            DispatcherState::Stopped => "SERVER STOPPED",
            DispatcherState::Failed => "START FAILED",
        };

        let mut lines = vec![
            headline.to_string(),
            format!("{} ENDPOINTS", self.endpoint_count),
            format!("PORT {}", self.port),
        ];
        if self.is_running() {
            lines.push(format_uptime(self.uptime));
            lines.push(format!("REQUESTS {}", self.request_count));
        }
        lines
    }
}

/// `UPTIME h:mm` once past an hour, `UPTIME m:ss` before that
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        format!("UPTIME {}:{:02}", hours, minutes)
    } else {
        format!("UPTIME {}:{:02}", minutes, secs % 60)
    }
}

/// Cycles through a snapshot's display lines, one per tick
#[derive(Debug, Default)]
pub struct StatusTicker {
    index: usize,
}

impl StatusTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next line for `snapshot`. The position carries over when the set of
    /// lines changes length.
    pub fn next_line(&mut self, snapshot: &StatusSnapshot) -> String {
        let lines = snapshot.display_lines();
        let line = lines[self.index % lines.len()].clone();
        self.index = (self.index + 1) % lines.len();
        line
    }

    /// Restart from the headline, e.g. after a state change
    pub fn reset(&mut self) {
        self.index = 0;
    }
}
