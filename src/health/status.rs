// src/health/status.rs
use std::fmt;

/// Outcome of one liveness check, rendered the way it appears in the
/// health-check log: `up` or `down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    pub fn is_up(self) -> bool {
        self == HealthStatus::Up
    }
}

impl From<bool> for HealthStatus {
    fn from(alive: bool) -> Self {
        if alive {
            HealthStatus::Up
        } else {
            HealthStatus::Down
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Up => f.write_str("up"),
            HealthStatus::Down => f.write_str("down"),
        }
    }
}
