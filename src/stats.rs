//! Dashboard statistics and SLA evaluation

use std::fmt;

use serde::Serialize;

use crate::model::{Monitor, MonitorStatus};

/// Fleet-wide summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DashboardStats {
    pub total_monitors: usize,
    pub up_monitors: usize,
    pub down_monitors: usize,
    pub paused_monitors: usize,
    pub open_incidents: usize,

    /// Rounded mean of each monitor's last response time, 0 without data
    pub avg_latency_ms: u64,
}

impl DashboardStats {
    pub fn from_monitors(monitors: &[Monitor], open_incidents: usize) -> Self {
        let count = |status: MonitorStatus| monitors.iter().filter(|m| m.status == status).count();

        let latencies: Vec<u64> = monitors
            .iter()
            .filter_map(|monitor| monitor.last_response_time_ms)
            .collect();
        let avg_latency_ms = if latencies.is_empty() {
            0
        } else {
            (latencies.iter().sum::<u64>() as f64 / latencies.len() as f64).round() as u64
        };

        Self {
            total_monitors: monitors.len(),
            up_monitors: count(MonitorStatus::Up),
            down_monitors: count(MonitorStatus::Down),
            paused_monitors: count(MonitorStatus::Paused),
            open_incidents,
            avg_latency_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SlaTarget {
    TwoNines,
    ThreeNines,
    FourNines,
}

impl SlaTarget {
    pub const ALL: [SlaTarget; 3] = [SlaTarget::TwoNines, SlaTarget::ThreeNines, SlaTarget::FourNines];

    pub fn percentage(self) -> f64 {
        match self {
            SlaTarget::TwoNines => 99.0,
            SlaTarget::ThreeNines => 99.9,
            SlaTarget::FourNines => 99.99,
        }
    }

    pub fn evaluate(self, uptime_percentage: f64) -> SlaStatus {
        if uptime_percentage >= self.percentage() {
            SlaStatus::Met
        } else {
            SlaStatus::Breached
        }
    }
}

impl fmt::Display for SlaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.percentage())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SlaStatus {
    Met,
    Breached,
}

impl fmt::Display for SlaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlaStatus::Met => write!(f, "MET"),
            SlaStatus::Breached => write!(f, "BREACHED"),
        }
    }
}

/// Status of `monitor` against every SLA target
pub fn sla_report(monitor: &Monitor) -> Vec<(SlaTarget, SlaStatus)> {
    SlaTarget::ALL
        .into_iter()
        .map(|target| (target, target.evaluate(monitor.uptime_percentage)))
        .collect()
}
