//! Usage statistics
//!
//! # Purpose
//! Interprets the GET_USAGE reply. TPU usage metrics add time-in-state per
//! uid; component activity metrics record the latest utilization of the
//! device and of the TPU core, cleared when read.
//!
//! # Record layout
//! ```text
//!  header   num_metrics u32 | metric_size u32
//!  metric   type u32 | reserved u32 | payload 12 bytes
//!    TPU_USAGE            uid i32 | duration_us u32 | power_state u32
//!    COMPONENT_ACTIVITY   component i32 | utilization i32
//! ```
//! A reply whose `metric_size` is not [`USAGE_METRIC_SIZE`] comes from a
//! firmware with another layout and is discarded whole.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tpu_kci::{Kci, UsageReport};
use tpu_mailbox::sync::lock;

use crate::Result;

pub const USAGE_METRIC_SIZE: usize = 20;

const METRIC_TYPE_TPU_USAGE: u32 = 1;
const METRIC_TYPE_COMPONENT_ACTIVITY: u32 = 2;

/// Lowest firmware power state of each reported TPU state on Janeiro
pub const JANEIRO_TPU_STATES: &[u32] = &[4, 5, 6];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageComponent {
    Device = 0,
    Tpu = 1,
}

impl UsageComponent {
    pub const COUNT: usize = 2;

    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Device),
            1 => Some(Self::Tpu),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageMetric {
    TpuUsage {
        uid: i32,
        duration_us: u32,
        power_state: u32,
    },
    ComponentActivity {
        component: i32,
        utilization: i32,
    },
    Unknown {
        kind: u32,
    },
}

impl UsageMetric {
    /// Decode one record; `record` must be [`USAGE_METRIC_SIZE`] bytes
    pub fn decode(record: &[u8]) -> Self {
        let word = |at: usize| {
            u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]])
        };
        match word(0) {
            METRIC_TYPE_TPU_USAGE => Self::TpuUsage {
                uid: word(8) as i32,
                duration_us: word(12),
                power_state: word(16),
            },
            METRIC_TYPE_COMPONENT_ACTIVITY => Self::ComponentActivity {
                component: word(8) as i32,
                utilization: word(12) as i32,
            },
            kind => Self::Unknown { kind },
        }
    }
}

#[derive(Debug, Default)]
struct Stats {
    time_in_state: BTreeMap<i32, Vec<u64>>,
    utilization: [i32; UsageComponent::COUNT],
}

/// Accumulated usage of one device
#[derive(Debug)]
pub struct UsageStats {
    states: &'static [u32],
    stats: Mutex<Stats>,
}

impl UsageStats {
    /// `states` holds the lowest firmware power state of each reported
    /// state, ascending
    pub fn new(states: &'static [u32]) -> Self {
        Self {
            states,
            stats: Mutex::new(Stats::default()),
        }
    }

    fn state_index(&self, power_state: u32) -> usize {
        self.states
            .iter()
            .rposition(|&lowest| power_state >= lowest)
            .unwrap_or(0)
    }

    /// Fold one reply into the totals
    ///
    /// Returns the number of metrics applied.
    pub fn process(&self, report: &UsageReport) -> usize {
        if report.metric_size as usize != USAGE_METRIC_SIZE {
            log::debug!(
                "usage: metric size {} != {}, discarding",
                report.metric_size,
                USAGE_METRIC_SIZE
            );
            return 0;
        }
        let mut stats = lock(&self.stats);
        let mut applied = 0;
        for (i, record) in report.metrics().enumerate() {
            match UsageMetric::decode(record) {
                UsageMetric::TpuUsage {
                    uid,
                    duration_us,
                    power_state,
                } => {
                    let state = self.state_index(power_state);
                    let times = stats
                        .time_in_state
                        .entry(uid)
                        .or_insert_with(|| vec![0; self.states.len().max(1)]);
                    times[state] += u64::from(duration_us);
                    applied += 1;
                }
                UsageMetric::ComponentActivity {
                    component,
                    utilization,
                } => {
                    if let Some(component) = UsageComponent::from_raw(component) {
                        if utilization != 0 {
                            stats.utilization[component as usize] = utilization;
                        }
                    }
                    applied += 1;
                }
                UsageMetric::Unknown { kind } => {
                    log::debug!("usage: metric {i}: skipping unknown type {kind}");
                }
            }
        }
        applied
    }

    /// Fetch a reply from the firmware and fold it in
    ///
    /// Firmware without usage reporting leaves the totals untouched.
    pub fn update(&self, kci: &Kci) -> Result<()> {
        if let Some(report) = kci.get_usage()? {
            self.process(&report);
        }
        Ok(())
    }

    /// Microseconds `uid` spent in each state
    pub fn time_in_state(&self, uid: i32) -> Option<Vec<u64>> {
        lock(&self.stats).time_in_state.get(&uid).cloned()
    }

    pub fn uids(&self) -> Vec<i32> {
        lock(&self.stats).time_in_state.keys().copied().collect()
    }

    /// Latest utilization percent of `component`, cleared by the read
    pub fn take_utilization(&self, component: UsageComponent) -> i32 {
        std::mem::take(&mut lock(&self.stats).utilization[component as usize])
    }

    /// Forget every uid's totals
    pub fn clear(&self) {
        lock(&self.stats).time_in_state.clear();
    }
}
