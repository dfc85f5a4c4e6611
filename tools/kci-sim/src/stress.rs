//! Concurrent command load against one session
//!
//! Every worker thread issues a seeded random mix of ACK, FIRMWARE_INFO
//! and GET_USAGE. The run passes when every command got its own response
//! and nothing is left waiting.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tpu_kci::Kci;

#[derive(Debug, Clone, Copy)]
pub struct StressPlan {
    pub threads: usize,
    pub commands: usize,
    pub seed: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StressReport {
    pub sent: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl StressReport {
    pub fn per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            self.sent as f64 / secs
        }
    }
}

fn worker(kci: &Kci, commands: usize, seed: u64) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut failed = 0;
    for _ in 0..commands {
        let result = match rng.gen_range(0..3) {
            0 => kci.ack(),
            1 => kci.fw_info().map(drop),
            _ => kci.get_usage().map(drop),
        };
        if let Err(e) = result {
            log::warn!("stress: command failed: {e}");
            failed += 1;
        }
    }
    failed
}

pub fn run(kci: &Kci, plan: StressPlan) -> Result<StressReport> {
    let start = Instant::now();
    let failed = thread::scope(|s| {
        let workers: Vec<_> = (0..plan.threads)
            .map(|t| {
                let seed = plan.seed.wrapping_add(t as u64);
                s.spawn(move || worker(kci, plan.commands, seed))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or(plan.commands))
            .sum::<usize>()
    });

    let report = StressReport {
        sent: plan.threads * plan.commands,
        failed,
        elapsed: start.elapsed(),
    };
    if kci.pending() != 0 {
        bail!("{} commands still waiting after the run", kci.pending());
    }
    Ok(report)
}
