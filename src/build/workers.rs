//! Build concurrency hint

use crate::config::schema::WorkerPolicy;
use rand::seq::SliceRandom;

/// CPUs available to one of `max_concurrent_builds` parallel builds
fn cpu_share(max_concurrent_builds: usize) -> usize {
    (num_cpus::get() / max_concurrent_builds.max(1)).max(1)
}

impl WorkerPolicy {
    /// Worker count handed to one build as the `workers` build argument
    pub fn workers(&self, max_concurrent_builds: usize) -> usize {
        let share = cpu_share(max_concurrent_builds);
        match self {
            Self::CpuShare => share,
            Self::Fixed { workers } => (*workers).max(1),
            Self::Sampled { choices } => choices
                .choose(&mut rand::thread_rng())
                .map(|n| (*n).clamp(1, share))
                .unwrap_or(share),
        }
    }
}
