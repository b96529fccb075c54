//! Simulated-annealing bundler
//!
//! Samples performance per bundle size. Once the current size has seen
//! enough tasks, the best size so far is taken as a centre and a random,
//! untried neighbour is explored; the neighbourhood shrinks as more sizes are
//! tried. When no untried neighbour turns up, the best size is kept until its
//! mean drifts, which restarts the search.

use crate::balancer::bundler::{Bundler, BundlerBase};
use crate::balancer::context::GridContext;
use crate::balancer::persistence::BundlerState;
use crate::balancer::profile::{AnnealingProfile, LoadBalancingProfile};
use crate::core::utils::clamp_size;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Tasks and total time observed at one bundle size
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeStats {
    total_time: f64,
    tasks: usize,
}

impl SizeStats {
    fn add(&mut self, tasks: usize, total_time: f64) {
        self.tasks += tasks;
        self.total_time += total_time;
    }

    fn mean(&self) -> f64 {
        if self.tasks == 0 {
            f64::INFINITY
        } else {
            self.total_time / self.tasks as f64
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StableWatch {
    mean: f64,
    window: SizeStats,
}

/// Bundler searching the best size by random exploration
#[derive(Debug)]
pub struct AutoTunedBundler {
    base: BundlerBase,
    profile: AnnealingProfile,
    rng: StdRng,
    current_size: usize,
    samples: BTreeMap<usize, SizeStats>,
    stable: Option<StableWatch>,
}

impl AutoTunedBundler {
    /// Create a bundler starting at the profile's size
    pub fn new(profile: AnnealingProfile, context: Option<Arc<dyn GridContext>>) -> Self {
        let size = profile.size;
        Self::build(profile, BundlerBase::new(context), StdRng::from_os_rng(), size)
    }

    /// Same as [`AutoTunedBundler::new`] with a deterministic random sequence
    pub fn with_seed(
        profile: AnnealingProfile,
        context: Option<Arc<dyn GridContext>>,
        seed: u64,
    ) -> Self {
        let size = profile.size;
        Self::build(profile, BundlerBase::new(context), StdRng::seed_from_u64(seed), size)
    }

    fn build(profile: AnnealingProfile, base: BundlerBase, rng: StdRng, size: usize) -> Self {
        Self {
            base,
            profile,
            rng,
            current_size: size.max(1),
            samples: BTreeMap::new(),
            stable: None,
        }
    }

    /// Whether the search settled on a size
    pub fn is_stable(&self) -> bool {
        self.stable.is_some()
    }

    /// Number of distinct sizes with recorded samples
    pub fn tried_sizes(&self) -> usize {
        self.samples.len()
    }

    fn best_size(&self) -> Option<(usize, f64)> {
        self.samples
            .iter()
            .map(|(size, stats)| (*size, stats.mean()))
            .fold(None, |best, (size, mean)| match best {
                Some((_, best_mean)) if best_mean <= mean => best,
                _ => Some((size, mean)),
            })
    }

    fn perform_analysis(&mut self) {
        let Some((best, best_mean)) = self.best_size() else {
            return;
        };
        let max = self.max_size();
        let best = clamp_size(best, max);

        for _ in 0..self.profile.max_guess_to_stable {
            let diff = self
                .profile
                .create_diff(best, self.samples.len(), self.rng.random::<f64>());
            let candidate = if diff < best && self.rng.random_bool(0.5) {
                best - diff
            } else {
                best.saturating_add(diff)
            };
            let candidate = clamp_size(candidate, max);
            if !self.samples.contains_key(&candidate) {
                debug!(
                    "Bundler#{}: best size {} (mean {:.3}), exploring {}",
                    self.base.number, best, best_mean, candidate
                );
                self.current_size = candidate;
                return;
            }
        }

        info!(
            "Bundler#{}: bundle size stable at {} (mean {:.3})",
            self.base.number, best, best_mean
        );
        self.current_size = best;
        self.stable = Some(StableWatch {
            mean: best_mean,
            window: SizeStats::default(),
        });
    }

    fn check_convergence(&mut self, tasks: usize, total_time: f64) {
        let Some(watch) = self.stable.as_mut() else {
            return;
        };
        watch.window.add(tasks, total_time);
        if watch.window.tasks < self.profile.min_samples_to_check_convergence {
            return;
        }

        let current = watch.window.mean();
        let drift = if watch.mean > 0.0 {
            (current - watch.mean).abs() / watch.mean
        } else if current > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        if drift > self.profile.max_deviation {
            info!(
                "Bundler#{}: mean drifted by {:.1}%, restarting the search",
                self.base.number,
                drift * 100.0
            );
            self.samples.clear();
            self.stable = None;
        } else {
            watch.window = SizeStats::default();
        }
    }
}

impl Bundler for AutoTunedBundler {
    fn algorithm(&self) -> &'static str {
        "autotuned"
    }

    fn bundle_size(&self) -> usize {
        clamp_size(self.current_size, self.max_size())
    }

    fn feedback(&mut self, sample_count: usize, total_time: f64) {
        if sample_count == 0 || !total_time.is_finite() || total_time < 0.0 {
            return;
        }
        let size = self.bundle_size();
        self.current_size = size;
        let stats = self.samples.entry(size).or_default();
        stats.add(sample_count, total_time);
        let ready = stats.tasks >= self.profile.min_samples_to_analyse;

        if self.stable.is_some() {
            self.check_convergence(sample_count, total_time);
        } else if ready {
            self.perform_analysis();
        }
    }

    fn copy(&self) -> Box<dyn Bundler> {
        Box::new(Self::build(
            self.profile.clone(),
            self.base.renumbered(),
            StdRng::from_os_rng(),
            self.bundle_size(),
        ))
    }

    fn max_size(&self) -> usize {
        self.base.max_size()
    }

    fn profile(&self) -> LoadBalancingProfile {
        LoadBalancingProfile::AutoTuned(self.profile.clone())
    }

    fn bundler_number(&self) -> u64 {
        self.base.number
    }

    fn state(&self) -> Option<BundlerState> {
        Some(BundlerState::Autotuned {
            bundle_size: self.current_size,
            samples: self.samples.iter().map(|(size, stats)| (*size, *stats)).collect(),
        })
    }

    fn restore(&mut self, state: BundlerState) -> bool {
        let BundlerState::Autotuned { bundle_size, samples } = state else {
            return false;
        };
        // the search resumes where it stopped; stability is re-established
        self.current_size = bundle_size.max(1);
        self.samples = samples.into_iter().collect();
        self.stable = None;
        true
    }
}
