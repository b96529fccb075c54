//! Load-balancing profiles
//!
//! A profile is the immutable parameter set of one bundling algorithm. It is
//! read once from a [`TypedProperties`] table and validated up front, so a bad
//! parameter fails at construction rather than during dispatch.

use crate::core::config::TypedProperties;
use crate::core::error::BalancerError;
use serde::{Deserialize, Serialize};

type ProfileResult<T> = std::result::Result<T, BalancerError>;

/// Parameters of the fixed-size bundler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedSizeProfile {
    /// Constant bundle size
    pub size: usize,
}

/// Parameters of the node-threads bundler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeThreadsProfile {
    /// Tasks per processing thread
    pub multiplicator: usize,
}

/// Parameters of the proportional bundler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProportionalProfile {
    /// Moving-average window, in tasks
    pub performance_cache_size: usize,
    /// Exponent applied to the inverse mean times
    pub proportionality_factor: f64,
    /// Bundle size used until the first feedback
    pub initial_size: usize,
    /// Mean time assumed for a node that has not reported yet
    pub initial_mean_time: f64,
}

/// Parameters of the annealing ("autotuned") bundler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnealingProfile {
    /// Initial bundle size
    pub size: usize,
    /// Tasks to observe at one size before exploring another
    pub min_samples_to_analyse: usize,
    /// Tasks to observe at a stable size before checking for drift
    pub min_samples_to_check_convergence: usize,
    /// Relative drift of the stable mean that restarts the exploration
    pub max_deviation: f64,
    /// Attempts at finding an untried size before declaring the best one stable
    pub max_guess_to_stable: usize,
    /// Size of the neighbourhood explored around the best size, relative to it
    pub size_ratio_deviation: f64,
    /// Exponential shrink rate of the neighbourhood per tried size
    pub decrease_ratio: f64,
}

/// Parameters of the step-search ("rl") bundler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlProfile {
    /// Moving-average window, in tasks
    pub performance_cache_size: usize,
    /// Relative mean variation below which the current action is kept
    pub performance_variation_threshold: f64,
    /// Largest change applied to the bundle size in one step
    pub max_action_range: usize,
}

/// Profile of one of the available bundling algorithms
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum LoadBalancingProfile {
    /// Constant size
    Manual(FixedSizeProfile),
    /// Size derived from the node's thread count
    NodeThreads(NodeThreadsProfile),
    /// Size proportional to relative node speed
    Proportional(ProportionalProfile),
    /// Simulated-annealing search
    AutoTuned(AnnealingProfile),
    /// Step search on the moving mean
    Rl(RlProfile),
}

impl Default for FixedSizeProfile {
    fn default() -> Self {
        Self { size: 1 }
    }
}

impl Default for NodeThreadsProfile {
    fn default() -> Self {
        Self { multiplicator: 1 }
    }
}

impl Default for ProportionalProfile {
    fn default() -> Self {
        Self {
            performance_cache_size: 3000,
            proportionality_factor: 2.0,
            initial_size: 1,
            initial_mean_time: 1e9,
        }
    }
}

impl Default for AnnealingProfile {
    fn default() -> Self {
        Self {
            size: 5,
            min_samples_to_analyse: 500,
            min_samples_to_check_convergence: 300,
            max_deviation: 0.2,
            max_guess_to_stable: 10,
            size_ratio_deviation: 1.5,
            decrease_ratio: 0.2,
        }
    }
}

impl Default for RlProfile {
    fn default() -> Self {
        Self {
            performance_cache_size: 2000,
            performance_variation_threshold: 0.0001,
            max_action_range: 10,
        }
    }
}

fn positive_usize(props: &TypedProperties, key: &str, default: usize) -> ProfileResult<usize> {
    let value = props.get_usize(key, default)?;
    if value == 0 {
        return Err(BalancerError::invalid_profile(key, "must be at least 1"));
    }
    Ok(value)
}

fn positive_f64(props: &TypedProperties, key: &str, default: f64) -> ProfileResult<f64> {
    let value = props.get_f64(key, default)?;
    if !value.is_finite() || value <= 0.0 {
        return Err(BalancerError::invalid_profile(
            key,
            format!("must be a finite number > 0, got {}", value),
        ));
    }
    Ok(value)
}

fn non_negative_f64(props: &TypedProperties, key: &str, default: f64) -> ProfileResult<f64> {
    let value = props.get_f64(key, default)?;
    if !value.is_finite() || value < 0.0 {
        return Err(BalancerError::invalid_profile(
            key,
            format!("must be a finite number >= 0, got {}", value),
        ));
    }
    Ok(value)
}

impl FixedSizeProfile {
    /// Read and validate from a property table
    pub fn from_properties(props: &TypedProperties) -> ProfileResult<Self> {
        let d = Self::default();
        Ok(Self {
            size: positive_usize(props, "size", d.size)?,
        })
    }
}

impl NodeThreadsProfile {
    /// Read and validate from a property table
    pub fn from_properties(props: &TypedProperties) -> ProfileResult<Self> {
        let d = Self::default();
        Ok(Self {
            multiplicator: positive_usize(props, "multiplicator", d.multiplicator)?,
        })
    }
}

impl ProportionalProfile {
    /// Read and validate from a property table
    pub fn from_properties(props: &TypedProperties) -> ProfileResult<Self> {
        let d = Self::default();
        Ok(Self {
            performance_cache_size: positive_usize(props, "performanceCacheSize", d.performance_cache_size)?,
            proportionality_factor: positive_f64(props, "proportionalityFactor", d.proportionality_factor)?,
            initial_size: positive_usize(props, "initialSize", d.initial_size)?,
            initial_mean_time: positive_f64(props, "initialMeanTime", d.initial_mean_time)?,
        })
    }
}

impl AnnealingProfile {
    /// Read and validate from a property table
    pub fn from_properties(props: &TypedProperties) -> ProfileResult<Self> {
        let d = Self::default();
        Ok(Self {
            size: positive_usize(props, "size", d.size)?,
            min_samples_to_analyse: positive_usize(props, "minSamplesToAnalyse", d.min_samples_to_analyse)?,
            min_samples_to_check_convergence: positive_usize(
                props,
                "minSamplesToCheckConvergence",
                d.min_samples_to_check_convergence,
            )?,
            max_deviation: positive_f64(props, "maxDeviation", d.max_deviation)?,
            max_guess_to_stable: positive_usize(props, "maxGuessToStable", d.max_guess_to_stable)?,
            size_ratio_deviation: positive_f64(props, "sizeRatioDeviation", d.size_ratio_deviation)?,
            decrease_ratio: non_negative_f64(props, "decreaseRatio", d.decrease_ratio)?,
        })
    }

    /// Random distance from the best size, shrinking as more sizes are tried
    pub(crate) fn create_diff(&self, best_size: usize, tried_sizes: usize, rnd: f64) -> usize {
        let span = (best_size as f64 * self.size_ratio_deviation).round().max(1.0);
        let decay = (-self.decrease_ratio * tried_sizes as f64).exp();
        (rnd * span * decay).round() as usize
    }
}

impl RlProfile {
    /// Read and validate from a property table
    pub fn from_properties(props: &TypedProperties) -> ProfileResult<Self> {
        let d = Self::default();
        Ok(Self {
            performance_cache_size: positive_usize(props, "performanceCacheSize", d.performance_cache_size)?,
            performance_variation_threshold: non_negative_f64(
                props,
                "performanceVariationThreshold",
                d.performance_variation_threshold,
            )?,
            max_action_range: positive_usize(props, "maxActionRange", d.max_action_range)?,
        })
    }
}

impl LoadBalancingProfile {
    /// Algorithm names accepted by [`LoadBalancingProfile::from_properties`]
    pub const ALGORITHMS: &'static [&'static str] =
        &["manual", "nodethreads", "proportional", "autotuned", "rl"];

    /// Build the profile of `algorithm` from a property table
    pub fn from_properties(algorithm: &str, props: &TypedProperties) -> ProfileResult<Self> {
        match algorithm.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(Self::Manual(FixedSizeProfile::from_properties(props)?)),
            "nodethreads" => Ok(Self::NodeThreads(NodeThreadsProfile::from_properties(props)?)),
            "proportional" => Ok(Self::Proportional(ProportionalProfile::from_properties(props)?)),
            "autotuned" => Ok(Self::AutoTuned(AnnealingProfile::from_properties(props)?)),
            "rl" => Ok(Self::Rl(RlProfile::from_properties(props)?)),
            _ => Err(BalancerError::UnknownAlgorithm(algorithm.to_string())),
        }
    }

    /// Name of the algorithm this profile configures
    pub fn algorithm(&self) -> &'static str {
        match self {
            Self::Manual(_) => "manual",
            Self::NodeThreads(_) => "nodethreads",
            Self::Proportional(_) => "proportional",
            Self::AutoTuned(_) => "autotuned",
            Self::Rl(_) => "rl",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_table() {
        let props = TypedProperties::new();
        for name in LoadBalancingProfile::ALGORITHMS {
            let profile = LoadBalancingProfile::from_properties(name, &props).unwrap();
            assert_eq!(profile.algorithm(), *name);
        }
        assert_eq!(
            LoadBalancingProfile::from_properties("proportional", &props).unwrap(),
            LoadBalancingProfile::Proportional(ProportionalProfile::default())
        );
    }

    #[test]
    fn test_reads_parameters() {
        let props = TypedProperties::new()
            .set_int("performanceCacheSize", 50)
            .set_float("proportionalityFactor", 1.5);
        let profile = ProportionalProfile::from_properties(&props).unwrap();
        assert_eq!(profile.performance_cache_size, 50);
        assert_eq!(profile.proportionality_factor, 1.5);
        assert_eq!(profile.initial_size, 1);
    }

    #[test]
    fn test_invalid_parameters_fail_fast() {
        let props = TypedProperties::new().set_int("proportionalityFactor", 0);
        let err = ProportionalProfile::from_properties(&props).unwrap_err();
        assert!(matches!(err, BalancerError::InvalidProfile { ref param, .. } if param == "proportionalityFactor"));

        let props = TypedProperties::new().set_int("size", 0);
        assert!(FixedSizeProfile::from_properties(&props).is_err());

        let props = TypedProperties::new().set_str("multiplicator", "many");
        assert!(NodeThreadsProfile::from_properties(&props).is_err());

        let props = TypedProperties::new().set_float("decreaseRatio", -0.1);
        assert!(AnnealingProfile::from_properties(&props).is_err());
    }

    #[test]
    fn test_unknown_algorithm() {
        let err = LoadBalancingProfile::from_properties("roundrobin", &TypedProperties::new()).unwrap_err();
        assert!(matches!(err, BalancerError::UnknownAlgorithm(ref name) if name == "roundrobin"));
    }

    #[test]
    fn test_create_diff_shrinks_with_tried_sizes() {
        let profile = AnnealingProfile::default();
        // span = round(10 * 1.5) = 15
        assert_eq!(profile.create_diff(10, 0, 1.0), 15);
        assert!(profile.create_diff(10, 10, 1.0) < 15);
        assert_eq!(profile.create_diff(10, 3, 0.0), 0);
    }
}
