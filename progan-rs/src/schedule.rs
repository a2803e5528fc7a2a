//! Stage schedule and training state.
//!
//! The run is split into `max_stage + 1` stages, each working at twice the spatial
//! resolution of the previous one (`4 * 2^stage`). Every stage is given a share of the
//! epoch budget; within a stage the blend coefficient ramps from 0 to 1 over the first
//! half of the stage, fading the new resolution in.
//!
//! [`StageSchedule::advance`] is pure: it takes the current [`TrainingState`] and returns
//! the next one, so the state machine can be tested without any network.

use serde::{Deserialize, Serialize};

use crate::error::{ProGanError, Result};

/// Relative stage weights for the fibonacci-like policy.
pub const FIBONACCI_WEIGHTS: [f64; 9] = [3.0, 3.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0, 55.0];

/// Spatial resolution of the first stage.
pub const BASE_RESOLUTION: usize = 4;

/// How the epoch budget is split across stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePolicy {
    /// Every stage gets the same number of epochs.
    #[default]
    #[serde(alias = "linear")]
    Uniform,
    /// Later (higher resolution) stages get more epochs.
    Fibonacci,
}

impl SchedulePolicy {
    /// Relative weights for `stages` stages.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the fibonacci sequence is shorter than `stages`.
    pub fn weights(self, stages: usize) -> Result<Vec<f64>> {
        match self {
            Self::Uniform => Ok(vec![1.0; stages]),
            Self::Fibonacci => {
                if stages > FIBONACCI_WEIGHTS.len() {
                    return Err(ProGanError::config(format!(
                        "fibonacci schedule supports at most {} stages (max_stages <= {}), got {}",
                        FIBONACCI_WEIGHTS.len(),
                        FIBONACCI_WEIGHTS.len() - 1,
                        stages
                    )));
                }
                Ok(FIBONACCI_WEIGHTS[..stages].to_vec())
            }
        }
    }
}

impl std::str::FromStr for SchedulePolicy {
    type Err = ProGanError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" | "linear" => Ok(Self::Uniform),
            "fibonacci" => Ok(Self::Fibonacci),
            other => Err(ProGanError::config(format!(
                "unknown stage schedule '{other}' (expected uniform or fibonacci)"
            ))),
        }
    }
}

/// Position of the run inside the stage schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current stage, `0..=max_stage`.
    pub stage: usize,
    /// Epochs spent in the current stage.
    pub progress: usize,
    /// Fade-in coefficient in `[0, 1]`.
    pub blend: f64,
    /// Total epoch budget of the run.
    pub total_epochs: usize,
}

impl TrainingState {
    /// Working resolution of the current stage.
    pub fn resolution(&self) -> usize {
        resolution_for(self.stage)
    }
}

/// Spatial resolution of `stage`.
pub fn resolution_for(stage: usize) -> usize {
    BASE_RESOLUTION << stage
}

/// Per-stage epoch allocation, fixed for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    policy: SchedulePolicy,
    max_stage: usize,
    total_epochs: usize,
    allocations: Vec<usize>,
}

impl StageSchedule {
    /// Split `total_epochs` over `max_stage + 1` stages.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the budget does not exceed `2 * max_stage`,
    /// if any stage would get zero epochs, or if the policy cannot cover the stage count.
    pub fn new(policy: SchedulePolicy, max_stage: usize, total_epochs: usize) -> Result<Self> {
        let min_budget = 2 * max_stage;
        if total_epochs <= min_budget {
            return Err(ProGanError::config(format!(
                "epoch budget {total_epochs} is too small for {} stages (needs more than {min_budget})",
                max_stage + 1
            )));
        }

        let weights = policy.weights(max_stage + 1)?;
        let sum: f64 = weights.iter().sum();
        let allocations: Vec<usize> = weights
            .iter()
            .map(|w| (total_epochs as f64 * w / sum) as usize)
            .collect();

        if let Some(stage) = allocations.iter().position(|&a| a == 0) {
            return Err(ProGanError::config(format!(
                "epoch budget {total_epochs} leaves stage {stage} with no epochs under the {policy:?} schedule"
            )));
        }

        tracing::info!("schedule of stage turning: {:?}", allocations);

        Ok(Self {
            policy,
            max_stage,
            total_epochs,
            allocations,
        })
    }

    /// Epochs allotted to each stage.
    pub fn allocations(&self) -> &[usize] {
        &self.allocations
    }

    /// Highest stage index.
    pub fn max_stage(&self) -> usize {
        self.max_stage
    }

    /// Configured total epoch budget.
    pub fn total_epochs(&self) -> usize {
        self.total_epochs
    }

    /// Weighting policy used to build the schedule.
    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    /// State at the start of training.
    pub fn initial_state(&self) -> TrainingState {
        TrainingState {
            stage: 0,
            progress: 0,
            blend: 0.0,
            total_epochs: self.total_epochs,
        }
    }

    /// Fully grown state used for inference.
    pub fn terminal_state(&self) -> TrainingState {
        TrainingState {
            stage: self.max_stage,
            progress: 0,
            blend: 1.0,
            total_epochs: self.total_epochs,
        }
    }

    /// Advance by one epoch.
    pub fn advance(&self, state: &TrainingState) -> TrainingState {
        let stage = state.stage.min(self.max_stage);
        let allocation = self.allocations[stage];
        let progress = state.progress + 1;

        let ramp = (2.0 * progress as f64 / allocation as f64).min(1.0);
        // blend never falls back once the terminal stage has saturated
        let blend = if stage == self.max_stage {
            ramp.max(state.blend)
        } else {
            ramp
        };

        let mut next = TrainingState {
            stage,
            progress,
            blend,
            total_epochs: state.total_epochs,
        };

        if progress > allocation {
            next.progress = 0;
            if stage < self.max_stage {
                next.stage = stage + 1;
                next.blend = 0.0;
                tracing::info!("turn to stage {}", next.stage);
            } else {
                next.blend = 1.0;
            }
        }

        tracing::debug!("new blend: {}, new stage: {}", next.blend, next.stage);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_allocations_sum_to_budget() {
        let schedule = StageSchedule::new(SchedulePolicy::Uniform, 6, 201).unwrap();
        let sum: usize = schedule.allocations().iter().sum();
        assert_eq!(schedule.allocations().len(), 7);
        assert!(sum <= 201 && 201 - sum <= 7);
        assert!(schedule.allocations().iter().all(|&a| a == 28));
    }

    #[test]
    fn test_fibonacci_allocations_increase() {
        let schedule = StageSchedule::new(SchedulePolicy::Fibonacci, 6, 560).unwrap();
        assert_eq!(schedule.allocations(), &[30, 30, 30, 50, 80, 130, 210]);
    }

    #[test]
    fn test_fibonacci_too_many_stages() {
        let err = StageSchedule::new(SchedulePolicy::Fibonacci, 9, 1000).unwrap_err();
        assert!(err.is_config());
        assert!(StageSchedule::new(SchedulePolicy::Uniform, 9, 1000).is_ok());
    }

    #[test]
    fn test_budget_too_small() {
        assert!(StageSchedule::new(SchedulePolicy::Uniform, 6, 12).is_err());
        assert!(StageSchedule::new(SchedulePolicy::Uniform, 6, 13).is_ok());
        // fibonacci at 13 epochs leaves the first stages empty
        assert!(StageSchedule::new(SchedulePolicy::Fibonacci, 6, 13).is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("linear".parse::<SchedulePolicy>().unwrap(), SchedulePolicy::Uniform);
        assert_eq!("fibonacci".parse::<SchedulePolicy>().unwrap(), SchedulePolicy::Fibonacci);
        assert!("cubic".parse::<SchedulePolicy>().is_err());
    }

    #[test]
    fn test_blend_ramps_within_stage() {
        let schedule = StageSchedule::new(SchedulePolicy::Uniform, 2, 30).unwrap();
        // 10 epochs per stage, blend reaches 1 halfway through
        let mut state = schedule.initial_state();
        let mut blends = Vec::new();
        for _ in 0..5 {
            state = schedule.advance(&state);
            blends.push(state.blend);
        }
        assert_eq!(blends, vec![0.2, 0.4, 0.6, 0.8, 1.0]);
        assert_eq!(state.stage, 0);
    }

    #[test]
    fn test_stage_increment_resets_blend() {
        let schedule = StageSchedule::new(SchedulePolicy::Uniform, 2, 30).unwrap();
        let mut state = schedule.initial_state();
        for _ in 0..10 {
            state = schedule.advance(&state);
        }
        assert_eq!(state.stage, 0);
        assert_eq!(state.blend, 1.0);

        state = schedule.advance(&state);
        assert_eq!(state.stage, 1);
        assert_eq!(state.progress, 0);
        assert_eq!(state.blend, 0.0);
    }

    #[test]
    fn test_invariants_over_long_run() {
        for policy in [SchedulePolicy::Uniform, SchedulePolicy::Fibonacci] {
            let schedule = StageSchedule::new(policy, 4, 97).unwrap();
            let mut state = schedule.initial_state();
            for _ in 0..500 {
                let next = schedule.advance(&state);
                assert!((0.0..=1.0).contains(&next.blend));
                assert!(next.stage >= state.stage);
                assert!(next.stage <= schedule.max_stage());
                if next.stage > state.stage {
                    assert_eq!(next.blend, 0.0);
                }
                state = next;
            }
            assert_eq!(state.stage, 4);
            assert_eq!(state.blend, 1.0);
        }
    }

    #[test]
    fn test_terminal_stage_stays_pinned() {
        let schedule = StageSchedule::new(SchedulePolicy::Uniform, 1, 8).unwrap();
        let mut state = schedule.initial_state();
        let mut saturated = false;
        for _ in 0..40 {
            state = schedule.advance(&state);
            if state.stage == 1 && state.blend == 1.0 {
                saturated = true;
            }
            if saturated {
                assert_eq!(state.blend, 1.0);
            }
        }
        assert!(saturated);
    }

    #[test]
    fn test_resolution_for_stage() {
        assert_eq!(resolution_for(0), 4);
        assert_eq!(resolution_for(6), 256);
        let schedule = StageSchedule::new(SchedulePolicy::Uniform, 3, 40).unwrap();
        assert_eq!(schedule.terminal_state().resolution(), 32);
    }
}
