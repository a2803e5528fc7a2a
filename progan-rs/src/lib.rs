//! # progan-rs
//!
//! Progressive growing of GANs on candle.
//!
//! Training starts at 4x4 and doubles the working resolution once per stage. Each stage
//! gets a share of the epoch budget, and within a stage a blend coefficient fades the new
//! resolution in against an up-sampled copy of the previous one.
//!
//! ## Features
//!
//! - **YAML Configuration** - Define entire training runs in simple config files
//! - **Stage schedules** - Uniform or fibonacci-weighted epoch allocation
//! - **Adversarial objectives** - `vanilla`, `lsgan`, `wgangp`, `relhinge`
//! - **Weight averaging** - Exponential moving average of the generator for sampling
//! - **Loss scaling** - Optional dynamic loss scaling per loss
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a config from a preset
//! progan init config.yaml --preset celeba-128
//!
//! # Validate configuration and print the stage schedule
//! progan validate config.yaml
//! progan schedule config.yaml
//!
//! # Start training
//! progan train config.yaml
//!
//! # Sample from a checkpoint
//! progan sample config.yaml --checkpoint ./outputs/checkpoint-latest --output ./samples
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use progan_rs::{ProGanConfig, Trainer};
//!
//! # fn main() -> progan_rs::Result<()> {
//! let config = ProGanConfig::from_file("config.yaml")?;
//! let mut trainer = Trainer::new(config)?;
//! trainer.train()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Stepping the schedule by hand
//!
//! ```rust
//! use progan_rs::{SchedulePolicy, StageSchedule};
//!
//! # fn main() -> progan_rs::Result<()> {
//! let schedule = StageSchedule::new(SchedulePolicy::Uniform, 2, 20)?;
//! let mut state = schedule.initial_state();
//! for _ in 0..20 {
//!     state = schedule.advance(&state);
//! }
//! assert_eq!(state.stage, 2);
//! assert_eq!(state.blend, 1.0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod dataset;
pub mod ema;
pub mod error;
pub mod loss;
pub mod model;
pub mod networks;
pub mod optimizer;
pub mod params;
pub mod resolution;
pub mod scaler;
pub mod schedule;
pub mod scheduler;
pub mod trainer;
pub mod visuals;

pub use config::{DatasetConfig, ModelConfig, ProGanConfig, TrainingConfig};
pub use error::{ProGanError, Result};
pub use loss::{GanMode, LossEngine};
pub use model::{LossRecord, Mode, ProGanModel, Visuals};
pub use schedule::{SchedulePolicy, StageSchedule, TrainingState};
pub use trainer::Trainer;
