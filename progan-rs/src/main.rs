//! CLI entry point for progan-rs.

use std::path::Path;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use progan_rs::schedule::resolution_for;
use progan_rs::trainer::{sample, select_device, Trainer};
use progan_rs::{ProGanConfig, Result};

#[derive(Parser)]
#[command(name = "progan")]
#[command(about = "Progressive growing of GANs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file
    Validate {
        /// Path to configuration file
        config: String,
    },
    /// Start training
    Train {
        /// Path to configuration file
        config: String,
        /// Resume from checkpoint directory
        #[arg(long)]
        resume: Option<String>,
    },
    /// Generate a sample configuration file
    Init {
        /// Output path for config file
        #[arg(default_value = "config.yaml")]
        output: String,
        /// Preset (ffhq-256, celeba-128, tiny)
        #[arg(long, default_value = "celeba-128")]
        preset: String,
    },
    /// Write images from the averaged generator of a checkpoint
    Sample {
        /// Path to configuration file
        config: String,
        /// Checkpoint directory
        #[arg(long)]
        checkpoint: String,
        /// Output directory for images
        #[arg(long)]
        output: String,
        /// Number of images
        #[arg(long, default_value_t = 16)]
        count: usize,
    },
    /// Print the stage schedule of a configuration
    Schedule {
        /// Path to configuration file
        config: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => {
            tracing::info!("Validating configuration: {}", config);
            let config = ProGanConfig::from_file(&config)?;
            config.validate()?;
            println!("✓ Configuration is valid");
            println!(
                "  Image size: {} ({} stages)",
                config.model.crop_size,
                config.model.max_stages + 1
            );
            println!("  Gan mode: {}", config.training.gan_mode);
            println!("  Epochs: {}", config.training.total_epochs());
            println!("  Dataset: {}", config.dataset.path);
        }
        Commands::Train { config, resume } => {
            tracing::info!("Starting training with config: {}", config);
            let config = ProGanConfig::from_file(&config)?;
            config.validate()?;

            let mut trainer = Trainer::new(config)?;
            if let Some(checkpoint) = resume {
                trainer.resume_from(&checkpoint)?;
            }
            trainer.train()?;
        }
        Commands::Init { output, preset } => {
            tracing::info!("Generating config for preset: {}", preset);
            let config = ProGanConfig::from_preset(&preset)?;
            config.to_file(&output)?;
            println!("✓ Configuration written to: {output}");
        }
        Commands::Sample {
            config,
            checkpoint,
            output,
            count,
        } => {
            let config = ProGanConfig::from_file(&config)?;
            let device = select_device();
            let written = sample(&config, Path::new(&checkpoint), Path::new(&output), count, &device)?;
            println!("✓ Wrote {} images to: {output}", written.len());
        }
        Commands::Schedule { config } => {
            let config = ProGanConfig::from_file(&config)?;
            let schedule = config.stage_schedule()?;
            println!(
                "{:?} schedule over {} epochs:",
                schedule.policy(),
                schedule.total_epochs()
            );
            for (stage, epochs) in schedule.allocations().iter().enumerate() {
                let size = resolution_for(stage);
                println!("  stage {stage}: {size}x{size}, {epochs} epochs");
            }
        }
    }

    Ok(())
}
