pub mod fit;

use clap::{Parser, Subcommand};

pub use fit::{FitArgs, ModelType};

#[derive(Parser)]
#[command(name = "bayesflow")]
#[command(about = "Simulate and fit Bayesian network models by variational inference")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Simulate data from a model and fit its posterior back
    Fit(FitArgs),
}
