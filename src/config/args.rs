//! Command-line argument parsing for NLCG runs

use clap::Parser;

/// NLCG electronic-structure optimization with YAML configuration
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the backend engine configuration (passed through untouched)
    #[arg(short = 's', long, default_value = "sirius.json")]
    pub sirius_config: String,

    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "nlcg.yaml")]
    pub input: String,

    /// Dump raw optimizer state when the engine fails
    #[arg(short = 'e', long)]
    pub dump_on_error: bool,

    /// Log file (default stdout)
    #[arg(short, long)]
    pub output: Option<String>,
}
