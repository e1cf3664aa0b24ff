//! NLCG Run Launcher
//!
//! Command-line entry point that configures and launches a nonlinear
//! conjugate-gradient electronic-structure optimization through an
//! external DFT engine.

use color_eyre::eyre::Result;
use nlcg::app::NlcgApplication;

fn main() -> Result<()> {
    color_eyre::install()?;
    NlcgApplication::from_cli()?.run()
}
