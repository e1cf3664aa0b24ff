//! Configuration management for NLCG runs
//!
//! This module handles the launcher-side configuration: the `CG` section
//! with its defaults and validation, and the passthrough sections that only
//! the engine interprets.

mod args;

pub use args::Args;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Error raised when the `CG` section fails validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown CG method: {0} (expected FR or PR)")]
    UnknownMethod(String),
    #[error("CG parameter {name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: f64 },
    #[error("CG parameter tau must lie in (0, 1), got {0}")]
    TauOutOfRange(f64),
    #[error("CG parameter temperature must be non-negative, got {0}")]
    NegativeTemperature(f64),
    #[error("CG parameter callback_interval must be positive")]
    ZeroCallbackInterval,
    #[error("CG parameter {0} must be positive")]
    ZeroIterations(&'static str),
}

/// Parsed run configuration.
///
/// Only the `CG` section is interpreted here; every other top-level section
/// is retained verbatim and handed to the engine.
#[derive(Debug, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(rename = "CG")]
    pub cg: CgParams,
    #[serde(flatten)]
    pub extra: serde_yml::Mapping,
}

impl RunConfig {
    /// Replace the parsed `CG` section with its validated, defaulted form.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        self.cg = self.cg.with_defaults().validated()?;
        Ok(self)
    }
}

/// Conjugate-gradient search direction formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgMethod {
    FletcherReeves,
    PolakRibiere,
}

impl FromStr for CgMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FR" => Ok(Self::FletcherReeves),
            "PR" => Ok(Self::PolakRibiere),
            _ => Err(ConfigError::UnknownMethod(s.to_string())),
        }
    }
}

/// NLCG hyperparameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CgParams {
    pub method: Option<String>,
    pub maxiter: Option<usize>,
    pub restart: Option<usize>,
    pub tau: Option<f64>,
    pub tol: Option<f64>,
    pub kappa: Option<f64>,
    pub temperature: Option<f64>,
    pub callback_interval: Option<usize>,
}

impl Default for CgParams {
    fn default() -> Self {
        CgParams {
            method: Some("FR".to_string()),
            maxiter: Some(300),
            restart: Some(20),
            tau: Some(0.1),
            tol: Some(1e-9),
            kappa: Some(0.3),
            temperature: Some(300.0),
            callback_interval: Some(50),
        }
    }
}

impl CgParams {
    /// Apply default values to any missing parameters
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.method.is_none() {
            self.method = defaults.method;
        }
        if self.maxiter.is_none() {
            self.maxiter = defaults.maxiter;
        }
        if self.restart.is_none() {
            self.restart = defaults.restart;
        }
        if self.tau.is_none() {
            self.tau = defaults.tau;
        }
        if self.tol.is_none() {
            self.tol = defaults.tol;
        }
        if self.kappa.is_none() {
            self.kappa = defaults.kappa;
        }
        if self.temperature.is_none() {
            self.temperature = defaults.temperature;
        }
        if self.callback_interval.is_none() {
            self.callback_interval = defaults.callback_interval;
        }
        self
    }

    /// Check every parameter against its admissible range.
    ///
    /// Meant to run after `with_defaults`; parameters still unset are
    /// skipped rather than defaulted here.
    pub fn validated(self) -> Result<Self, ConfigError> {
        if let Some(ref method) = self.method {
            CgMethod::from_str(method)?;
        }
        if self.maxiter == Some(0) {
            return Err(ConfigError::ZeroIterations("maxiter"));
        }
        if self.restart == Some(0) {
            return Err(ConfigError::ZeroIterations("restart"));
        }
        if let Some(tau) = self.tau {
            if tau <= 0.0 || tau >= 1.0 {
                return Err(ConfigError::TauOutOfRange(tau));
            }
        }
        if let Some(tol) = self.tol {
            if tol <= 0.0 {
                return Err(ConfigError::NonPositive {
                    name: "tol",
                    value: tol,
                });
            }
        }
        if let Some(kappa) = self.kappa {
            if kappa <= 0.0 {
                return Err(ConfigError::NonPositive {
                    name: "kappa",
                    value: kappa,
                });
            }
        }
        if let Some(temperature) = self.temperature {
            if temperature < 0.0 {
                return Err(ConfigError::NegativeTemperature(temperature));
            }
        }
        if self.callback_interval == Some(0) {
            return Err(ConfigError::ZeroCallbackInterval);
        }
        Ok(self)
    }

    /// Get the search direction method
    pub fn method(&self) -> CgMethod {
        self.method
            .as_deref()
            .and_then(|s| CgMethod::from_str(s).ok())
            .unwrap_or(CgMethod::FletcherReeves)
    }

    /// Get the checkpoint interval in iterations
    pub fn callback_interval(&self) -> usize {
        self.callback_interval.unwrap_or(50)
    }

    /// Get the iteration cap
    pub fn maxiter(&self) -> usize {
        self.maxiter.unwrap_or(300)
    }
}
