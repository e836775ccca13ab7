//! Layered run configuration.
//!
//! This module provides:
//! - A YAML configuration tree with explicit overlay semantics
//! - `${path}` interpolation and `${eval:'...'}` arithmetic over a closed grammar
//! - Typed views of the sections the session consumes
//! - The packaged base configuration

pub mod compose;
pub mod expr;
pub mod schema;
pub mod tree;

use std::path::PathBuf;

use thiserror::Error;

pub use compose::compose;
pub use tree::ConfigTree;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML{}: {source}", origin_suffix(.origin))]
    Parse {
        origin: Option<PathBuf>,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("missing config key '{0}'")]
    MissingKey(String),
    #[error("config key '{key}' has an unexpected shape: {source}")]
    Shape {
        key: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("cannot interpolate '{0}': interpolation nests deeper than the limit (cycle?)")]
    InterpolationDepth(String),
    #[error("malformed interpolation in '{0}'")]
    MalformedInterpolation(String),
    #[error("interpolation '{key}' must resolve to a scalar when embedded in text")]
    NonScalarInterpolation { key: String },
    #[error("cannot evaluate '{expr}': {source}")]
    Expr {
        expr: String,
        #[source]
        source: expr::ExprError,
    },
    #[error("unknown configuration '{0}'")]
    UnknownConfig(String),
}

fn origin_suffix(origin: &Option<PathBuf>) -> String {
    match origin {
        Some(p) => format!(" in {}", p.display()),
        None => String::new(),
    }
}
