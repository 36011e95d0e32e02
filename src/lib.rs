//! Recipe engine for trainsh-Doppio: TOML recipes describing step graphs,
//! executed interactively against a target host.

pub mod config;
pub mod error;
pub mod recipe;

pub use error::AppError;
