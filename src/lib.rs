//! Text to image showcase job.
//!
//! Resolves the latest sequence model artifact, generates candidate images
//! for a fixed set of prompts on every available device, keeps the best ones
//! according to CLIP and logs one captioned strip per prompt.
pub mod app;
pub mod config;
pub mod device;
mod error;
pub mod generator;
pub mod loader;
pub mod models;
pub mod ranker;
pub mod reporter;
pub mod resolver;
pub mod strip;
pub mod tracking;

pub use error::{Error, ErrorKind, Result};
