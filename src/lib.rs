//! Asset deduplication cache and download-session broker for generated
//! marketing creative.

pub mod assets;
pub mod batch;
pub mod bundle;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod session;
pub mod similarity;
pub mod web;

pub use error::{Error, Result};
