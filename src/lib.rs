//! # apkclone
//!
//! A library for cloning Android APKs under a new package name, with
//! optional redirection of device-identity calls to embedded stubs and
//! re-signing with a persistent key.
//!
pub mod apk;
pub mod cloner;
pub mod config;
pub mod dex;
pub mod error;
pub mod hook;
pub mod sign;
mod tests;

pub use cloner::{CloneOutcome, ClonePipeline};
pub use config::{clone_package_name, CloneConfig};
pub use error::{CloneError, CloneResult};
