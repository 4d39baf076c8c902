//! # avdrig-core
//!
//! Lifecycle orchestration for Android emulator test devices.
//!
//! This crate provisions, boots, verifies, provisions software onto, and
//! tears down a virtual device by driving the Android SDK command-line tools
//! and a companion automation server as black-box processes.
//!
//! ## Modules
//!
//! - [`process`] - Command-vector process runner with concurrent stream draining
//! - [`drain`] - Line-oriented output drains, one task per stream
//! - [`poll`] - Fixed-interval readiness polling and device probes
//! - [`toolchain`] - SDK tool resolution and exact tool command vectors
//! - [`image`] - System image mirroring from a local cache
//! - [`registry`] - Idempotent virtual device creation
//! - [`session`] - Device session state machine and per-name leases
//! - [`companion`] - Companion automation server supervision
//! - [`config`] - JSON configuration with defaults
//! - [`orchestrator`] - Ordered setup and best-effort teardown
//! - [`error`] - The error taxonomy
//!
//! ## External Dependencies
//!
//! At runtime the following must be installed:
//!
//! - **Android SDK** command-line tools: `adb`, `emulator`, `avdmanager`
//! - **Appium** (or another server with an HTTP `/status` endpoint)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use avdrig_core::config::OrchestratorConfig;
//! use avdrig_core::orchestrator::Orchestrator;
//! use avdrig_core::process::TokioProcessRunner;
//! use avdrig_core::session::SessionRegistry;
//!
//! # async fn example() -> Result<(), avdrig_core::error::OrchestratorError> {
//! let config = OrchestratorConfig::load_default()?;
//! let mut orchestrator = Orchestrator::new(config, Arc::new(TokioProcessRunner), SessionRegistry::default())?;
//! orchestrator.setup().await?;
//! // ... run tests against the device ...
//! let report = orchestrator.teardown().await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

pub mod companion;
pub mod config;
pub mod drain;
pub mod error;
pub mod image;
pub mod orchestrator;
pub mod poll;
pub mod process;
pub mod registry;
pub mod session;
pub mod toolchain;
