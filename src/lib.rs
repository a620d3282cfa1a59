#![cfg_attr(docsrs, feature(doc_cfg))]
//! # smallbattmod_lib
//!
//! This crate provides a library for driving Bluefin SmallBattMod 1.5 kWh
//! batteries over an RS485 serial bus. The device speaks a line-oriented
//! ASCII command/response protocol; this crate covers the protocol layer
//! (framing, addressing, response grammars), a synchronous client built on
//! top of it, and an autonomous cell balancing controller.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `smallbattmod` command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the synchronous client and the balancing
//!   controller using the `serialport` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for the protocol record types.
//! - `bin-dependencies`: Enables all features required by the `smallbattmod`
//!   binary executable.

/// Contains error types for the library.
mod error;
/// Defines the ASCII wire protocol for the SmallBattMod.
pub mod protocol;

pub use error::{Error, Result};

/// Synchronous client for SmallBattMod communication.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Autonomous cell balancing controller.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod balancer;
