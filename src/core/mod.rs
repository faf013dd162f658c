//! Core types shared by every layer.
//!
//! This module contains:
//! - Default values and wire constants
//! - The error taxonomy
//! - Events, outbound messages and wire envelopes
//! - The transport traits

pub mod constants;
mod error;
mod event;
mod traits;

pub use error::*;
pub use event::*;
pub use traits::*;
