//! Client API.
//!
//! The [`ConnectionManager`] handle, its configuration, the observable status
//! and the subscriber registry.

mod config;
mod handlers;
mod manager;
mod status;

pub use config::*;
pub use handlers::*;
pub use manager::*;
pub use status::*;
