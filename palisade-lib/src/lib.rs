pub mod command;
pub mod compile;
pub mod config;
pub mod dirs;
pub mod dynamic;
pub mod fetch;
pub mod handoff;
pub mod integrity;
pub mod ipset;
pub mod kernel;
pub mod lockout;
pub mod logging;
pub mod manager;
pub mod metadata;
pub mod pending;
pub mod probe;
pub mod safemode;
pub mod script;
pub mod socket;
pub mod store;
pub mod zones;

mod error;

pub use error::{ApplyOutcome, Error};

/// Brand string: managed table name, netns prefix, lock-file prefix.
pub const BRAND: &str = "palisade";
