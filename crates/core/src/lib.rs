pub mod config;
pub mod error;
pub mod event;
pub mod matcher;
pub mod paths;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, EventKind, EventPayload};
pub use matcher::{MatchCondition, Matcher, MatcherKind};
pub use paths::Paths;
