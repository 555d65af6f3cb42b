//! Auto-pings: users watch expressions and get a DM when a message matches.

pub mod commands;
pub mod expression;
pub mod fold;
pub mod matcher;
pub mod store;
pub mod watch_set;

pub use expression::{Expression, ExpressionKind};
pub use matcher::{Triggered, exclude_author, find_triggered_expressions, triggers};
pub use store::PingsStore;
pub use watch_set::{SubscriberId, WatchSet};
