//! Small, named emoji constants so call sites read as intent rather than
//! raw unicode literals.

pub const INFO: &str = "ℹ️";
pub const WARN: &str = "⚠️";
pub const ERROR: &str = "✘";
pub const DONE: &str = "✨";
pub const WATCH: &str = "👀";
pub const LOCKED: &str = "🔒";
