//! Version information for hyperpipe.

/// Hyperpipe version from Cargo.toml
pub const HYPERPIPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default `User-Agent` sent by the HTTP transport.
pub fn user_agent() -> String {
    format!("hyperpipe/{}", HYPERPIPE_VERSION)
}
