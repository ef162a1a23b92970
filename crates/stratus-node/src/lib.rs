//! Stratus Node -- library crate for a cluster node.
//!
//! Exposes the node runtime, its config and the local service directory so
//! integration tests and main.rs share one implementation.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod node;
pub mod services;
pub mod tcp_channel;

pub use node::Node;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/var/lib/stratus"), PathBuf::from("/var/lib/stratus"));
    }

    #[test]
    fn test_expand_tilde_uses_home() {
        if let Some(home) = dirs_or_home() {
            assert_eq!(expand_tilde("~/.stratus"), home.join(".stratus"));
        }
    }
}
