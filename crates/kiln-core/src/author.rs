//! Who is deploying, for the release history.

use std::path::Path;

use git2::{Config, Repository};

pub const UNKNOWN_AUTHOR: &str = "unknown";

/// `user.name <user.email>` from the repository containing `dir` or the
/// global git config, else `$USER`, else `unknown`.
pub fn resolve_author(dir: &Path) -> String {
    git_identity(dir)
        .or_else(|| std::env::var("USER").ok().filter(|u| !u.is_empty()))
        .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string())
}

fn git_identity(dir: &Path) -> Option<String> {
    let config = match Repository::discover(dir) {
        Ok(repo) => repo.config().ok()?,
        Err(_) => Config::open_default().ok()?,
    };
    identity_from(&config)
}

fn identity_from(config: &Config) -> Option<String> {
    let name = config.get_string("user.name").ok().filter(|n| !n.is_empty());
    let email = config.get_string("user.email").ok().filter(|e| !e.is_empty());
    match (name, email) {
        (Some(name), Some(email)) => Some(format!("{} <{}>", name, email)),
        (Some(name), None) => Some(name),
        (None, Some(email)) => Some(email),
        (None, None) => None,
    }
}
