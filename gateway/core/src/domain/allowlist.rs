// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Destination Allowlist
//!
//! An [`Allowlist`] is an immutable snapshot of the exact hostnames the agent
//! segment may reach through the proxy. Membership is byte-for-byte equality
//! after ASCII lowercasing and trailing-dot normalization. There is no
//! wildcard or suffix matching: `github.com` in the list does not admit
//! `evil.github.com.attacker.net`, nor even `api.github.com`.

use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllowlistError {
    #[error("line {line}: IP literals are not allowed in the allowlist: {entry}")]
    IpLiteral { line: usize, entry: String },

    #[error("line {line}: wildcard entries are not allowed: {entry}")]
    Wildcard { line: usize, entry: String },

    #[error("line {line}: not a valid hostname: {entry}")]
    InvalidHostname { line: usize, entry: String },
}

/// Immutable set of permitted destination hostnames.
///
/// Live decisions always run against one complete snapshot; reloads build a
/// new `Allowlist` and swap it in whole (see
/// [`crate::infrastructure::allowlist_store::AllowlistStore`]).
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    hosts: HashSet<String>,
}

impl Allowlist {
    /// Parse the line-oriented allowlist format: one hostname per line,
    /// `#` starts a comment, blank lines ignored.
    pub fn parse(content: &str) -> Result<Self, AllowlistError> {
        let mut hosts = HashSet::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = idx + 1;
            let entry = raw.split('#').next().unwrap_or("").trim();
            if entry.is_empty() {
                continue;
            }

            let host = normalize_host(entry);

            if host.parse::<IpAddr>().is_ok() {
                return Err(AllowlistError::IpLiteral {
                    line,
                    entry: entry.to_string(),
                });
            }
            if host.contains('*') {
                return Err(AllowlistError::Wildcard {
                    line,
                    entry: entry.to_string(),
                });
            }
            if !is_valid_hostname(&host) {
                return Err(AllowlistError::InvalidHostname {
                    line,
                    entry: entry.to_string(),
                });
            }

            hosts.insert(host);
        }

        Ok(Self { hosts })
    }

    /// Exact-match membership test.
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_host(host))
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Lowercase and strip one trailing dot (a FQDN root marker, not a distinct
/// destination).
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    host.strip_suffix('.').unwrap_or(&host).to_string()
}

fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comments_and_blank_lines() {
        let list = Allowlist::parse(
            "# backend endpoints\n\
             api.anthropic.com\n\
             \n\
             github.com  # vcs\n",
        )
        .unwrap();

        assert_eq!(list.len(), 2);
        assert!(list.contains("api.anthropic.com"));
        assert!(list.contains("github.com"));
        assert!(!list.contains("pypi.org"));
    }

    #[test]
    fn membership_is_exact_not_suffix() {
        let list = Allowlist::parse("github.com\n").unwrap();
        assert!(list.contains("github.com"));
        assert!(!list.contains("api.github.com"));
        assert!(!list.contains("evilgithub.com"));
        assert!(!list.contains("github.com.attacker.net"));
    }

    #[test]
    fn normalizes_case_and_trailing_dot() {
        let list = Allowlist::parse("GitHub.COM\n").unwrap();
        assert!(list.contains("github.com"));
        assert!(list.contains("github.com."));
    }

    #[test]
    fn rejects_ip_literals() {
        let err = Allowlist::parse("93.184.216.34\n").unwrap_err();
        assert!(matches!(err, AllowlistError::IpLiteral { line: 1, .. }));

        let err = Allowlist::parse("::1\n").unwrap_err();
        assert!(matches!(err, AllowlistError::IpLiteral { .. }));
    }

    #[test]
    fn rejects_wildcards() {
        let err = Allowlist::parse("*.github.com\n").unwrap_err();
        assert!(matches!(err, AllowlistError::Wildcard { line: 1, .. }));
    }

    #[test]
    fn rejects_garbage_hostnames() {
        assert!(Allowlist::parse("-bad.example\n").is_err());
        assert!(Allowlist::parse("bad_host.example\n").is_err());
    }
}
