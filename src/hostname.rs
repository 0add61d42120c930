//! Session hostname encoding.
//!
//! Every session advertises itself under a structured hostname of the form
//! `gem-{project}-{type}-{uid}`. Project names may themselves contain
//! hyphens, so decoding anchors on the tail: the last token is the uid, the
//! one before it the session type, everything in between is the project. A
//! legacy three-token form (`gem-{project}-{uid}`) implies the `cli` type.

/// Identity parsed from a session hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub project: String,
    pub session_type: String,
    pub uid: String,
    /// The hostname exactly as advertised, used as the join key.
    pub hostname: String,
}

/// Hostname prefix shared by every fleet session.
pub const SESSION_PREFIX: &str = "gem-";

/// Session type implied by the legacy three-token hostname form.
const LEGACY_SESSION_TYPE: &str = "cli";

/// Decode a hostname into a [`SessionIdentity`].
///
/// Returns `None` for hostnames outside the naming scheme; such hosts are
/// never surfaced as sessions.
pub fn decode(hostname: &str) -> Option<SessionIdentity> {
    if !hostname.starts_with(SESSION_PREFIX) {
        return None;
    }

    let tokens: Vec<&str> = hostname.split('-').filter(|t| !t.is_empty()).collect();

    let (project, session_type, uid) = if tokens.len() >= 4 {
        (
            tokens[1..tokens.len() - 2].join("-"),
            tokens[tokens.len() - 2].to_string(),
            tokens[tokens.len() - 1].to_string(),
        )
    } else if tokens.len() == 3 {
        (
            tokens[1].to_string(),
            LEGACY_SESSION_TYPE.to_string(),
            tokens[2].to_string(),
        )
    } else {
        return None;
    };

    Some(SessionIdentity {
        project,
        session_type,
        uid,
        hostname: hostname.to_string(),
    })
}

impl SessionIdentity {
    /// Rebuild the canonical hostname from the identity fields.
    pub fn encode(&self) -> String {
        format!(
            "{}{}-{}-{}",
            SESSION_PREFIX, self.project, self.session_type, self.uid
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_standard() {
        let id = decode("gem-myproject-geminicli-a1b2").unwrap();
        assert_eq!(id.project, "myproject");
        assert_eq!(id.session_type, "geminicli");
        assert_eq!(id.uid, "a1b2");
        assert_eq!(id.hostname, "gem-myproject-geminicli-a1b2");
    }

    #[test]
    fn test_decode_hyphenated_project() {
        let id = decode("gem-my-complex-app-geminicli-1234").unwrap();
        assert_eq!(id.project, "my-complex-app");
        assert_eq!(id.session_type, "geminicli");
        assert_eq!(id.uid, "1234");
    }

    #[test]
    fn test_decode_legacy_three_tokens() {
        let id = decode("gem-debug-x9y8").unwrap();
        assert_eq!(id.project, "debug");
        assert_eq!(id.session_type, "cli");
        assert_eq!(id.uid, "x9y8");
    }

    #[test]
    fn test_decode_rejects_foreign_hosts() {
        assert!(decode("desktop-pc").is_none());
        assert!(decode("gem-").is_none());
        assert!(decode("gem-onlyproject").is_none());
        assert!(decode("").is_none());
    }

    #[test]
    fn test_decode_drops_empty_tokens() {
        // Doubled separators collapse rather than producing empty fields.
        let id = decode("gem--proj--geminicli--42").unwrap();
        assert_eq!(id.project, "proj");
        assert_eq!(id.session_type, "geminicli");
        assert_eq!(id.uid, "42");
    }

    #[test]
    fn test_encode_round_trips_token_sequence() {
        for hostname in [
            "gem-myproject-geminicli-a1b2",
            "gem-my-complex-app-geminicli-1234",
            "gem-a-b-c-d-bash-0f",
        ] {
            let id = decode(hostname).unwrap();
            assert_eq!(id.encode(), hostname);
        }
    }
}
