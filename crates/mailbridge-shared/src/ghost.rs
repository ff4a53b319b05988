//! Reversible mapping between mail addresses and ghost user ids.
//!
//! The ghost id is the username template with the raw (normalized) address
//! substituted for the placeholder, so distinct addresses never collide and
//! the mapping carries no state.

use regex::Regex;

use crate::constants::{GHOST_TEMPLATE_SENTINEL, TEMPLATE_PLACEHOLDER};
use crate::error::GhostIdError;
use crate::mail::MailAddress;
use crate::types::{normalize_address, UserId};

#[derive(Debug, Clone)]
pub struct GhostIdFormat {
    prefix: String,
    suffix: String,
    domain: String,
    pattern: Regex,
}

impl GhostIdFormat {
    /// Build the format from a username template such as `email_{{.}}` and
    /// validate it by round-tripping a sentinel address.
    pub fn new(template: &str, domain: &str) -> Result<Self, GhostIdError> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(GhostIdError::EmptyDomain);
        }
        let mut pieces = template.split(TEMPLATE_PLACEHOLDER);
        let prefix = pieces.next().unwrap_or_default().to_string();
        let suffix = pieces.next().ok_or(GhostIdError::MissingPlaceholder)?.to_string();
        if pieces.next().is_some() {
            return Err(GhostIdError::RepeatedPlaceholder);
        }

        let pattern = Regex::new(&format!(
            "^@{}(.+){}:{}$",
            regex::escape(&prefix),
            regex::escape(&suffix),
            regex::escape(domain)
        ))?;

        let format = Self {
            prefix,
            suffix,
            domain: domain.to_string(),
            pattern,
        };

        let sentinel = format.format(GHOST_TEMPLATE_SENTINEL);
        match format.parse(&sentinel) {
            Some(back) if back == GHOST_TEMPLATE_SENTINEL => Ok(format),
            _ => Err(GhostIdError::RoundTrip(sentinel.to_string())),
        }
    }

    /// Ghost id for a normalized mail address.
    pub fn format(&self, address: &str) -> UserId {
        UserId::new(
            &format!("{}{}{}", self.prefix, address, self.suffix),
            &self.domain,
        )
    }

    /// Inverse of [`format`](Self::format). Returns `None` for ids that are
    /// not ghosts of this bridge.
    pub fn parse(&self, user_id: &UserId) -> Option<String> {
        let captures = self.pattern.captures(user_id.as_str())?;
        let address = captures.get(1)?.as_str();
        // Only addresses that are already normalized can have come from format().
        match normalize_address(address) {
            Ok(normalized) if normalized == address => Some(normalized),
            _ => None,
        }
    }

    pub fn is_ghost(&self, user_id: &UserId) -> bool {
        self.parse(user_id).is_some()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

/// Render a ghost display name, substituting the contact's display name
/// (or bare address when the header has none).
pub fn format_display_name(template: &str, contact: &MailAddress) -> String {
    if template.contains(TEMPLATE_PLACEHOLDER) {
        template.replace(TEMPLATE_PLACEHOLDER, contact.display())
    } else {
        contact.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt() -> GhostIdFormat {
        GhostIdFormat::new("email_{{.}}", "example.org").unwrap()
    }

    #[test]
    fn roundtrip() {
        let f = fmt();
        for addr in [
            "alice@example.com",
            "a.b+tag@sub.example.co.uk",
            "x_y@host",
            "weird.email_{{x}}@example.com",
        ] {
            let id = f.format(addr);
            assert_eq!(f.parse(&id).as_deref(), Some(addr), "{id}");
        }
    }

    #[test]
    fn injective_and_stable() {
        let f = fmt();
        assert_ne!(f.format("a@b.com"), f.format("a@b.co"));
        assert_eq!(f.format("a@b.com"), fmt().format("a@b.com"));
        assert_eq!(f.format("a@b.com").as_str(), "@email_a@b.com:example.org");
    }

    #[test]
    fn rejects_foreign_ids() {
        let f = fmt();
        assert_eq!(f.parse(&UserId::new("bob", "example.org")), None);
        assert_eq!(f.parse(&UserId::new("email_a@b.com", "other.org")), None);
        assert_eq!(f.parse(&UserId::new("email_Alice@b.com", "example.org")), None);
        assert_eq!(f.parse(&UserId::new("email_nothing", "example.org")), None);
    }

    #[test]
    fn suffix_templates_work() {
        let f = GhostIdFormat::new("{{.}}_mail", "hs").unwrap();
        let id = f.format("a@b.com");
        assert_eq!(id.as_str(), "@a@b.com_mail:hs");
        assert_eq!(f.parse(&id).as_deref(), Some("a@b.com"));
    }

    #[test]
    fn bad_templates() {
        assert!(matches!(
            GhostIdFormat::new("email_", "hs"),
            Err(GhostIdError::MissingPlaceholder)
        ));
        assert!(matches!(
            GhostIdFormat::new("{{.}}{{.}}", "hs"),
            Err(GhostIdError::RepeatedPlaceholder)
        ));
        assert!(matches!(
            GhostIdFormat::new("email_{{.}}", " "),
            Err(GhostIdError::EmptyDomain)
        ));
    }

    #[test]
    fn display_names() {
        let named = MailAddress::parse("Alice <alice@example.com>").unwrap();
        let bare = MailAddress::new("bob@example.com").unwrap();
        assert_eq!(format_display_name("{{.}} (Email)", &named), "Alice (Email)");
        assert_eq!(format_display_name("{{.}} (Email)", &bare), "bob@example.com (Email)");
    }
}
