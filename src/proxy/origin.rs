//! Origin allowlist matching.
//!
//! `§4.G` step 2 only requires an exact match plus an explicitly-configured
//! `*`; a real allowlist is more useful with subdomain wildcards too, so
//! [`OriginPattern`] also recognises `*.example.com`-shaped patterns.

/// One entry in an origin allowlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPattern {
    /// Matches any origin whatsoever. Must be configured explicitly — it
    /// is never implied by an empty allowlist.
    Any,
    /// Matches exactly this origin string.
    Exact(String),
    /// Matches `https://*.example.com`-shaped patterns: the origin must
    /// carry the same scheme, end with the given host suffix (`.example.com`,
    /// dot included), and have at least one label before it.
    SuffixWildcard { scheme: String, host_suffix: String },
}

impl OriginPattern {
    /// Parse a configured allowlist entry. `*` alone means "any origin";
    /// a pattern with a `*` in the host position (`https://*.example.com`)
    /// becomes a suffix wildcard; anything else is matched exactly.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw == "*" {
            return Self::Any;
        }
        if let Some((scheme, rest)) = raw.split_once("://") {
            if let Some(host_suffix) = rest.strip_prefix('*') {
                return Self::SuffixWildcard {
                    scheme: scheme.to_owned(),
                    host_suffix: host_suffix.to_owned(),
                };
            }
        }
        Self::Exact(raw.to_owned())
    }

    #[must_use]
    pub fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(exact) => exact == origin,
            Self::SuffixWildcard { scheme, host_suffix } => {
                let Some((origin_scheme, host)) = origin.split_once("://") else {
                    return false;
                };
                origin_scheme == scheme && host.ends_with(host_suffix.as_str()) && host.len() > host_suffix.len()
            }
        }
    }
}

/// A configured set of origin patterns.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowlist {
    patterns: Vec<OriginPattern>,
}

impl OriginAllowlist {
    #[must_use]
    pub fn new(raw_patterns: &[impl AsRef<str>]) -> Self {
        Self {
            patterns: raw_patterns.iter().map(|p| OriginPattern::parse(p.as_ref())).collect(),
        }
    }

    #[must_use]
    pub fn is_allowed(&self, origin: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_only_matches_itself() {
        let pattern = OriginPattern::parse("https://a.example");
        assert!(pattern.matches("https://a.example"));
        assert!(!pattern.matches("https://b.example"));
    }

    #[test]
    fn bare_star_matches_any_origin() {
        let pattern = OriginPattern::parse("*");
        assert!(pattern.matches("https://anything.example"));
    }

    #[test]
    fn suffix_wildcard_matches_subdomains_only() {
        let pattern = OriginPattern::parse("https://*.example.com");
        assert!(pattern.matches("https://a.example.com"));
        assert!(pattern.matches("https://deep.sub.example.com"));
        assert!(!pattern.matches("https://example.com"));
        assert!(!pattern.matches("https://evilexample.com"));
    }

    #[test]
    fn allowlist_checks_every_pattern() {
        let list = OriginAllowlist::new(&["https://a.example", "https://*.b.example"]);
        assert!(list.is_allowed("https://a.example"));
        assert!(list.is_allowed("https://x.b.example"));
        assert!(!list.is_allowed("https://c.example"));
    }
}
