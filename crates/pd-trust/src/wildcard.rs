//! Host coverage check for (possibly wildcard) certificate common names.

const WILDCARD_PREFIX: &str = "*.";

/// Returns true when `certificate_cn` covers `requested_host`.
///
/// An exact match always covers. A `*.base` name covers a host when some proper
/// dot-delimited suffix of the host equals `base`. Only the literal base domain
/// is compared; there is no RFC 6125 label counting, and platform chain
/// validation stays authoritative.
pub fn matches(requested_host: &str, certificate_cn: &str) -> bool {
    if certificate_cn == requested_host {
        return true;
    }

    let Some(base_domain) = certificate_cn.strip_prefix(WILDCARD_PREFIX) else {
        return false;
    };

    let mut suffix = requested_host;
    while let Some((_, rest)) = suffix.split_once('.') {
        if rest == base_domain {
            return true;
        }
        suffix = rest;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::matches;

    #[test]
    fn exact_name_matches() {
        assert!(matches("example.com", "example.com"));
        assert!(!matches("example.com", "example.org"));
    }

    #[test]
    fn wildcard_covers_subdomains() {
        assert!(matches("mail.example.com", "*.example.com"));
        assert!(matches("a.b.example.com", "*.example.com"));
    }

    #[test]
    fn wildcard_does_not_cover_base_domain() {
        assert!(!matches("example.com", "*.example.com"));
    }

    #[test]
    fn wildcard_requires_label_boundary() {
        assert!(!matches("evil-example.com", "*.example.com"));
        assert!(!matches("mail.notexample.com", "*.example.com"));
    }

    #[test]
    fn wildcard_never_matches_single_label_host() {
        assert!(!matches("localhost", "*.localhost"));
        assert!(!matches("com", "*.com"));
    }

    #[test]
    fn literal_star_name_only_matches_itself() {
        assert!(matches("*.example.com", "*.example.com"));
        assert!(!matches("mail.example.com", "*example.com"));
        assert!(!matches("mail.example.com", "mail.*.com"));
    }

    #[test]
    fn agrees_with_suffix_definition() {
        let hosts = [
            "example.com",
            "www.example.com",
            "a.b.example.com",
            "example.org",
            "xexample.com",
            "com",
        ];
        let names = ["example.com", "*.example.com", "*.com", "*.b.example.com"];

        for host in hosts {
            for name in names {
                let expected = name == host
                    || name.strip_prefix("*.").is_some_and(|base| {
                        let labels: Vec<&str> = host.split('.').collect();
                        (1..labels.len()).any(|start| labels[start..].join(".") == base)
                    });
                assert_eq!(matches(host, name), expected, "host={host} name={name}");
            }
        }
    }
}
