//! The individual validation rules: naming regexes, the FQDN rule, and the
//! collision scan.

use primordial_core::error::Violation;
use primordial_core::manifest::ProviderSpec;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static LOWER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").expect("valid regex"));

static ENV_VAR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("valid regex"));

/// Lowercase identifier: `^[a-z][a-z0-9-]*$`. No underscores, so the
/// uppercase-snake env-var derivation is unambiguous.
pub fn is_lower_name(s: &str) -> bool {
    LOWER_NAME_RE.is_match(s)
}

/// Env-var name: `^[A-Z][A-Z0-9_]*$`.
pub fn is_env_var_name(s: &str) -> bool {
    ENV_VAR_RE.is_match(s)
}

/// Fully qualified host name: at least one dot, at least one letter
/// (which rejects IPv4 literals), no IPv6, every label nonempty and
/// `[a-z0-9-]` without leading/trailing hyphens.
pub fn is_fqdn(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 {
        return false;
    }
    if !domain.contains('.') || domain.contains(':') {
        return false;
    }
    if !domain.chars().any(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// Duplicate detection across providers: `env_var` values must be unique,
/// `base_url_env` values must be unique, and the two sets must not overlap
/// (one variable cannot serve both roles). Each collision reports both
/// offenders.
pub fn scan_collisions(providers: &[ProviderSpec], violations: &mut Vec<Violation>) {
    let mut seen: HashMap<&str, (usize, &str, &'static str)> = HashMap::new();
    for (i, p) in providers.iter().enumerate() {
        for (value, suffix) in [
            (p.env_var.as_str(), "env_var"),
            (p.base_url_env.as_str(), "base_url_env"),
        ] {
            if value.is_empty() {
                continue;
            }
            match seen.get(value) {
                Some((j, other_name, other_suffix)) => {
                    violations.push(Violation::new(
                        format!("providers[{i}].{suffix}"),
                        format!(
                            "{value} collides with providers[{j}].{other_suffix} \
                             (provider {other_name} vs {})",
                            p.name
                        ),
                    ));
                }
                None => {
                    seen.insert(value, (i, p.name.as_str(), suffix));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordial_core::provider::AuthStyle;

    #[test]
    fn lower_name_rule() {
        assert!(is_lower_name("anthropic"));
        assert!(is_lower_name("my-api2"));
        assert!(!is_lower_name("My-Api"));
        assert!(!is_lower_name("my_api"));
        assert!(!is_lower_name("2api"));
        assert!(!is_lower_name(""));
    }

    #[test]
    fn env_var_rule() {
        assert!(is_env_var_name("ANTHROPIC_API_KEY"));
        assert!(is_env_var_name("X9"));
        assert!(!is_env_var_name("lower"));
        assert!(!is_env_var_name("9LEAD"));
        assert!(!is_env_var_name("WITH-DASH"));
    }

    #[test]
    fn fqdn_rule() {
        assert!(is_fqdn("api.anthropic.com"));
        assert!(is_fqdn("a.b"));
        assert!(!is_fqdn("localhost"));
        assert!(!is_fqdn("10.0.0.1"));
        assert!(!is_fqdn("[::1]"));
        assert!(!is_fqdn("fe80::1"));
        assert!(!is_fqdn("-bad.example.com"));
        assert!(!is_fqdn("bad-.example.com"));
        assert!(!is_fqdn("double..dot"));
        assert!(!is_fqdn(""));
    }

    fn spec(name: &str, env_var: &str, base_url_env: &str) -> ProviderSpec {
        ProviderSpec {
            name: name.into(),
            domain: format!("api.{name}.example"),
            auth_style: AuthStyle::Bearer,
            env_var: env_var.into(),
            base_url_env: base_url_env.into(),
            known: false,
        }
    }

    #[test]
    fn collision_scan_reports_both_offenders() {
        let providers = vec![
            spec("first", "SHARED", "FIRST_BASE_URL"),
            spec("second", "SHARED", "SECOND_BASE_URL"),
        ];
        let mut violations = Vec::new();
        scan_collisions(&providers, &mut violations);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "providers[1].env_var");
        assert!(violations[0].reason.contains("first"));
        assert!(violations[0].reason.contains("second"));
    }

    #[test]
    fn collision_scan_catches_cross_role_overlap() {
        let providers = vec![
            spec("first", "SHARED", "FIRST_BASE_URL"),
            spec("second", "SECOND_KEY", "SHARED"),
        ];
        let mut violations = Vec::new();
        scan_collisions(&providers, &mut violations);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "providers[1].base_url_env");
    }

    #[test]
    fn no_false_positives() {
        let providers = vec![
            spec("first", "FIRST_KEY", "FIRST_BASE_URL"),
            spec("second", "SECOND_KEY", "SECOND_BASE_URL"),
        ];
        let mut violations = Vec::new();
        scan_collisions(&providers, &mut violations);
        assert!(violations.is_empty());
    }
}
