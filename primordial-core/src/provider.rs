//! Provider descriptors, the known-provider table, and the protected
//! env-var set.
//!
//! The known-provider table is the *only* way the proxy learns the real
//! upstream for a known provider. Manifest-supplied domains for known
//! providers are discarded at validation time, which is what defeats
//! redirection attacks: an agent cannot point `anthropic` at a host it
//! controls. The table is an immutable process-wide constant; changing it
//! automatically widens the protected env-var set, because every known
//! provider's derived `env_var` and `base_url_env` are protected for
//! everyone else.

use serde::{Deserialize, Serialize};

/// How a provider authenticates requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>` — the reserved `bearer` token.
    Bearer,
    /// A custom header carrying the key verbatim (e.g. `x-api-key`).
    Header(String),
}

impl AuthStyle {
    /// The header name this style uses on the wire, lowercase.
    pub fn header_name(&self) -> &str {
        match self {
            AuthStyle::Bearer => "authorization",
            AuthStyle::Header(name) => name,
        }
    }
}

impl std::fmt::Display for AuthStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthStyle::Bearer => f.write_str("bearer"),
            AuthStyle::Header(name) => f.write_str(name),
        }
    }
}

impl TryFrom<String> for AuthStyle {
    type Error = String;

    /// Parse the manifest form: the reserved token `bearer`, or a custom
    /// header name matching `^[a-z][a-z0-9-]*$`.
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s == "bearer" {
            return Ok(AuthStyle::Bearer);
        }
        let mut chars = s.chars();
        let head_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let tail_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if head_ok && tail_ok {
            Ok(AuthStyle::Header(s))
        } else {
            Err(format!("invalid auth_style {s:?}"))
        }
    }
}

impl From<AuthStyle> for String {
    fn from(style: AuthStyle) -> String {
        style.to_string()
    }
}

/// One row of the known-provider table: the canonical upstream domain and
/// auth style for a provider name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownProvider {
    /// Lowercase provider name (`^[a-z][a-z0-9-]*$`).
    pub name: &'static str,
    /// Pinned upstream host. Authoritative; manifest overrides are ignored.
    pub domain: &'static str,
    /// Canonical auth header, or None for `Authorization: Bearer`.
    pub auth_header: Option<&'static str>,
}

impl KnownProvider {
    /// The canonical [`AuthStyle`] for this provider.
    pub fn auth_style(&self) -> AuthStyle {
        match self.auth_header {
            Some(name) => AuthStyle::Header(name.to_string()),
            None => AuthStyle::Bearer,
        }
    }
}

/// The immutable known-provider table. Initialized at compile time, never
/// mutated at runtime.
const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider {
        name: "anthropic",
        domain: "api.anthropic.com",
        auth_header: Some("x-api-key"),
    },
    KnownProvider {
        name: "openai",
        domain: "api.openai.com",
        auth_header: None,
    },
    KnownProvider {
        name: "google",
        domain: "generativelanguage.googleapis.com",
        auth_header: Some("x-goog-api-key"),
    },
    KnownProvider {
        name: "mistral",
        domain: "api.mistral.ai",
        auth_header: None,
    },
    KnownProvider {
        name: "groq",
        domain: "api.groq.com",
        auth_header: None,
    },
    KnownProvider {
        name: "together",
        domain: "api.together.xyz",
        auth_header: None,
    },
    KnownProvider {
        name: "cohere",
        domain: "api.cohere.com",
        auth_header: None,
    },
    KnownProvider {
        name: "openrouter",
        domain: "openrouter.ai",
        auth_header: None,
    },
];

/// All known providers.
pub fn known_providers() -> &'static [KnownProvider] {
    KNOWN_PROVIDERS
}

/// Look up a known provider by name.
pub fn known_provider(name: &str) -> Option<&'static KnownProvider> {
    KNOWN_PROVIDERS.iter().find(|p| p.name == name)
}

/// Derive the default placeholder env var for a provider name:
/// `anthropic` → `ANTHROPIC_API_KEY`. Provider names contain no
/// underscores, so the derivation is unambiguous.
pub fn default_env_var(name: &str) -> String {
    format!("{}_API_KEY", upper_snake(name))
}

/// Derive the default base-URL env var: `anthropic` → `ANTHROPIC_BASE_URL`.
pub fn default_base_url_env(name: &str) -> String {
    format!("{}_BASE_URL", upper_snake(name))
}

fn upper_snake(name: &str) -> String {
    name.chars()
        .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
        .collect()
}

/// Host-critical env vars the manifest may never claim. Interpreter search
/// paths, loader injection hooks, and shell-startup vars all belong here —
/// an agent that controls any of them controls the privileged user's
/// processes too.
const PROTECTED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "LANG",
    "LC_ALL",
    "TERM",
    "TZ",
    "IFS",
    "ENV",
    "BASH_ENV",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "PYTHONPATH",
    "PYTHONHOME",
    "PYTHONSTARTUP",
    "NODE_PATH",
    "NODE_OPTIONS",
    "PERL5LIB",
    "RUBYLIB",
];

/// Whether `name` is in the fixed protected set (including the `DYLD_*`
/// loader family, matched by prefix).
pub fn is_protected_env_var(name: &str) -> bool {
    PROTECTED_ENV_VARS.contains(&name) || name.starts_with("DYLD_")
}

/// If `name` collides with a known provider's derived env vars, returns that
/// provider — unless the declaring provider *is* that provider. This is the
/// rule that stops an unknown provider from declaring
/// `env_var: ANTHROPIC_API_KEY` to lure a client library into sending
/// Anthropic's placeholder (and thus its real key) to a foreign upstream.
pub fn known_provider_env_conflict(
    name: &str,
    declaring_provider: &str,
) -> Option<&'static KnownProvider> {
    KNOWN_PROVIDERS.iter().find(|p| {
        p.name != declaring_provider
            && (default_env_var(p.name) == name || default_base_url_env(p.name) == name)
    })
}
