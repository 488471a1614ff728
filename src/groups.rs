//! Rate-limit groups: the compiled-in group table and the path classifier.
//!
//! The upstream meters calls per *group* of related routes, not per route.
//! [`classify`] maps a request path onto the group name the upstream uses, and
//! [`group_config`] returns the token allowance of that group.
//!
//! Classification walks an ordered rule list and the first matching rule wins,
//! so specific character/corporation sub-resources are listed before the
//! catch-all detail rules. Paths that match no rule land in [`DEFAULT_GROUP`].
//!
//! Both tables must track the upstream's published grouping. A route grouped
//! too conservatively is throttled for nothing; one grouped too permissively
//! draws real 429s.

use std::time::Duration;

/// Group used for every path no rule claims.
pub const DEFAULT_GROUP: &str = "default";

/// Static allowance of one rate-limit group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitGroupConfig {
    /// Tokens available per window.
    pub max_tokens: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Advisory average spacing between successful calls, in seconds.
    pub avg_delay_secs: f64,
}

impl RateLimitGroupConfig {
    const fn new(max_tokens: u32, window_secs: u64, avg_delay_secs: f64) -> Self {
        Self { max_tokens, window_secs, avg_delay_secs }
    }

    /// Window length in milliseconds.
    pub fn window_millis(&self) -> u64 {
        self.window_secs.saturating_mul(1_000)
    }

    /// Window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

const DEFAULT_CONFIG: RateLimitGroupConfig = RateLimitGroupConfig::new(150, 900, 12.0);

/// Every known group with its allowance. `default` is listed too.
pub const GROUPS: &[(&str, RateLimitGroupConfig)] = &[
    (DEFAULT_GROUP, DEFAULT_CONFIG),
    ("killmail", RateLimitGroupConfig::new(3600, 900, 0.5)),
    ("char-detail", RateLimitGroupConfig::new(600, 900, 3.0)),
    ("char-location", RateLimitGroupConfig::new(1200, 900, 1.5)),
    ("char-wallet", RateLimitGroupConfig::new(150, 900, 12.0)),
    ("char-asset", RateLimitGroupConfig::new(1800, 900, 1.0)),
    ("char-killmail", RateLimitGroupConfig::new(30, 900, 60.0)),
    ("char-notification", RateLimitGroupConfig::new(15, 900, 120.0)),
    ("char-social", RateLimitGroupConfig::new(600, 900, 3.0)),
    ("char-industry", RateLimitGroupConfig::new(600, 900, 3.0)),
    ("char-contract", RateLimitGroupConfig::new(600, 900, 3.0)),
    ("corp-detail", RateLimitGroupConfig::new(300, 900, 6.0)),
    ("corp-member", RateLimitGroupConfig::new(300, 900, 6.0)),
    ("corp-wallet", RateLimitGroupConfig::new(300, 900, 6.0)),
    ("corp-killmail", RateLimitGroupConfig::new(30, 900, 60.0)),
    ("alliance", RateLimitGroupConfig::new(300, 900, 6.0)),
    ("universe", RateLimitGroupConfig::new(3600, 900, 0.5)),
    ("market", RateLimitGroupConfig::new(3600, 900, 0.5)),
    ("routes", RateLimitGroupConfig::new(3600, 900, 0.5)),
    ("sovereignty", RateLimitGroupConfig::new(600, 900, 3.0)),
    ("factional-warfare", RateLimitGroupConfig::new(150, 900, 12.0)),
    ("incursion", RateLimitGroupConfig::new(150, 900, 12.0)),
    ("industry", RateLimitGroupConfig::new(600, 900, 3.0)),
    ("status", RateLimitGroupConfig::new(600, 900, 3.0)),
];

/// Allowance for `group`; unknown names fall back to the `default` entry.
pub fn group_config(group: &str) -> &'static RateLimitGroupConfig {
    GROUPS
        .iter()
        .find(|(name, _)| *name == group)
        .map(|(_, config)| config)
        .unwrap_or(&DEFAULT_CONFIG)
}

/// One path segment of a rule pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// Literal segment, compared exactly.
    Lit(&'static str),
    /// Numeric entity id.
    Id,
    /// Alphanumeric token such as a killmail hash.
    Hash,
}

impl Segment {
    fn matches(self, segment: &str) -> bool {
        match self {
            Segment::Lit(lit) => lit == segment,
            Segment::Id => !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()),
            Segment::Hash => {
                !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_alphanumeric())
            }
        }
    }
}

/// A classification rule: a segment pattern and the group it assigns.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pattern: &'static [Segment],
    exact: bool,
    group: &'static str,
}

impl Rule {
    /// Matches paths that start with `pattern`.
    const fn prefix(pattern: &'static [Segment], group: &'static str) -> Self {
        Self { pattern, exact: false, group }
    }

    /// Matches paths made of exactly `pattern`.
    const fn exact(pattern: &'static [Segment], group: &'static str) -> Self {
        Self { pattern, exact: true, group }
    }

    /// Group assigned by this rule.
    pub fn group(&self) -> &'static str {
        self.group
    }

    fn matches(&self, segments: &[&str]) -> bool {
        if segments.len() < self.pattern.len() || (self.exact && segments.len() != self.pattern.len())
        {
            return false;
        }
        self.pattern.iter().zip(segments).all(|(pattern, segment)| pattern.matches(segment))
    }
}

use Segment::{Hash, Id, Lit};

const CHARACTERS: Segment = Lit("characters");
const CORPORATIONS: Segment = Lit("corporations");

/// Ordered classification rules; first match wins.
pub const RULES: &[Rule] = &[
    Rule::exact(&[Lit("killmails"), Id, Hash], "killmail"),
    Rule::prefix(&[CHARACTERS, Id, Lit("killmails")], "char-killmail"),
    Rule::prefix(&[CHARACTERS, Id, Lit("wallet")], "char-wallet"),
    Rule::prefix(&[CHARACTERS, Id, Lit("location")], "char-location"),
    Rule::prefix(&[CHARACTERS, Id, Lit("online")], "char-location"),
    Rule::prefix(&[CHARACTERS, Id, Lit("ship")], "char-location"),
    Rule::prefix(&[CHARACTERS, Id, Lit("assets")], "char-asset"),
    Rule::prefix(&[CHARACTERS, Id, Lit("notifications")], "char-notification"),
    Rule::prefix(&[CHARACTERS, Id, Lit("contacts")], "char-social"),
    Rule::prefix(&[CHARACTERS, Id, Lit("mail")], "char-social"),
    Rule::prefix(&[CHARACTERS, Id, Lit("standings")], "char-social"),
    Rule::prefix(&[CHARACTERS, Id, Lit("industry")], "char-industry"),
    Rule::prefix(&[CHARACTERS, Id, Lit("mining")], "char-industry"),
    Rule::prefix(&[CHARACTERS, Id, Lit("blueprints")], "char-industry"),
    Rule::prefix(&[CHARACTERS, Id, Lit("contracts")], "char-contract"),
    Rule::exact(&[CHARACTERS, Lit("affiliation")], "char-detail"),
    Rule::prefix(&[CHARACTERS, Id], "char-detail"),
    Rule::prefix(&[CORPORATIONS, Id, Lit("killmails")], "corp-killmail"),
    Rule::prefix(&[CORPORATIONS, Id, Lit("wallets")], "corp-wallet"),
    Rule::prefix(&[CORPORATIONS, Id, Lit("members")], "corp-member"),
    Rule::prefix(&[CORPORATIONS, Id, Lit("membertracking")], "corp-member"),
    Rule::prefix(&[CORPORATIONS, Id, Lit("roles")], "corp-member"),
    Rule::prefix(&[CORPORATIONS, Id], "corp-detail"),
    Rule::prefix(&[Lit("alliances")], "alliance"),
    Rule::prefix(&[Lit("universe")], "universe"),
    Rule::prefix(&[Lit("markets")], "market"),
    Rule::prefix(&[Lit("route")], "routes"),
    Rule::prefix(&[Lit("sovereignty")], "sovereignty"),
    Rule::prefix(&[Lit("fw")], "factional-warfare"),
    Rule::prefix(&[Lit("incursions")], "incursion"),
    Rule::prefix(&[Lit("industry")], "industry"),
    Rule::prefix(&[Lit("insurance")], "industry"),
    Rule::exact(&[Lit("status")], "status"),
];

/// Split a request path into the segments rules are matched against.
///
/// Accepts bare paths or absolute URLs. Query string, fragment, empty segments
/// and a leading route-version segment (`latest`, `dev`, `legacy`, `v4`, ...)
/// are dropped.
fn segments(path: &str) -> Vec<&str> {
    let path = match path.find("://") {
        Some(scheme_end) => {
            let rest = &path[scheme_end + 3..];
            rest.find('/').map_or("", |host_end| &rest[host_end..])
        }
        None => path,
    };
    let path = path.split(['?', '#']).next().unwrap_or_default();

    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first().is_some_and(|first| is_version_segment(first)) {
        segments.remove(0);
    }
    segments
}

fn is_version_segment(segment: &str) -> bool {
    matches!(segment, "latest" | "dev" | "legacy")
        || segment
            .strip_prefix('v')
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Rate-limit group for `path`. Total: unmatched paths map to [`DEFAULT_GROUP`].
pub fn classify(path: &str) -> &'static str {
    let segments = segments(path);
    RULES.iter().find(|rule| rule.matches(&segments)).map_or(DEFAULT_GROUP, Rule::group)
}
