//! Entity hydration primitives shared by every resource adapter.
//!
//! CloudStack records are flat lists of child elements in no particular
//! order, any of which may be missing or empty. Adapters make one pass over
//! [`fields`], match on the lower-cased field name, and return `None` when
//! an identifying field never showed up. The guessing helpers below fill in
//! categorical values (architecture, platform) that the API only exposes as
//! free text.

use crate::error::CsResult;
use crate::xml::{XmlDocument, XmlElement};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ── Field scan ──────────────────────────────────────────────────────────

/// One child of a record element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field<'a> {
    /// Tag name, ASCII lower-cased.
    pub name: String,
    /// Text content; `None` when the child has no text.
    pub value: Option<&'a str>,
}

impl<'a> Field<'a> {
    /// Value with surrounding whitespace removed.
    pub fn trimmed(&self) -> Option<&'a str> {
        self.value.map(str::trim)
    }

    /// `true` only for a case-insensitive "true".
    pub fn is_true(&self) -> bool {
        self.value
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    pub fn owned(&self) -> Option<String> {
        self.value.map(|v| v.to_string())
    }
}

/// Direct children of `element` as fields, in document order.
pub fn fields(element: &XmlElement) -> impl Iterator<Item = Field<'_>> {
    element.children().iter().map(|child| Field {
        name: child.name().to_ascii_lowercase(),
        value: child.text(),
    })
}

/// Hydrate every element named `tag`, skipping those that yield `None`.
pub fn hydrate_all<T, F>(doc: &XmlDocument, tag: &str, mut hydrate: F) -> CsResult<Vec<T>>
where
    F: FnMut(&XmlElement) -> CsResult<Option<T>>,
{
    let mut out = Vec::new();
    for element in doc.elements_by_tag_name(tag) {
        if let Some(entity) = hydrate(element)? {
            out.push(entity);
        }
    }
    Ok(out)
}

/// Hydrate the first element named `tag` that yields a record.
pub fn hydrate_first<T, F>(doc: &XmlDocument, tag: &str, mut hydrate: F) -> CsResult<Option<T>>
where
    F: FnMut(&XmlElement) -> CsResult<Option<T>>,
{
    for element in doc.elements_by_tag_name(tag) {
        if let Some(entity) = hydrate(element)? {
            return Ok(Some(entity));
        }
    }
    Ok(None)
}

/// Identifier plus lifecycle state, for cheap status listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus<S> {
    pub id: String,
    pub state: S,
}

impl<S> ResourceStatus<S> {
    pub fn new(id: &str, state: S) -> Self {
        Self {
            id: id.to_string(),
            state,
        }
    }
}

/// Parse a CloudStack timestamp such as `2010-06-29T20:49:28+1000`.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| log::warn!("Unable to parse timestamp {}: {}", value, e))
        .ok()
}

// ── Locality ────────────────────────────────────────────────────────────

/// Caller identity used while hydrating: active zone and account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HydrationScope {
    pub region_id: Option<String>,
    pub account_number: Option<String>,
}

impl HydrationScope {
    pub fn new(region_id: Option<&str>, account_number: Option<&str>) -> Self {
        Self {
            region_id: region_id.map(|s| s.to_string()),
            account_number: account_number.map(|s| s.to_string()),
        }
    }

    /// Whether an entity in `entity_region` is visible to this caller.
    pub fn is_visible(&self, entity_region: Option<&str>, cross_zones: bool) -> bool {
        visible_in_region(entity_region, self.region_id.as_deref(), cross_zones)
    }

    /// Whether `owner` names the caller's account (exact match).
    pub fn owns(&self, owner: Option<&str>) -> bool {
        matches!((self.account_number.as_deref(), owner), (Some(a), Some(o)) if a == o)
    }
}

/// Locality filter.
///
/// Globally visible entities always pass. With no active region there is
/// nothing to filter on. Otherwise the entity's zone must match, ignoring
/// ASCII case.
pub fn visible_in_region(
    entity_region: Option<&str>,
    active_region: Option<&str>,
    cross_zones: bool,
) -> bool {
    if cross_zones {
        return true;
    }
    match (entity_region, active_region) {
        (_, None) => true,
        (Some(entity), Some(active)) => entity.eq_ignore_ascii_case(active),
        (None, Some(_)) => false,
    }
}

// ── Architecture ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    I32,
    I64,
}

impl Default for Architecture {
    fn default() -> Self {
        Self::I64
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32 => write!(f, "I32"),
            Self::I64 => write!(f, "I64"),
        }
    }
}

impl Architecture {
    /// Guess from free text; the first matching marker wins.
    pub fn guess(desc: &str) -> Self {
        const MARKERS: [(&str, Architecture); 7] = [
            ("x64", Architecture::I64),
            ("x32", Architecture::I32),
            ("64 bit", Architecture::I64),
            ("32 bit", Architecture::I32),
            ("i386", Architecture::I32),
            ("64", Architecture::I64),
            ("32", Architecture::I32),
        ];
        MARKERS
            .iter()
            .find(|(marker, _)| desc.contains(marker))
            .map(|(_, arch)| *arch)
            .unwrap_or_default()
    }
}

// ── Platform ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Unknown,
    CentOs,
    Ubuntu,
    Debian,
    FedoraCore,
    Rhel,
    Suse,
    CoreOs,
    FreeBsd,
    Solaris,
    Windows,
    Unix,
}

impl Default for Platform {
    fn default() -> Self {
        Self::Unknown
    }
}

impl Platform {
    /// Guess from free text, ASCII case-insensitively; first match wins.
    pub fn guess(name: &str) -> Self {
        const MARKERS: [(&str, Platform); 15] = [
            ("centos", Platform::CentOs),
            ("ubuntu", Platform::Ubuntu),
            ("debian", Platform::Debian),
            ("fedora", Platform::FedoraCore),
            ("red hat", Platform::Rhel),
            ("redhat", Platform::Rhel),
            ("rhel", Platform::Rhel),
            ("suse", Platform::Suse),
            ("coreos", Platform::CoreOs),
            ("freebsd", Platform::FreeBsd),
            ("solaris", Platform::Solaris),
            ("windows", Platform::Windows),
            ("linux", Platform::Unix),
            ("unix", Platform::Unix),
            ("bsd", Platform::Unix),
        ];
        let name = name.to_ascii_lowercase();
        MARKERS
            .iter()
            .find(|(marker, _)| name.contains(marker))
            .map(|(_, platform)| *platform)
            .unwrap_or_default()
    }

    /// Guess from optional text; absent text is `Unknown`.
    pub fn guess_opt(name: Option<&str>) -> Self {
        name.map(Self::guess).unwrap_or_default()
    }

    pub fn is_windows(&self) -> bool {
        *self == Self::Windows
    }

    pub fn is_unknown(&self) -> bool {
        *self == Self::Unknown
    }
}
