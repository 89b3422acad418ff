mod facade;
mod limiter;
mod parse;
mod pending;
mod process;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use chrono::{DateTime, Local};

pub use facade::{GetIplayer, GipConfig, resolve_get_iplayer_bin};
pub use limiter::ProcessLimiter;
pub use pending::{Outcome, PendingResult};

/// A filterable programme attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facet {
    Type,
    Channel,
    Category,
    Version,
}

impl Facet {
    /// The flag used to filter on this facet.
    pub(crate) fn flag_name(self) -> &'static str {
        match self {
            Facet::Type => "type",
            Facet::Channel => "channel",
            Facet::Category => "category",
            Facet::Version => "version",
        }
    }

    /// The name get_iplayer lists this facet under, which pluralises for
    /// categories and versions only.
    pub(crate) fn list_name(self) -> &'static str {
        match self {
            Facet::Type => "type",
            Facet::Channel => "channel",
            Facet::Category => "categories",
            Facet::Version => "versions",
        }
    }
}

/// Filter values applied to the facets not being queried. A `.*` pattern
/// leaves a facet unconstrained; an empty string selects programmes with
/// that facet blank.
#[derive(Debug, Clone)]
pub struct SearchFilters {
    pub prog_type: String,
    pub channel: String,
    pub category: String,
    pub version: String,
}

impl Default for SearchFilters {
    fn default() -> Self {
        SearchFilters {
            prog_type: "all".to_string(),
            channel: ".*".to_string(),
            category: ".*".to_string(),
            version: ".*".to_string(),
        }
    }
}

/// One episode in a tree listing. The index is an opaque identifier used to
/// re-query details; ordering within a series comes from the episode number,
/// which is dropped after sorting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Episode {
    pub index: u32,
    pub title: String,
}

pub type EpisodeTree = BTreeMap<String, Vec<Episode>>;

/// A programme info field value, version-scoped when the tool reported
/// different values per version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoValue {
    Plain(String),
    Versioned(BTreeMap<String, String>),
}

impl InfoValue {
    /// Resolves the value for one version. A flat value belongs to the
    /// programme as a whole and answers for any version.
    pub fn for_version(&self, version: &str) -> Option<&str> {
        match self {
            InfoValue::Plain(value) => Some(value),
            InfoValue::Versioned(values) => values.get(version).map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgrammeInfo {
    pub fields: BTreeMap<String, InfoValue>,
    /// Set when the tool reports the programme is no longer available,
    /// which is a state rather than a failure.
    pub expired: bool,
}

impl ProgrammeInfo {
    pub fn field(&self, name: &str) -> Option<&InfoValue> {
        self.fields.get(name)
    }

    /// Delivery modes for one version, grouped and ordered best-first.
    /// Prefers the size-annotated table and falls back to bare mode names.
    pub fn stream_modes(&self, version: &str) -> Vec<StreamMode> {
        let table = self
            .field("modesizes")
            .and_then(|value| value.for_version(version))
            .or_else(|| {
                self.field("modes")
                    .and_then(|value| value.for_version(version))
            })
            .unwrap_or("");
        let mut modes = parse::group_modes(parse::parse_mode_table(table));
        parse::sort_modes_by_quality(&mut modes);
        modes
    }
}

/// A delivery/quality variant of a recording, with the tool-reported size
/// or bitrate detail when available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMode {
    pub name: String,
    pub detail: Option<String>,
}

/// One persisted download record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub index: u32,
    pub name: String,
    pub episode: String,
    pub version: String,
    pub mode: String,
    pub location: String,
}

/// An in-flight recording, tracked for the duration of the external call so
/// a front-end can label what is still in progress.
#[derive(Debug, Clone)]
pub struct Recording {
    pub name: String,
    pub version: String,
    pub mode: String,
    pub started: DateTime<Local>,
}
