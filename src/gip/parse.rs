use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

use super::{Episode, HistoryRecord, InfoValue, StreamMode};

static LISTING_ENTRY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.+) \((\d+)\)$").unwrap());

static MATCH_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^INFO: (\d+) Matching Programmes$").unwrap());

static TREE_EPISODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^  (\d+): \((\d*)\) (.*)$").unwrap());

static INFO_LINE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.+?):\s+(.+)$").unwrap());

static HISTORY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\((\d+)\):\((.+)\):\((.+)\):\((.+)\):\((.+)\):\((.+)\)$").unwrap()
});

/// Parses `"<name> (<count>)"` listing lines in input order. Lines that do
/// not match the listing grammar are skipped.
pub(crate) fn parse_listings(input: &str) -> Vec<(String, u32)> {
    let mut listings = Vec::new();
    for line in input.lines() {
        if let Some(captures) = LISTING_ENTRY.captures(line)
            && let Ok(count) = captures[2].parse::<u32>()
        {
            listings.push((captures[1].trim().to_string(), count));
        }
    }
    listings
}

/// Extracts the total from the `"INFO: <n> Matching Programmes"` summary
/// line. Its absence means the tool no longer speaks the expected format.
pub(crate) fn parse_match_count(input: &str) -> Result<u32> {
    let captures = MATCH_TOTAL
        .captures(input)
        .ok_or_else(|| anyhow!("no matching-programmes total in get_iplayer output"))?;
    Ok(captures[1].parse()?)
}

/// Parses tree-format output into series name to episode list. Episode lines
/// are indented `"  <idx>: (<num>) <title>"`; any other line names the
/// series for the episodes that follow. Episodes are ordered by episode
/// number ascending, and the number is dropped once ordering is decided.
pub(crate) fn parse_episodes(input: &str) -> BTreeMap<String, Vec<Episode>> {
    let mut collected: BTreeMap<String, Vec<(u32, u32, String)>> = BTreeMap::new();
    let mut series = String::new();
    for line in input.lines() {
        let Some(captures) = TREE_EPISODE.captures(line) else {
            series = line.to_string();
            continue;
        };
        let index: u32 = match captures[1].parse() {
            Ok(index) => index,
            Err(_) => continue,
        };
        let number: u32 = captures[2].parse().unwrap_or(0);
        collected
            .entry(series.clone())
            .or_default()
            .push((index, number, captures[3].to_string()));
    }

    let mut episodes = BTreeMap::new();
    for (name, mut entries) in collected {
        entries.sort_by_key(|(_, number, _)| *number);
        episodes.insert(
            name,
            entries
                .into_iter()
                .map(|(index, _, title)| Episode { index, title })
                .collect(),
        );
    }
    episodes
}

/// Merges one or more comma-joined version collections into a sorted,
/// deduplicated list with empty entries discarded.
pub(crate) fn parse_versions(collections: &[String]) -> Vec<String> {
    let mut versions = BTreeSet::new();
    for collection in collections {
        for version in collection.split(',') {
            let version = version.trim();
            if !version.is_empty() {
                versions.insert(version.to_string());
            }
        }
    }
    versions.into_iter().collect()
}

/// Parses programme info output. The info block is the second-to-last
/// blank-line-separated section; each line is `"<field>: <value>"`, where a
/// value may be scoped to one of the known `versions` by a `version:`
/// prefix. Fields carrying only an unscoped value collapse to a flat value.
pub(crate) fn parse_info(input: &str, versions: &[String]) -> Result<BTreeMap<String, InfoValue>> {
    let sections: Vec<&str> = input.split("\n\n").collect();
    if sections.len() < 2 {
        return Err(anyhow!("no info section in get_iplayer output"));
    }
    let relevant = sections[sections.len() - 2];

    let mut scoped: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    for line in relevant.lines() {
        let Some(captures) = INFO_LINE.captures(line) else {
            continue;
        };
        let field = captures[1].to_string();
        let mut version = String::new();
        let mut value = captures[2].to_string();
        for known in versions {
            if let Some(rest) = value.strip_prefix(&format!("{known}:")) {
                version = known.clone();
                value = rest.trim_start().to_string();
                break;
            }
        }
        scoped.entry(field).or_default().insert(version, value);
    }

    let mut info = BTreeMap::new();
    for (field, values) in scoped {
        let flat = values.len() == 1 && values.contains_key("");
        if flat {
            let value = values.into_values().next().unwrap_or_default();
            info.insert(field, InfoValue::Plain(value));
        } else {
            info.insert(field, InfoValue::Versioned(values));
        }
    }
    Ok(info)
}

/// Parses persisted download records, one
/// `"(<index>):(<name>):(<episode>):(<versions>):(<mode>):(<filename>)"`
/// line each. With `guess_version` the version field is overridden by the
/// stored filename's final underscore suffix, which is more reliable than
/// the tool's own metadata for this field.
pub(crate) fn parse_history(input: &str, guess_version: bool) -> Vec<HistoryRecord> {
    let mut records = Vec::new();
    for line in input.lines() {
        let Some(captures) = HISTORY_LINE.captures(line) else {
            continue;
        };
        let Ok(index) = captures[1].parse::<u32>() else {
            continue;
        };
        let mut version = captures[4].to_string();
        let location = captures[6].to_string();
        if guess_version && let Some(guessed) = version_from_filename(&location) {
            version = guessed;
        }
        records.push(HistoryRecord {
            index,
            name: captures[2].to_string(),
            episode: captures[3].to_string(),
            version,
            mode: captures[5].to_string(),
            location,
        });
    }
    records
}

fn version_from_filename(location: &str) -> Option<String> {
    let stem = Path::new(location).file_stem()?.to_str()?;
    let suffix = match stem.rsplit_once('_') {
        Some((_, suffix)) => suffix,
        None => stem,
    };
    (!suffix.is_empty()).then(|| suffix.to_string())
}

/// Parses a `"name=detail,name=detail"` mode table. Entries without an `=`
/// carry no detail.
pub(crate) fn parse_mode_table(raw: &str) -> Vec<StreamMode> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((name, detail)) => StreamMode {
                name: name.to_string(),
                detail: Some(detail.to_string()),
            },
            None => StreamMode {
                name: entry.to_string(),
                detail: None,
            },
        })
        .collect()
}

/// Coalesces modes sharing an alphabetic prefix and differing only by
/// trailing digits into one entry named by the bare prefix, if and only if
/// the family has more than one member and every member carries the same
/// detail. This merge is deliberately lossy; unequal siblings stay verbatim
/// so no quality variant is misreported.
pub(crate) fn group_modes(modes: Vec<StreamMode>) -> Vec<StreamMode> {
    let mut family_order: Vec<String> = Vec::new();
    let mut families: BTreeMap<String, Vec<StreamMode>> = BTreeMap::new();
    for mode in modes {
        let family = mode
            .name
            .trim_end_matches(|c: char| c.is_ascii_digit())
            .to_string();
        if !families.contains_key(&family) {
            family_order.push(family.clone());
        }
        families.entry(family).or_default().push(mode);
    }

    let mut grouped = Vec::new();
    for family in family_order {
        let members = families.remove(&family).unwrap_or_default();
        let merge = !family.is_empty()
            && members.len() > 1
            && members.windows(2).all(|pair| pair[0].detail == pair[1].detail);
        if merge {
            let detail = members.into_iter().next().and_then(|mode| mode.detail);
            grouped.push(StreamMode {
                name: family,
                detail,
            });
        } else {
            grouped.extend(members);
        }
    }
    grouped
}

/// Orders modes by descending numeric detail (bitrate or size); modes with
/// no parseable number sort last. The sort is stable, so equal qualities
/// keep their tool-reported order.
pub(crate) fn sort_modes_by_quality(modes: &mut [StreamMode]) {
    modes.sort_by(|a, b| {
        let left = a.detail.as_deref().and_then(quality_number);
        let right = b.detail.as_deref().and_then(quality_number);
        right.cmp(&left)
    });
}

fn quality_number(detail: &str) -> Option<u64> {
    let digits: String = detail.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
