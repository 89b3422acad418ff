use std::collections::{BTreeMap, HashMap};
use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, PipeReader};
use std::path::{Path, PathBuf};
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use chrono::Local;

use super::limiter::ProcessLimiter;
use super::parse;
use super::pending::{Outcome, PendingResult};
use super::process::{self, CallArgs, ProcessRegistry, SignalTerminator, SpawnedProcess};
use super::{EpisodeTree, Facet, HistoryRecord, ProgrammeInfo, Recording, SearchFilters, StreamMode};
use crate::paths::default_download_dir;

/// Ten years. Pinned on every catalogue query so an unrelated lookup never
/// triggers a full cache rebuild as a side effect.
const CACHE_EXPIRY_SECS: &str = "315360000";

pub fn resolve_get_iplayer_bin() -> PathBuf {
    resolve_get_iplayer_bin_from_env(env::var_os("GIPTRACK_GET_IPLAYER_BIN"))
}

pub(crate) fn resolve_get_iplayer_bin_from_env(env_value: Option<OsString>) -> PathBuf {
    match env_value {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from("get_iplayer"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct GipConfig {
    pub location: Option<PathBuf>,
    pub flvstreamer: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

/// Drives the get_iplayer executable. Every operation shells out, wraps the
/// pending invocation in a [`PendingResult`] and translates the captured
/// output through the matching parser; failures travel on the result's
/// error channel, never as panics on a worker thread.
#[derive(Clone)]
pub struct GetIplayer {
    bin: PathBuf,
    stock_flags: Vec<(String, String)>,
    output_dir: PathBuf,
    recordings: Arc<Mutex<HashMap<u32, Recording>>>,
    versions: PendingResult<Vec<String>>,
    limiter: Arc<ProcessLimiter>,
    registry: Arc<ProcessRegistry>,
}

impl GetIplayer {
    /// Fails fast if the executable cannot be spawned, rather than failing
    /// lazily on first use. The known version set is fetched once here and
    /// cached for every later info query.
    pub fn new(config: GipConfig, limiter: Arc<ProcessLimiter>) -> Result<GetIplayer> {
        let bin = config.location.unwrap_or_else(resolve_get_iplayer_bin);
        verify_spawnable(&bin)?;

        let mut stock_flags = Vec::new();
        if let Some(flvstreamer) = config.flvstreamer {
            stock_flags.push(("flvstreamer".to_string(), flvstreamer.display().to_string()));
        }
        if let Some(ffmpeg) = config.ffmpeg {
            stock_flags.push(("ffmpeg".to_string(), ffmpeg.display().to_string()));
        }

        let output_dir = match config.output_dir {
            Some(dir) => dir,
            None => default_download_dir()?,
        };
        fs::create_dir_all(&output_dir).with_context(|| {
            format!("failed to create download directory {}", output_dir.display())
        })?;

        let mut gip = GetIplayer {
            bin,
            stock_flags,
            output_dir,
            recordings: Arc::new(Mutex::new(HashMap::new())),
            versions: PendingResult::constant(Vec::new()),
            limiter,
            registry: Arc::new(ProcessRegistry::new()),
        };
        gip.versions = gip.get_filters(Facet::Version, None, &SearchFilters::default());
        Ok(gip)
    }

    /// Distinct values of one facet across programmes matching the filters
    /// on the others.
    pub fn get_filters(
        &self,
        facet: Facet,
        search: Option<&str>,
        filters: &SearchFilters,
    ) -> PendingResult<Vec<String>> {
        let args = apply_filters(self.query_args(search), filters, true)
            .flag("list", facet.list_name());
        let listed = self.call(args).translate(|output| {
            parse::parse_listings(&output)
                .into_iter()
                .map(|(name, _)| name)
                .collect::<Vec<String>>()
        });
        match facet {
            // Version listings come back comma-joined per programme and
            // need a second pass to become individual version names.
            Facet::Version => listed.translate(|names| parse::parse_versions(&names)),
            _ => listed,
        }
    }

    /// Like [`get_filters`](Self::get_filters), prefixed with an
    /// empty-string entry when any matching programme has the facet blank.
    pub fn get_filters_and_blanks(
        &self,
        facet: Facet,
        search: Option<&str>,
        filters: &SearchFilters,
    ) -> PendingResult<Vec<String>> {
        let normal = self.get_filters(facet, search, filters);
        let missing = self.count_missing_attrib(facet, search, filters);
        let ready = (normal.clone(), missing.clone());
        PendingResult::new(
            move || ready.0.has_result() && ready.1.has_result(),
            move || {
                let names = normal.outcome();
                let blanks = missing.outcome();
                let mut values = names.value;
                if blanks.value > 0 {
                    values.insert(0, String::new());
                }
                let mut errors = names.errors;
                errors.extend(blanks.errors);
                Outcome::with_errors(values, errors)
            },
        )
    }

    /// Counts programmes with the given facet blank that fit the other
    /// filters. Types and versions cannot be blank, so their count is a
    /// ready zero with no tool invocation.
    pub fn count_missing_attrib(
        &self,
        facet: Facet,
        search: Option<&str>,
        filters: &SearchFilters,
    ) -> PendingResult<u32> {
        if matches!(facet, Facet::Type | Facet::Version) {
            return PendingResult::constant(0);
        }
        let args = apply_filters(self.query_args(search), filters, false)
            .flag(format!("exclude-{}", facet.flag_name()), ".+");
        self.call(args).translate_outcome(|mut outcome| {
            match parse::parse_match_count(&outcome.value) {
                Ok(count) => Outcome::with_errors(count, outcome.errors),
                Err(err) => {
                    outcome
                        .errors
                        .push(format!("ERROR: unexpected get_iplayer output: {err}"));
                    Outcome::with_errors(0, outcome.errors)
                }
            }
        })
    }

    /// Episodes matching the search and filters, grouped by series.
    pub fn get_episodes(
        &self,
        search: Option<&str>,
        filters: &SearchFilters,
    ) -> PendingResult<EpisodeTree> {
        let args = apply_filters(self.query_args(search), filters, true)
            .switch("tree")
            .flag("listformat", "<index>: (<episodenum>) <episode>");
        self.call(args)
            .translate(|output| parse::parse_episodes(&output))
    }

    /// The version identifiers known to the catalogue, fetched once at
    /// construction.
    pub fn known_versions(&self) -> PendingResult<Vec<String>> {
        self.versions.clone()
    }

    /// Full info for one programme. The cached version set is needed to
    /// split version-scoped fields, so this chains on it.
    pub fn get_programme_info(&self, index: u32) -> PendingResult<ProgrammeInfo> {
        let this = self.clone();
        self.versions
            .then(move |versions| this.programme_info_for_versions(index, versions))
    }

    fn programme_info_for_versions(
        &self,
        index: u32,
        versions: Vec<String>,
    ) -> PendingResult<ProgrammeInfo> {
        let args = self
            .query_args(None)
            .positional(index)
            .switch("info")
            .flag("versions", versions.join(","));
        self.call(args).translate_outcome(move |outcome| {
            let mut errors = outcome.errors;
            let mut expired = false;
            // A withdrawn programme is a state, not a failure; the
            // diagnostic line must not reach the error channel.
            errors.retain(|line| {
                let gone = line
                    .to_ascii_lowercase()
                    .contains("no programmes are available for this pid");
                if gone {
                    expired = true;
                }
                !gone
            });
            let fields = match parse::parse_info(&outcome.value, &versions) {
                Ok(fields) => fields,
                Err(err) => {
                    if !expired {
                        errors.push(format!("ERROR: unexpected get_iplayer output: {err}"));
                    }
                    BTreeMap::new()
                }
            };
            Outcome::with_errors(ProgrammeInfo { fields, expired }, errors)
        })
    }

    /// Delivery modes for one programme version, best quality first.
    pub fn get_stream_info(&self, index: u32, version: &str) -> PendingResult<Vec<StreamMode>> {
        let version = version.to_string();
        self.get_programme_info(index)
            .translate(move |info| info.stream_modes(&version))
    }

    /// Records a programme to the download directory. The index is tracked
    /// as in progress until the external call settles, success or failure.
    pub fn record_programme(
        &self,
        index: u32,
        display_name: Option<&str>,
        version: &str,
        mode: &str,
    ) -> PendingResult<String> {
        let name = display_name
            .map(str::to_string)
            .unwrap_or_else(|| format!("Programme {index}"));
        lock(&self.recordings).insert(
            index,
            Recording {
                name,
                version: version.to_string(),
                mode: mode.to_string(),
                started: Local::now(),
            },
        );
        let args = CallArgs::new()
            .positional(index)
            .switch("get")
            .switch("q")
            .flag("output", self.output_dir.display().to_string())
            .flag("versions", version)
            .flag("modes", mode);
        let recording = self.call(args);
        let recordings = Arc::clone(&self.recordings);
        recording.on_settled(move |_| {
            lock(&recordings).remove(&index);
        });
        recording
    }

    /// Recordings still in progress, keyed by programme index.
    pub fn recordings(&self) -> HashMap<u32, Recording> {
        lock(&self.recordings).clone()
    }

    /// Streams a programme into a freshly allocated OS pipe and returns the
    /// read end plus the call's eventual completion. The streaming process
    /// is registered with the limiter, so starting a new stream reclaims
    /// the one backing the previous playback.
    pub fn stream_programme_to_pipe(
        &self,
        index: u32,
        version: &str,
        mode: &str,
    ) -> Result<(PipeReader, PendingResult<()>)> {
        let (reader, writer) = io::pipe().context("failed to allocate a stream pipe")?;
        let args = CallArgs::new()
            .positional(index)
            .flag("versions", version)
            .flag("modes", mode)
            .switch("stream")
            .switch("q");
        let argv = args.render(&self.stock_flags);
        let spawned = process::spawn_streaming(&self.bin, &argv, writer.into())
            .with_context(|| format!("failed to launch {}", self.bin.display()))?;
        let pid = spawned.pid();
        self.registry.register(pid, spawned.pgid());
        self.limiter.add_process(pid, spawned.pgid());
        let registry = Arc::clone(&self.registry);
        let probe = spawned.clone();
        let pending = PendingResult::new(
            move || probe.is_finished(),
            move || {
                let collected = spawned.collect();
                registry.deregister(pid);
                Outcome::with_errors((), collected.errors)
            },
        );
        Ok((reader, pending))
    }

    /// Streams a programme to an external player command's stdin.
    pub fn stream_programme_to_external(
        &self,
        index: u32,
        version: &str,
        mode: &str,
        player: &str,
    ) -> PendingResult<String> {
        let args = CallArgs::new()
            .positional(index)
            .flag("versions", version)
            .flag("modes", mode)
            .switch("stream")
            .flag("player", player)
            .switch("q");
        let argv = args.render(&self.stock_flags);
        match process::spawn_buffered(&self.bin, &argv) {
            Ok(spawned) => {
                self.limiter.add_process(spawned.pid(), spawned.pgid());
                self.wrap_spawned(spawned)
            }
            Err(err) => spawn_failure(&self.bin, err),
        }
    }

    /// Persisted download records, optionally with the version field
    /// corrected from each stored filename.
    pub fn get_history(&self, guess_version: bool) -> PendingResult<Vec<HistoryRecord>> {
        let args = self.query_args(None).switch("history").flag(
            "listformat",
            "(<index>):(<name>):(<episode>):(<versions>):(<mode>):(<filename>)",
        );
        self.call(args)
            .translate(move |output| parse::parse_history(&output, guess_version))
    }

    /// Fetches subtitles only, into the download directory.
    pub fn get_subtitles(&self, index: u32, version: &str) -> PendingResult<String> {
        let args = CallArgs::new()
            .positional(index)
            .switch("subtitles-only")
            .flag("versions", version)
            .flag("output", self.output_dir.display().to_string())
            .switch("q");
        self.call(args)
    }

    /// Forces the catalogue cache to rebuild for the given programme types,
    /// or all of them, picking up newly published programmes.
    pub fn refresh_cache(&self, full: bool, types: &[String]) -> PendingResult<String> {
        let joined = if types.is_empty() {
            "all".to_string()
        } else {
            types.join(",")
        };
        let mut args = CallArgs::new().switch("refresh").flag("type", joined);
        if full {
            args = args.switch("force");
        }
        self.call(args)
    }

    /// Terminates the active stream and any invocation still in flight.
    pub fn close(&self) {
        self.limiter.close();
        self.registry.terminate_all(&SignalTerminator);
    }

    fn query_args(&self, search: Option<&str>) -> CallArgs {
        let mut args = CallArgs::new();
        if let Some(search) = search {
            args = args.positional(search);
        }
        args.flag("expiry", CACHE_EXPIRY_SECS)
    }

    fn call(&self, args: CallArgs) -> PendingResult<String> {
        let argv = args.render(&self.stock_flags);
        match process::spawn_buffered(&self.bin, &argv) {
            Ok(spawned) => self.wrap_spawned(spawned),
            Err(err) => spawn_failure(&self.bin, err),
        }
    }

    fn wrap_spawned(&self, spawned: SpawnedProcess) -> PendingResult<String> {
        let pid = spawned.pid();
        self.registry.register(pid, spawned.pgid());
        let registry = Arc::clone(&self.registry);
        let probe = spawned.clone();
        PendingResult::new(
            move || probe.is_finished(),
            move || {
                let collected = spawned.collect();
                registry.deregister(pid);
                Outcome::with_errors(collected.stdout, collected.errors)
            },
        )
    }
}

fn verify_spawnable(bin: &Path) -> Result<()> {
    let status = ProcessCommand::new(bin)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            Err(anyhow!("get_iplayer not found at {}", bin.display()))
        }
        Err(err) => Err(err).with_context(|| format!("failed to launch {}", bin.display())),
    }
}

fn spawn_failure(bin: &Path, err: io::Error) -> PendingResult<String> {
    PendingResult::from_outcome(Outcome::with_errors(
        String::new(),
        vec![format!("ERROR: failed to launch {}: {err}", bin.display())],
    ))
}

fn apply_filters(mut args: CallArgs, filters: &SearchFilters, include_version: bool) -> CallArgs {
    args = args.flag("type", filters.prog_type.as_str());
    args = blank_aware_filter(args, "channel", &filters.channel);
    args = blank_aware_filter(args, "category", &filters.category);
    if include_version {
        args = args.flag("version", filters.version.as_str());
    }
    args
}

/// An empty filter value means "only programmes with this facet blank",
/// which the tool expresses as match-anything plus exclude-anything-present.
fn blank_aware_filter(args: CallArgs, name: &str, value: &str) -> CallArgs {
    if value.is_empty() {
        args.flag(format!("exclude-{name}"), ".+").flag(name, ".*")
    } else {
        args.flag(name, value)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
