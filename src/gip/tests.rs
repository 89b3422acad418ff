use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::Duration;

use super::facade::resolve_get_iplayer_bin_from_env;
use super::limiter::ProcessLimiter;
use super::parse::*;
use super::pending::{Outcome, PendingResult};
use super::process::{GroupTerminator, ProcessRegistry};
use super::*;

struct RecordingTerminator {
    killed: Arc<Mutex<Vec<i32>>>,
}

impl GroupTerminator for RecordingTerminator {
    fn terminate(&self, pgid: i32) -> io::Result<()> {
        self.killed.lock().expect("terminator lock").push(pgid);
        Ok(())
    }
}

struct FailingTerminator;

impl GroupTerminator for FailingTerminator {
    fn terminate(&self, _pgid: i32) -> io::Result<()> {
        Err(io::Error::other("kill refused"))
    }
}

#[test]
fn parse_listings_yields_names_and_counts_in_input_order() {
    let listings = parse_listings("BBC One (42)\nBBC Two (7)");
    assert_eq!(
        listings,
        vec![("BBC One".to_string(), 42), ("BBC Two".to_string(), 7)]
    );
}

#[test]
fn parse_listings_skips_lines_outside_the_grammar() {
    let input = "Matching Programmes\n\nBBC Four (3)\nINFO: 3 Matching Programmes\n";
    assert_eq!(parse_listings(input), vec![("BBC Four".to_string(), 3)]);
}

#[test]
fn parse_listings_keeps_parentheses_inside_names() {
    let listings = parse_listings("Panorama (1953-) (12)");
    assert_eq!(listings, vec![("Panorama (1953-)".to_string(), 12)]);
}

#[test]
fn parse_match_count_reads_the_total_line() {
    let input = "Matching Programmes\n\nINFO: 17 Matching Programmes\n";
    let count = parse_match_count(input).expect("total line should parse");
    assert_eq!(count, 17);
}

#[test]
fn parse_match_count_rejects_output_without_a_total() {
    assert!(parse_match_count("no totals here").is_err());
}

#[test]
fn parse_episodes_groups_by_series_and_sorts_by_episode_number() {
    let input = "Series X\n  13: (2) Episode Two\n  12: (1) Pilot\n";
    let episodes = parse_episodes(input);
    assert_eq!(
        episodes.get("Series X").expect("series should be present"),
        &vec![
            Episode {
                index: 12,
                title: "Pilot".to_string()
            },
            Episode {
                index: 13,
                title: "Episode Two".to_string()
            },
        ]
    );
}

#[test]
fn parse_episodes_treats_missing_episode_number_as_zero() {
    let input = "One-offs\n  7: (5) Late Special\n  5: () Standalone\n";
    let episodes = parse_episodes(input);
    let titles: Vec<&str> = episodes
        .get("One-offs")
        .expect("series should be present")
        .iter()
        .map(|episode| episode.title.as_str())
        .collect();
    assert_eq!(titles, vec!["Standalone", "Late Special"]);
}

#[test]
fn parse_versions_splits_collections_and_drops_duplicates() {
    let collections = vec![
        "default,signed".to_string(),
        "default,audiodescribed".to_string(),
        String::new(),
    ];
    assert_eq!(
        parse_versions(&collections),
        vec![
            "audiodescribed".to_string(),
            "default".to_string(),
            "signed".to_string()
        ]
    );
}

#[test]
fn parse_info_splits_version_scoped_fields() {
    let versions = vec!["default".to_string(), "signed".to_string()];
    let input = "get_iplayer preamble\n\nname: Doctor Who\ndesc: default: A Time Lord travels\ndesc: signed: A Time Lord travels, signed\nchannel: BBC One\n\nINFO: 1 Matching Programmes\n";
    let info = parse_info(input, &versions).expect("info should parse");
    assert_eq!(
        info.get("name"),
        Some(&InfoValue::Plain("Doctor Who".to_string()))
    );
    assert_eq!(
        info.get("channel"),
        Some(&InfoValue::Plain("BBC One".to_string()))
    );
    let mut scoped = BTreeMap::new();
    scoped.insert("default".to_string(), "A Time Lord travels".to_string());
    scoped.insert(
        "signed".to_string(),
        "A Time Lord travels, signed".to_string(),
    );
    assert_eq!(info.get("desc"), Some(&InfoValue::Versioned(scoped)));
}

#[test]
fn parse_info_rejects_output_without_sections() {
    let versions = vec!["default".to_string()];
    assert!(parse_info("name: lonely line", &versions).is_err());
}

#[test]
fn parse_history_reads_tuple_lines_and_guesses_versions_from_filenames() {
    let input = "(123):(Doctor Who):(Rose):(default):(flashhigh):(/downloads/doctor_who_rose_audiodescribed.mp4)\n";
    let guessed = parse_history(input, true);
    assert_eq!(guessed.len(), 1);
    assert_eq!(guessed[0].index, 123);
    assert_eq!(guessed[0].name, "Doctor Who");
    assert_eq!(guessed[0].version, "audiodescribed");

    let plain = parse_history(input, false);
    assert_eq!(plain[0].version, "default");
}

#[test]
fn parse_history_without_underscore_falls_back_to_whole_stem() {
    let input = "(9):(News):(Evening):(default):(flashlow):(/downloads/bulletin.mp4)\n";
    let records = parse_history(input, true);
    assert_eq!(records[0].version, "bulletin");
}

#[test]
fn mode_grouping_merges_only_families_with_identical_details() {
    let modes = parse_mode_table("flashlow1=10MB,flashlow2=10MB,flashhigh1=50MB");
    let grouped = group_modes(modes);
    assert_eq!(
        grouped,
        vec![
            StreamMode {
                name: "flashlow".to_string(),
                detail: Some("10MB".to_string())
            },
            StreamMode {
                name: "flashhigh1".to_string(),
                detail: Some("50MB".to_string())
            },
        ]
    );
}

#[test]
fn mode_grouping_keeps_unequal_siblings_apart() {
    let modes = parse_mode_table("flashlow1=10MB,flashlow2=20MB");
    let grouped = group_modes(modes.clone());
    assert_eq!(grouped, modes);
}

#[test]
fn modes_sort_by_descending_quality_with_unknowns_last() {
    let mut modes = parse_mode_table("flashlow=10MB,flashhd=100MB,subtitles,flashhigh=50MB");
    sort_modes_by_quality(&mut modes);
    let names: Vec<&str> = modes.iter().map(|mode| mode.name.as_str()).collect();
    assert_eq!(names, vec!["flashhd", "flashhigh", "flashlow", "subtitles"]);
}

#[test]
fn programme_info_resolves_stream_modes_for_a_version() {
    let mut scoped = BTreeMap::new();
    scoped.insert(
        "default".to_string(),
        "flashlow1=10MB,flashlow2=10MB,flashhigh1=50MB".to_string(),
    );
    let mut fields = BTreeMap::new();
    fields.insert("modesizes".to_string(), InfoValue::Versioned(scoped));
    let info = ProgrammeInfo {
        fields,
        expired: false,
    };
    let modes = info.stream_modes("default");
    let names: Vec<&str> = modes.iter().map(|mode| mode.name.as_str()).collect();
    assert_eq!(names, vec!["flashhigh1", "flashlow"]);
    assert!(info.stream_modes("signed").is_empty());
}

#[test]
fn get_result_runs_the_producer_once_for_concurrent_callers() {
    let runs = Arc::new(AtomicUsize::new(0));
    let producer_runs = Arc::clone(&runs);
    let pending = PendingResult::new(
        || false,
        move || {
            thread::sleep(Duration::from_millis(30));
            producer_runs.fetch_add(1, Ordering::SeqCst);
            Outcome::ok(7)
        },
    );

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pending = pending.clone();
        handles.push(thread::spawn(move || pending.get_result()));
    }
    for handle in handles {
        assert_eq!(handle.join().expect("caller should not panic"), 7);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn has_result_reports_true_forever_after_production() {
    let pending = PendingResult::new(|| false, || Outcome::ok(1));
    assert!(!pending.has_result());
    assert_eq!(pending.get_result(), 1);
    assert!(pending.has_result());
}

#[test]
fn callbacks_fire_exactly_once_in_registration_order() {
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let pending = PendingResult::new(
        || false,
        move || {
            release_rx.recv().expect("release signal");
            Outcome::ok(99)
        },
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 1..=3 {
        let order = Arc::clone(&order);
        pending.on_complete(move |value| {
            if value == 99 {
                order.lock().expect("order lock").push(i);
            }
        });
    }
    pending.on_settled(move |_| {
        done_tx.send(()).expect("done signal");
    });

    release_tx.send(()).expect("waiter should be listening");
    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("callbacks should run after release");
    assert_eq!(*order.lock().expect("order lock"), vec![1, 2, 3]);

    // A callback registered after settlement fires immediately.
    let order_late = Arc::clone(&order);
    pending.on_complete(move |_| order_late.lock().expect("order lock").push(4));
    assert_eq!(*order.lock().expect("order lock"), vec![1, 2, 3, 4]);
}

#[test]
fn on_complete_or_error_routes_on_the_error_channel() {
    let pending: PendingResult<()> =
        PendingResult::from_outcome(Outcome::with_errors((), vec!["ERROR: boom".to_string()]));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let on_success = Arc::clone(&seen);
    let on_error = Arc::clone(&seen);
    pending.on_complete_or_error(
        move |_| on_success.lock().expect("seen lock").push("success"),
        move |errors| {
            if errors == vec!["ERROR: boom".to_string()] {
                on_error.lock().expect("seen lock").push("error");
            }
        },
    );
    assert_eq!(*seen.lock().expect("seen lock"), vec!["error"]);
}

#[test]
fn translate_maps_the_value_and_passes_errors_through() {
    let pending = PendingResult::from_outcome(Outcome::with_errors(2, vec!["ERROR: a".to_string()]));
    let doubled = pending.translate(|value| value * 2);
    let outcome = doubled.outcome();
    assert_eq!(outcome.value, 4);
    assert_eq!(outcome.errors, vec!["ERROR: a".to_string()]);
}

#[test]
fn then_accumulates_errors_from_both_stages() {
    let first = PendingResult::from_outcome(Outcome::with_errors(1, vec!["ERROR: first".to_string()]));
    let chained = first.then(|value| {
        PendingResult::from_outcome(Outcome::with_errors(
            value + 1,
            vec!["ERROR: second".to_string()],
        ))
    });
    let outcome = chained.outcome();
    assert_eq!(outcome.value, 2);
    assert_eq!(
        outcome.errors,
        vec!["ERROR: first".to_string(), "ERROR: second".to_string()]
    );
}

#[test]
fn then_is_not_ready_until_the_inner_result_is() {
    let inner_ready = Arc::new(AtomicBool::new(false));
    let probe_flag = Arc::clone(&inner_ready);
    let inner = PendingResult::new(move || probe_flag.load(Ordering::SeqCst), || Outcome::ok(2));
    let inner_for_chain = inner.clone();
    let chained = PendingResult::constant(1).then(move |_| inner_for_chain.clone());
    assert!(!chained.has_result());
    inner_ready.store(true, Ordering::SeqCst);
    assert!(chained.has_result());
    assert_eq!(chained.get_result(), 2);
}

#[test]
fn all_collects_named_values_and_accumulates_errors() {
    let entries = vec![
        ("a".to_string(), PendingResult::constant(1)),
        (
            "b".to_string(),
            PendingResult::from_outcome(Outcome::with_errors(2, vec!["ERROR: b".to_string()])),
        ),
    ];
    let combined = PendingResult::all(entries);
    let outcome = combined.outcome();
    assert_eq!(outcome.value.get("a"), Some(&1));
    assert_eq!(outcome.value.get("b"), Some(&2));
    assert_eq!(outcome.errors, vec!["ERROR: b".to_string()]);
}

#[test]
fn limiter_terminates_the_oldest_process_beyond_the_bound() {
    let killed = Arc::new(Mutex::new(Vec::new()));
    let limiter = ProcessLimiter::with_terminator(
        1,
        Box::new(RecordingTerminator {
            killed: Arc::clone(&killed),
        }),
    );

    limiter.add_process(101, 1101);
    assert!(killed.lock().expect("killed lock").is_empty());
    assert_eq!(limiter.active(), 1);

    limiter.add_process(202, 1202);
    assert_eq!(*killed.lock().expect("killed lock"), vec![1101]);
    assert_eq!(limiter.active(), 1);
    assert!(limiter.tracks(202));
    assert!(!limiter.tracks(101));
}

#[test]
fn limiter_close_terminates_every_tracked_process() {
    let killed = Arc::new(Mutex::new(Vec::new()));
    let limiter = ProcessLimiter::with_terminator(
        4,
        Box::new(RecordingTerminator {
            killed: Arc::clone(&killed),
        }),
    );
    limiter.add_process(11, 111);
    limiter.add_process(22, 222);
    limiter.close();
    assert_eq!(limiter.active(), 0);
    let mut killed = killed.lock().expect("killed lock").clone();
    killed.sort_unstable();
    assert_eq!(killed, vec![111, 222]);
}

#[test]
fn limiter_eviction_failure_is_swallowed() {
    let limiter = ProcessLimiter::with_terminator(1, Box::new(FailingTerminator));
    limiter.add_process(1, 10);
    limiter.add_process(2, 20);
    assert_eq!(limiter.active(), 1);
    assert!(limiter.tracks(2));
}

#[test]
fn registry_tracks_processes_until_resolution_then_kills_the_rest() {
    let registry = ProcessRegistry::new();
    registry.register(1, 10);
    registry.register(2, 20);
    assert_eq!(registry.live_count(), 2);

    registry.deregister(1);
    assert_eq!(registry.live_count(), 1);

    let killed = Arc::new(Mutex::new(Vec::new()));
    registry.terminate_all(&RecordingTerminator {
        killed: Arc::clone(&killed),
    });
    assert_eq!(*killed.lock().expect("killed lock"), vec![20]);
    assert_eq!(registry.live_count(), 0);
}

#[test]
fn resolve_bin_prefers_a_nonempty_env_override() {
    assert_eq!(
        resolve_get_iplayer_bin_from_env(None),
        PathBuf::from("get_iplayer")
    );
    assert_eq!(
        resolve_get_iplayer_bin_from_env(Some("".into())),
        PathBuf::from("get_iplayer")
    );
    assert_eq!(
        resolve_get_iplayer_bin_from_env(Some("/opt/get_iplayer".into())),
        PathBuf::from("/opt/get_iplayer")
    );
}

#[test]
fn facade_construction_fails_for_a_missing_executable() {
    let limiter = Arc::new(ProcessLimiter::new(1));
    let config = GipConfig {
        location: Some(PathBuf::from("/nonexistent/get_iplayer-test-bin")),
        ..GipConfig::default()
    };
    let err = match GetIplayer::new(config, limiter) {
        Ok(_) => panic!("missing binary should fail fast"),
        Err(err) => err,
    };
    assert!(err.to_string().contains("not found"));
}

#[cfg(unix)]
mod process_spawning {
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    use super::super::process::{spawn_buffered, spawn_streaming};

    #[test]
    fn buffered_spawn_captures_stdout_and_collects_stderr_as_errors() {
        let argv = vec![
            "-c".to_string(),
            "echo hello; echo 'ERROR: boom' 1>&2".to_string(),
        ];
        let spawned = spawn_buffered(Path::new("/bin/sh"), &argv).expect("sh should spawn");
        let collected = spawned.collect();
        assert_eq!(collected.stdout.trim(), "hello");
        assert_eq!(collected.errors, vec!["ERROR: boom".to_string()]);
    }

    #[test]
    fn buffered_spawn_classifies_stdout_error_lines() {
        let argv = vec![
            "-c".to_string(),
            "printf 'Doctor Who (1)\\nERROR: bad stream\\nWARNING: New version 3.35\\n'".to_string(),
        ];
        let spawned = spawn_buffered(Path::new("/bin/sh"), &argv).expect("sh should spawn");
        let collected = spawned.collect();
        assert!(collected.stdout.contains("Doctor Who (1)"));
        assert_eq!(collected.errors, vec!["ERROR: bad stream".to_string()]);
    }

    #[test]
    fn nonzero_exit_without_diagnostics_still_reaches_the_error_channel() {
        let argv = vec!["-c".to_string(), "exit 3".to_string()];
        let spawned = spawn_buffered(Path::new("/bin/sh"), &argv).expect("sh should spawn");
        let collected = spawned.collect();
        assert_eq!(collected.errors.len(), 1);
        assert!(collected.errors[0].contains("exited with"));
    }

    #[test]
    fn finished_probe_flips_after_exit() {
        let argv = vec!["-c".to_string(), "exit 0".to_string()];
        let spawned = spawn_buffered(Path::new("/bin/sh"), &argv).expect("sh should spawn");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !spawned.is_finished() {
            assert!(
                std::time::Instant::now() < deadline,
                "process should finish promptly"
            );
            thread::sleep(Duration::from_millis(10));
        }
        let collected = spawned.collect();
        assert!(collected.errors.is_empty());
    }

    #[test]
    fn streaming_spawn_writes_into_the_supplied_pipe() {
        use std::io::Read;

        let (mut reader, writer) = std::io::pipe().expect("pipe should allocate");
        let argv = vec!["-c".to_string(), "echo streamed".to_string()];
        let spawned = spawn_streaming(Path::new("/bin/sh"), &argv, writer.into())
            .expect("sh should spawn");
        let mut streamed = String::new();
        reader
            .read_to_string(&mut streamed)
            .expect("pipe read should succeed");
        assert_eq!(streamed.trim(), "streamed");
        let collected = spawned.collect();
        assert!(collected.errors.is_empty());
    }
}
