use std::io;
use std::sync::{Arc, mpsc};

use anyhow::Result;

use crate::cli::{Cli, Command};
use crate::gip::{
    Facet, GetIplayer, GipConfig, InfoValue, PendingResult, ProcessLimiter, SearchFilters,
    StreamMode,
};

pub fn run(cli: Cli) -> Result<()> {
    let config = GipConfig {
        location: cli.get_iplayer,
        flvstreamer: cli.flvstreamer,
        ffmpeg: cli.ffmpeg,
        output_dir: cli.output,
    };
    let limiter = Arc::new(ProcessLimiter::new(1));
    let gip = GetIplayer::new(config, Arc::clone(&limiter))?;

    let result = match cli.command {
        Command::Filters {
            facet,
            search,
            filters,
            with_blanks,
        } => run_filters(
            &gip,
            facet.into(),
            search.as_deref(),
            &filters.into(),
            with_blanks,
        ),
        Command::Episodes { search, filters } => {
            run_episodes(&gip, search.as_deref(), &filters.into())
        }
        Command::Info { index } => run_info(&gip, index),
        Command::Modes { index, version } => run_modes(&gip, index, version.as_deref()),
        Command::Record {
            index,
            name,
            version,
            mode,
        } => run_record(&gip, index, name.as_deref(), &version, &mode),
        Command::Stream {
            index,
            version,
            mode,
            player,
        } => run_stream(&gip, index, &version, &mode, player.as_deref()),
        Command::History { no_guess_version } => run_history(&gip, !no_guess_version),
        Command::Refresh { full, types } => run_refresh(&gip, full, &types),
        Command::Subtitles { index, version } => run_subtitles(&gip, index, &version),
    };

    gip.close();
    result
}

fn run_filters(
    gip: &GetIplayer,
    facet: Facet,
    search: Option<&str>,
    filters: &SearchFilters,
    with_blanks: bool,
) -> Result<()> {
    let pending = if with_blanks {
        gip.get_filters_and_blanks(facet, search, filters)
    } else {
        gip.get_filters(facet, search, filters)
    };
    let outcome = pending.outcome();
    report_errors(&outcome.errors);
    for value in &outcome.value {
        if value.is_empty() {
            println!("(blank)");
        } else {
            println!("{value}");
        }
    }
    Ok(())
}

fn run_episodes(gip: &GetIplayer, search: Option<&str>, filters: &SearchFilters) -> Result<()> {
    let outcome = gip.get_episodes(search, filters).outcome();
    report_errors(&outcome.errors);
    for (series, episodes) in &outcome.value {
        println!("{series}");
        for episode in episodes {
            println!("  {}: {}", episode.index, episode.title);
        }
    }
    Ok(())
}

fn run_info(gip: &GetIplayer, index: u32) -> Result<()> {
    let outcome = gip.get_programme_info(index).outcome();
    report_errors(&outcome.errors);
    if outcome.value.expired {
        println!("Programme {index} is no longer available.");
        return Ok(());
    }
    for (field, value) in &outcome.value.fields {
        match value {
            InfoValue::Plain(value) => println!("{field}: {value}"),
            InfoValue::Versioned(values) => {
                for (version, value) in values {
                    println!("{field} [{version}]: {value}");
                }
            }
        }
    }
    Ok(())
}

fn run_modes(gip: &GetIplayer, index: u32, version: Option<&str>) -> Result<()> {
    if let Some(version) = version {
        let outcome = gip.get_stream_info(index, version).outcome();
        report_errors(&outcome.errors);
        print_modes(&outcome.value, "");
        return Ok(());
    }

    // No version requested: resolve modes for every known version at once.
    let versions = gip.known_versions().get_result();
    let entries = versions
        .iter()
        .map(|version| (version.clone(), gip.get_stream_info(index, version)))
        .collect();
    let outcome = PendingResult::all(entries).outcome();
    report_errors(&outcome.errors);
    for (version, modes) in &outcome.value {
        if modes.is_empty() {
            continue;
        }
        println!("{version}:");
        print_modes(modes, "  ");
    }
    Ok(())
}

fn print_modes(modes: &[StreamMode], indent: &str) {
    for mode in modes {
        match &mode.detail {
            Some(detail) => println!("{indent}{} ({detail})", mode.name),
            None => println!("{indent}{}", mode.name),
        }
    }
}

fn run_record(
    gip: &GetIplayer,
    index: u32,
    name: Option<&str>,
    version: &str,
    mode: &str,
) -> Result<()> {
    let pending = gip.record_programme(index, name, version, mode);
    if let Some(recording) = gip.recordings().get(&index) {
        println!(
            "Recording {} [{} / {}] started at {}",
            recording.name,
            recording.version,
            recording.mode,
            recording.started.format("%H:%M:%S")
        );
    }

    let (tx, rx) = mpsc::channel::<Vec<String>>();
    let on_error = tx.clone();
    pending.on_complete_or_error(
        move |_| {
            let _ = tx.send(Vec::new());
        },
        move |errors| {
            let _ = on_error.send(errors);
        },
    );
    let errors = rx.recv().unwrap_or_default();
    report_errors(&errors);
    if errors.is_empty() {
        println!("Recording finished.");
    } else {
        println!("Recording failed.");
    }
    Ok(())
}

fn run_stream(
    gip: &GetIplayer,
    index: u32,
    version: &str,
    mode: &str,
    player: Option<&str>,
) -> Result<()> {
    if let Some(player) = player {
        let outcome = gip
            .stream_programme_to_external(index, version, mode, player)
            .outcome();
        report_errors(&outcome.errors);
        return Ok(());
    }

    let (mut reader, pending) = gip.stream_programme_to_pipe(index, version, mode)?;
    pending.on_complete(|_| {
        eprintln!("Stream ended.");
    });
    let mut stdout = io::stdout().lock();
    if let Err(err) = io::copy(&mut reader, &mut stdout) {
        // The consumer going away mid-stream is normal teardown.
        eprintln!("Warning: stream interrupted: {err}");
    }
    report_errors(&pending.get_errors());
    Ok(())
}

fn run_history(gip: &GetIplayer, guess_version: bool) -> Result<()> {
    let outcome = gip.get_history(guess_version).outcome();
    report_errors(&outcome.errors);
    for record in &outcome.value {
        println!(
            "{}: {} - {} [{} / {}] {}",
            record.index, record.name, record.episode, record.version, record.mode, record.location
        );
    }
    Ok(())
}

fn run_refresh(gip: &GetIplayer, full: bool, types: &[String]) -> Result<()> {
    let outcome = gip.refresh_cache(full, types).outcome();
    report_errors(&outcome.errors);
    println!("Cache refreshed.");
    Ok(())
}

fn run_subtitles(gip: &GetIplayer, index: u32, version: &str) -> Result<()> {
    let outcome = gip.get_subtitles(index, version).outcome();
    report_errors(&outcome.errors);
    if outcome.errors.is_empty() {
        println!("Subtitles saved to the download directory.");
    }
    Ok(())
}

fn report_errors(errors: &[String]) {
    for line in errors {
        eprintln!("{line}");
    }
}
