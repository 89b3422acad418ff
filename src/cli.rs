use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::gip::{Facet, SearchFilters};

#[derive(Debug, Parser)]
#[command(
    name = "giptrack",
    version,
    about = "Browse, record and stream iPlayer programmes via get_iplayer"
)]
pub struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    pub get_iplayer: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    pub flvstreamer: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    pub ffmpeg: Option<PathBuf>,
    #[arg(long, global = true, value_name = "DIR")]
    pub output: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Filters {
        facet: FacetArg,
        search: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
        #[arg(long)]
        with_blanks: bool,
    },
    Episodes {
        search: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    Info {
        index: u32,
    },
    Modes {
        index: u32,
        #[arg(long)]
        version: Option<String>,
    },
    Record {
        index: u32,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "default")]
        version: String,
        #[arg(long, default_value = "best")]
        mode: String,
    },
    Stream {
        index: u32,
        #[arg(long, default_value = "default")]
        version: String,
        #[arg(long, default_value = "best")]
        mode: String,
        #[arg(long)]
        player: Option<String>,
    },
    History {
        #[arg(long)]
        no_guess_version: bool,
    },
    Refresh {
        #[arg(long)]
        full: bool,
        types: Vec<String>,
    },
    Subtitles {
        index: u32,
        #[arg(long, default_value = "default")]
        version: String,
    },
}

#[derive(Debug, Args)]
pub struct FilterArgs {
    #[arg(long = "type", default_value = "all")]
    pub prog_type: String,
    #[arg(long, default_value = ".*")]
    pub channel: String,
    #[arg(long, default_value = ".*")]
    pub category: String,
    #[arg(long, default_value = ".*")]
    pub version: String,
}

impl From<FilterArgs> for SearchFilters {
    fn from(args: FilterArgs) -> Self {
        SearchFilters {
            prog_type: args.prog_type,
            channel: args.channel,
            category: args.category,
            version: args.version,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FacetArg {
    Type,
    Channel,
    Category,
    Version,
}

impl From<FacetArg> for Facet {
    fn from(facet: FacetArg) -> Self {
        match facet {
            FacetArg::Type => Facet::Type,
            FacetArg::Channel => Facet::Channel,
            FacetArg::Category => Facet::Category,
            FacetArg::Version => Facet::Version,
        }
    }
}
