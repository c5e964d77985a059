//! `wordstore` maintenance command.

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;
use wordstore_core::{Config, Datastore, OpenMode, PruneThresholds};
use wordstore_tools::{CountField, DumpOptions, LoadOptions, ToolError, ToolResult};

/// Maintain a wordstore directory
#[derive(Parser, Debug)]
#[command(name = "wordstore")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Use the traditional (unlogged, single-writer) backend
    #[arg(long, global = true)]
    traditional: bool,

    /// Record last-seen dates on updated records
    #[arg(long, global = true, action = ArgAction::Set, default_value_t = true)]
    timestamps: bool,

    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Field {
    Spam,
    Good,
}

impl From<Field> for CountField {
    fn from(f: Field) -> Self {
        match f {
            Field::Spam => CountField::Spam,
            Field::Good => CountField::Good,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a wordlist as `token count [date]` lines
    Dump {
        dir: PathBuf,
        list: String,
        /// Counter to print (default: from the list name)
        #[arg(long, value_enum)]
        field: Option<Field>,
        /// Print non-ASCII bytes as '?'
        #[arg(long)]
        ascii: bool,
    },

    /// Merge a dump into a wordlist, creating it if needed
    Load {
        dir: PathBuf,
        list: String,
        /// Dump file to read (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Counter the count column feeds (default: from the list name)
        #[arg(long, value_enum)]
        field: Option<Field>,
    },

    /// Delete rare, stale or overlong tokens
    Prune {
        dir: PathBuf,
        list: String,
        /// Remove tokens seen fewer times than this
        #[arg(long, default_value_t = 0)]
        min_count: u32,
        /// Remove tokens last seen before this YYYYMMDD date
        #[arg(long, default_value_t = 0)]
        min_date: u32,
        /// Remove tokens longer than this many bytes
        #[arg(long, default_value_t = 0)]
        max_token_len: usize,
    },

    /// Replay the log into the wordlists after a crash
    Recover {
        dir: PathBuf,
        /// Scan every retained log segment and skip damaged records
        #[arg(long)]
        catastrophic: bool,
    },

    /// Remove log segments already applied to the wordlists
    PurgeLogs { dir: PathBuf },

    /// Check wordlists, log and process table without changing them
    Verify { dir: PathBuf },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(io::stderr).init();
}

fn config(cli: &Cli, prune: PruneThresholds) -> ToolResult<Config> {
    let base = if cli.traditional {
        Config::traditional()
    } else {
        Config::transactional()
    };
    let config = Config {
        timestamps: cli.timestamps,
        prune,
        ..base
    };
    config
        .validate()
        .map_err(|e| ToolError::Store(wordstore_core::StoreError::InvalidConfig(e)))?;
    Ok(config)
}

fn with_list<T>(
    config: Config,
    dir: &Path,
    list: &str,
    mode: OpenMode,
    f: impl FnOnce(&Datastore, &mut wordstore_core::Handle) -> ToolResult<T>,
) -> ToolResult<T> {
    let ds = Datastore::new(config)?;
    let mut handle = ds.open(dir, list, mode)?;
    let result = f(&ds, &mut handle);
    let closed = ds.close(handle, result.is_ok());
    let value = result?;
    closed?;
    Ok(value)
}

fn run(cli: Cli) -> ToolResult<()> {
    let defaults = PruneThresholds::default();
    match &cli.command {
        Command::Dump {
            dir,
            list,
            field,
            ascii,
        } => {
            let options = DumpOptions {
                field: field.map(Into::into),
                replace_non_ascii: *ascii,
            };
            with_list(config(&cli, defaults)?, dir, list, OpenMode::Read, |_, h| {
                let mut out = BufWriter::new(io::stdout().lock());
                wordstore_tools::dump(h, &mut out, &options).map(|_| ())
            })
        }
        Command::Load {
            dir,
            list,
            input,
            field,
        } => {
            let options = LoadOptions {
                field: field.map(Into::into),
            };
            let config = config(&cli, defaults)?;
            let stats = with_list(config, dir, list, OpenMode::Write, |ds, h| match input {
                Some(path) => {
                    let reader = BufReader::new(File::open(path)?);
                    wordstore_tools::load(ds, h, reader, &options)
                }
                None => wordstore_tools::load(ds, h, io::stdin().lock(), &options),
            })?;
            eprintln!(
                "{} lines, {} merged, {} skipped",
                stats.lines, stats.merged, stats.skipped
            );
            Ok(())
        }
        Command::Prune {
            dir,
            list,
            min_count,
            min_date,
            max_token_len,
        } => {
            let thresholds = PruneThresholds {
                min_count: *min_count,
                min_date: *min_date,
                max_token_len: *max_token_len,
            };
            let config = config(&cli, thresholds)?;
            let removed = with_list(config, dir, list, OpenMode::Write, |ds, h| {
                let thresholds = ds.config().prune;
                wordstore_tools::prune(ds, h, &thresholds)
            })?;
            eprintln!("{removed} records pruned");
            Ok(())
        }
        Command::Recover { dir, catastrophic } => {
            let report = wordstore_tools::recover(dir, &config(&cli, defaults)?, *catastrophic)?;
            eprintln!(
                "{:?} recovery: {} transactions replayed into {} lists",
                report.kind, report.transactions, report.lists
            );
            eprintln!(
                "{} damaged records skipped, {} dead writers cleared",
                report.skipped, report.zombies_cleared
            );
            Ok(())
        }
        Command::PurgeLogs { dir } => {
            let removed = wordstore_tools::purge_logs(dir, &config(&cli, defaults)?)?;
            eprintln!("{removed} log segments removed");
            Ok(())
        }
        Command::Verify { dir } => {
            let report = wordstore_tools::verify(dir, &config(&cli, defaults)?)?;
            for list in &report.lists {
                let version = list
                    .version
                    .map_or_else(|| "-".to_string(), |v| v.to_string());
                let order = if list.byte_order_differs {
                    ", foreign byte order"
                } else {
                    ""
                };
                println!(
                    "{}: {} records, version {version}{order}",
                    list.name, list.records
                );
            }
            println!("{} committed transactions pending checkpoint", report.pending_transactions);
            for problem in &report.problems {
                println!("problem: {problem}");
            }
            if report.is_clean() {
                Ok(())
            } else {
                Err(ToolError::VerifyFailed {
                    dir: report.dir.clone(),
                    problems: report.problems.len(),
                })
            }
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wordstore: {e}");
            if e.is_fatal() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
