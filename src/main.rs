mod analysis;
mod bundle;
mod dataset;
mod stats;
mod viewer;
mod watcher;

use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use analysis::{Analysis, AnalysisConfig};
use anyhow::{bail, Context, Result};
use argh::FromArgs;
use dataset::{Dataset, ScoreRecord};
use stats::Summary;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use watcher::Watcher;

#[derive(FromArgs, Debug)]
/// Student score statistics
struct Args {
    /// path to the score CSV file
    #[argh(option, short = 'd', default = "PathBuf::from(\"student_score.csv\")")]
    data: PathBuf,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Summary(SummaryArgs),
    Analyze(AnalyzeArgs),
    Add(AddArgs),
    Remove(RemoveArgs),
    Watch(WatchArgs),
    Package(PackageArgs),
    Extract(ExtractArgs),
    List(ListArgs),
    View(ViewArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "summary")]
/// print count, mean, median, min, max and std of the scores
struct SummaryArgs {
    /// print JSON instead of text
    #[argh(switch)]
    json: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "analyze")]
/// compute quartiles, histogram, bands and rankings as JSON
struct AnalyzeArgs {
    /// YAML file overriding the default analysis settings
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// write the JSON here instead of stdout
    #[argh(option, short = 'o')]
    output: Option<PathBuf>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "add")]
/// append a student to the score file
struct AddArgs {
    /// score of the new student
    #[argh(positional)]
    score: f64,

    /// name of the new student
    #[argh(option, short = 'n')]
    name: Option<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "remove")]
/// remove students whose name contains a pattern
struct RemoveArgs {
    /// substring of the names to remove
    #[argh(positional, default = "String::from(\"Test Student\")")]
    pattern: String,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "watch")]
/// re-run a command whenever the score file changes
struct WatchArgs {
    /// polling interval in milliseconds
    #[argh(option, default = "Millis::from_millis(500)")]
    interval: Millis,

    /// quiet period in milliseconds before a change is acted on
    #[argh(option, default = "Millis::from_millis(300)")]
    debounce: Millis,

    /// command to run; defaults to this tool's `summary`
    #[argh(positional)]
    command: Vec<String>,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "package")]
/// bundle images into a base64 JSON package
struct PackageArgs {
    /// directory holding the images
    #[argh(option, default = "PathBuf::from(\".\")")]
    dir: PathBuf,

    /// image file extension
    #[argh(option, short = 'e', default = "Extension::png()")]
    extension: Extension,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "extract")]
/// unpack the newest image package
struct ExtractArgs {
    /// directory holding the packages
    #[argh(option, default = "PathBuf::from(\".\")")]
    dir: PathBuf,

    /// where to write the images; defaults to --dir
    #[argh(option)]
    dest: Option<PathBuf>,

    /// keep the package file after extracting
    #[argh(switch)]
    keep: bool,

    /// image file extension used for the listing afterwards
    #[argh(option, short = 'e', default = "Extension::png()")]
    extension: Extension,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "list")]
/// list images with size and dimensions
struct ListArgs {
    /// directory holding the images
    #[argh(option, default = "PathBuf::from(\".\")")]
    dir: PathBuf,

    /// image file extension
    #[argh(option, short = 'e', default = "Extension::png()")]
    extension: Extension,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "view")]
/// write an HTML page showing every image
struct ViewArgs {
    /// directory holding the images
    #[argh(option, default = "PathBuf::from(\".\")")]
    dir: PathBuf,

    /// image file extension
    #[argh(option, short = 'e', default = "Extension::png()")]
    extension: Extension,

    /// output HTML file
    #[argh(option, short = 'o', default = "PathBuf::from(\"visualizations_viewer.html\")")]
    output: PathBuf,
}

/// File extension without a leading dot, lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Extension(String);

impl Extension {
    fn png() -> Extension {
        Extension("png".to_string())
    }
}

impl FromStr for Extension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ext = s.trim_start_matches('.');
        if ext.is_empty() || ext.contains(|c: char| c == '/' || c == '\\') {
            return Err(format!("invalid extension `{}`", s));
        }
        Ok(Extension(ext.to_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Millis(Duration);

impl Millis {
    fn from_millis(ms: u64) -> Millis {
        Millis(Duration::from_millis(ms))
    }
}

impl FromStr for Millis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<u64>() {
            Ok(0) => Err("interval must be at least 1ms".to_string()),
            Ok(ms) => Ok(Millis::from_millis(ms)),
            Err(e) => Err(format!("invalid milliseconds `{}`: {}", s, e)),
        }
    }
}

impl From<Millis> for Duration {
    fn from(val: Millis) -> Self {
        val.0
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args: Args = argh::from_env();
    init_tracing();

    match args.command {
        Command::Summary(cmd) => summary(&args.data, cmd),
        Command::Analyze(cmd) => analyze(&args.data, cmd),
        Command::Add(cmd) => {
            let record = ScoreRecord {
                name: cmd.name,
                score: cmd.score,
            };
            dataset::append_record(&args.data, &record)?;
            info!(
                "added {} ({}) to {}",
                record.name.as_deref().unwrap_or("unnamed student"),
                record.score,
                args.data.display()
            );
            Ok(())
        }
        Command::Remove(cmd) => {
            let removed = dataset::remove_matching(&args.data, &cmd.pattern)?;
            info!("removed {} rows matching `{}`", removed, cmd.pattern);
            Ok(())
        }
        Command::Watch(cmd) => watch(&args.data, cmd),
        Command::Package(cmd) => {
            match bundle::create_package(&cmd.dir, &cmd.extension.0)? {
                Some(path) => println!("{}", path.display()),
                None => warn!("no .{} files found in {}", cmd.extension.0, cmd.dir.display()),
            }
            Ok(())
        }
        Command::Extract(cmd) => extract(cmd),
        Command::List(cmd) => list(&cmd.dir, &cmd.extension.0),
        Command::View(cmd) => {
            let count = viewer::write_viewer(&cmd.dir, &cmd.extension.0, &cmd.output)?;
            info!("wrote {} with {} images", cmd.output.display(), count);
            Ok(())
        }
    }
}

fn summary(data: &Path, cmd: SummaryArgs) -> Result<()> {
    let dataset = Dataset::load(data)?;
    let summary = Summary::compute(&dataset.scores());
    if summary.is_empty() {
        warn!("{} has no scores", data.display());
    }
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{}", summary);
    }
    Ok(())
}

fn analyze(data: &Path, cmd: AnalyzeArgs) -> Result<()> {
    let config = match &cmd.config {
        Some(path) => AnalysisConfig::from_yaml_file(path)?,
        None => AnalysisConfig::default(),
    };
    let dataset = Dataset::load(data)?;
    if dataset.is_empty() {
        warn!("{} has no scores", data.display());
    }
    let analysis = Analysis::compute(&dataset, &config)?;

    match &cmd.output {
        Some(path) => {
            let file =
                File::create(path).context(format!("unable to create {}", path.display()))?;
            serde_json::to_writer_pretty(&file, &analysis)?;
            info!("analysis of {} scores written to {}", dataset.len(), path.display());
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            serde_json::to_writer_pretty(&mut handle, &analysis)?;
            writeln!(handle)?;
        }
    }
    Ok(())
}

fn watch(data: &Path, cmd: WatchArgs) -> Result<()> {
    if !data.exists() {
        bail!("{} not found", data.display());
    }

    let command = if cmd.command.is_empty() {
        let exe = std::env::current_exe().context("unable to locate own executable")?;
        vec![
            exe.display().to_string(),
            "--data".to_string(),
            data.display().to_string(),
            "summary".to_string(),
        ]
    } else {
        cmd.command
    };

    info!("watching {}, will run `{}`", data.display(), command.join(" "));
    Watcher::new(data.to_path_buf(), cmd.interval.into(), cmd.debounce.into())
        .run(|_| watcher::run_command(&command));
    Ok(())
}

fn extract(cmd: ExtractArgs) -> Result<()> {
    let package = match bundle::latest_package(&cmd.dir)? {
        Some(package) => package,
        None => bail!("no image package found in {}", cmd.dir.display()),
    };
    info!("found package {}", package.display());

    let dest = cmd.dest.as_deref().unwrap_or(&cmd.dir);
    let report = bundle::extract_package(&package, dest, cmd.keep)?;
    info!("extracted {}/{} images", report.extracted, report.total);
    list(dest, &cmd.extension.0)?;

    if !report.failed.is_empty() {
        bail!("failed to extract {}", report.failed.join(", "));
    }
    Ok(())
}

fn list(dir: &Path, extension: &str) -> Result<()> {
    let images = bundle::list_images(dir, extension)?;
    if images.is_empty() {
        println!("no .{} files in {}", extension, dir.display());
        return Ok(());
    }
    for (i, image) in images.iter().enumerate() {
        let dimensions = match image.dimensions {
            Some((width, height)) => format!(", {}x{} pixels", width, height),
            None => String::new(),
        };
        println!(
            "{}. {} ({:.1} KB{})",
            i + 1,
            image.name,
            image.size_bytes as f64 / 1024.0,
            dimensions
        );
    }
    Ok(())
}
