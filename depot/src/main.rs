mod output;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use depot_core::{ContentKind, ContentReference, Hash, Repository, RepositoryConfig};
use output::{
    AddOutput, AddedContent, CopyOutput, EntryInfo, ExplodeOutput, GcOutput, GcPass, HasOutput,
    LsData, LsOutput, OutputWriter, VerifyOutput, VerifyResult,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code for generic failures.
const EXIT_FAILURE: u8 = 1;
/// Exit code when the addressed content does not exist.
const EXIT_NOT_FOUND: u8 = 2;
/// Exit code for malformed input (hashes, references, configuration).
const EXIT_INVALID_INPUT: u8 = 3;

/// Depot - a content-addressed deployment content repository
#[derive(Parser, Debug)]
#[command(name = "depot")]
#[command(about = "Content-addressed repository for deployment content", long_about = None)]
#[command(version)]
struct Cli {
    /// Repository root (defaults to DEPOT_ROOT, the config file, then ./depot-content)
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose logging. Repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store files, directories or stdin (`-`)
    Add {
        /// Paths to add
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Check whether content is stored (exit code 2 if not)
    Has {
        /// Content hash
        hash: String,
    },

    /// Write leaf content to stdout
    Cat {
        /// Content hash
        hash: String,
    },

    /// List a directory's children or show a leaf's size
    Ls {
        /// Content hash
        hash: String,

        /// Show the kind of each child
        #[arg(short, long)]
        long: bool,
    },

    /// Recompute hashes of stored content
    Verify {
        /// Content hashes
        #[arg(required = true)]
        hashes: Vec<String>,
    },

    /// Explode a stored zip archive into a directory tree
    Explode {
        /// Hash of the archive
        hash: String,
    },

    /// Materialize a stored directory
    Copy {
        /// Hash of the directory
        hash: String,

        /// Destination path
        dest: PathBuf,
    },

    /// Collect unreferenced content
    Gc {
        /// Keep content alive for this run (CONTEXT=HASH, repeatable)
        #[arg(long, value_name = "CONTEXT=HASH")]
        keep: Vec<String>,

        /// Number of collection passes
        #[arg(long, default_value_t = 1)]
        passes: u32,

        /// Pause between passes (defaults to just over the grace period)
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Override the obsolescence grace period
        #[arg(long)]
        grace_period_ms: Option<u64>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let out = OutputWriter::new(cli.json);
    match run(cli, &out) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let code = exit_code_for(&e);
            tracing::debug!(code, "command failed");
            out.write_error(&e, code);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli, out: &OutputWriter) -> Result<u8> {
    let config = resolve_config(cli.root, cli.config.as_deref())?;
    tracing::debug!(root = %config.root.display(), "resolved repository root");

    match cli.command {
        Commands::Add { paths } => cmd_add(config, &paths, out),
        Commands::Has { hash } => cmd_has(config, &hash, out),
        Commands::Cat { hash } => cmd_cat(config, &hash),
        Commands::Ls { hash, long } => cmd_ls(config, &hash, long, out),
        Commands::Verify { hashes } => cmd_verify(config, &hashes, out),
        Commands::Explode { hash } => cmd_explode(config, &hash, out),
        Commands::Copy { hash, dest } => cmd_copy(config, &hash, &dest, out),
        Commands::Gc {
            keep,
            passes,
            interval_ms,
            grace_period_ms,
        } => {
            let mut config = config;
            if let Some(grace) = grace_period_ms {
                config.obsolescence_grace_period_ms = grace;
            }
            cmd_gc(config, &keep, passes, interval_ms, out)
        }
    }
}

/// Root precedence: `--root` > `DEPOT_ROOT` > config file > `./depot-content`.
fn resolve_config(root: Option<PathBuf>, config_path: Option<&Path>) -> Result<RepositoryConfig> {
    let mut config = match config_path {
        Some(path) => RepositoryConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RepositoryConfig::default(),
    };

    if let Some(root) = root.or_else(|| std::env::var_os("DEPOT_ROOT").map(PathBuf::from)) {
        config.root = root;
    }
    Ok(config)
}

fn open_repository(config: RepositoryConfig) -> Result<Repository> {
    let root = config.root.clone();
    Repository::open(config)
        .with_context(|| format!("Failed to open repository at {}", root.display()))
}

fn parse_hash(hash_str: &str) -> Result<Hash> {
    Hash::from_hex(hash_str).with_context(|| format!("Invalid hash: {}", hash_str))
}

/// Parse a `CONTEXT=HASH` argument.
fn parse_keep(arg: &str) -> Result<ContentReference> {
    let (context, hash_str) = arg
        .rsplit_once('=')
        .filter(|(context, _)| !context.is_empty())
        .ok_or_else(|| depot_core::Error::invalid_entry(format!("expected CONTEXT=HASH, got {:?}", arg)))?;
    Ok(ContentReference::new(context, parse_hash(hash_str)?))
}

/// Map a failure to an exit code by the library error it carries.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    let core = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<depot_core::Error>());

    match core {
        Some(e) if e.is_not_found() => EXIT_NOT_FOUND,
        Some(
            depot_core::Error::InvalidHash { .. }
            | depot_core::Error::InvalidEntry { .. }
            | depot_core::Error::UnsupportedAlgorithm { .. }
            | depot_core::Error::Configuration { .. },
        ) => EXIT_INVALID_INPUT,
        _ => EXIT_FAILURE,
    }
}

fn cmd_add(config: RepositoryConfig, paths: &[PathBuf], out: &OutputWriter) -> Result<u8> {
    let repo = open_repository(config)?;
    let mut added = Vec::new();

    for path in paths {
        let (hash, kind) = if path.as_os_str() == "-" {
            if atty::is(atty::Stream::Stdin) {
                anyhow::bail!("Refusing to read content from a terminal; pipe data into `depot add -`");
            }
            let hash = repo
                .add_content(io::stdin().lock())
                .with_context(|| "Failed to add stdin")?;
            (hash, ContentKind::Leaf)
        } else if fs::metadata(path)
            .with_context(|| format!("Cannot access {}", path.display()))?
            .is_dir()
        {
            let hash = repo
                .add_directory(path)
                .with_context(|| format!("Failed to add directory: {}", path.display()))?;
            let kind = repo.get_content(&hash)?.kind()?;
            (hash, kind)
        } else {
            let file = fs::File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let hash = repo
                .add_content(file)
                .with_context(|| format!("Failed to add file: {}", path.display()))?;
            (hash, ContentKind::Leaf)
        };

        added.push(AddedContent {
            hash,
            path: path.display().to_string(),
            kind,
        });
    }

    let output = AddOutput {
        success: true,
        result_code: 0,
        added,
    };
    out.write(&output, || {
        output
            .added
            .iter()
            .map(|a| format!("{} {}\n", a.hash, a.path))
            .collect()
    })?;
    Ok(0)
}

fn cmd_has(config: RepositoryConfig, hash_str: &str, out: &OutputWriter) -> Result<u8> {
    let repo = open_repository(config)?;
    let hash = parse_hash(hash_str)?;
    let present = repo.has_content(&hash);
    let code = if present { 0 } else { EXIT_NOT_FOUND };

    let output = HasOutput {
        success: present,
        result_code: code,
        hash,
        present,
    };
    out.write(&output, || {
        format!("{} {}\n", hash, if present { "present" } else { "missing" })
    })?;
    Ok(code)
}

fn cmd_cat(config: RepositoryConfig, hash_str: &str) -> Result<u8> {
    let repo = open_repository(config)?;
    let hash = parse_hash(hash_str)?;
    let item = repo.get_content(&hash)?;

    if item.kind()?.is_directory() {
        anyhow::bail!("{} is a directory; use `depot ls` or `depot copy`", hash);
    }

    let mut reader = item.open()?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    io::copy(&mut reader, &mut handle).with_context(|| format!("Failed to output {}", hash))?;
    Ok(0)
}

fn cmd_ls(config: RepositoryConfig, hash_str: &str, long: bool, out: &OutputWriter) -> Result<u8> {
    let repo = open_repository(config)?;
    let hash = parse_hash(hash_str)?;
    let item = repo.get_content(&hash)?;

    let data = match item.kind()? {
        ContentKind::Leaf => LsData::Leaf {
            hash,
            size: item.size()?,
        },
        ContentKind::EmptyDirectory | ContentKind::Directory => {
            let mut entries = Vec::new();
            for child in item.children()? {
                let kind = if long {
                    Some(repo.get_content(&child.hash)?.kind()?)
                } else {
                    None
                };
                entries.push(EntryInfo {
                    name: child.name,
                    hash: child.hash,
                    kind,
                });
            }
            LsData::Directory { hash, entries }
        }
    };

    let output = LsOutput {
        success: true,
        result_code: 0,
        data,
    };
    out.write(&output, || match &output.data {
        LsData::Leaf { size, .. } => {
            if long {
                format!("leaf {} bytes\n", size)
            } else {
                "leaf\n".to_string()
            }
        }
        LsData::Directory { entries, .. } => entries
            .iter()
            .map(|e| match e.kind {
                Some(kind) => format!("{:<15} {} {}\n", kind.as_str(), e.hash, e.name),
                None => format!("{}\n", e.name),
            })
            .collect(),
    })?;
    Ok(0)
}

fn cmd_verify(config: RepositoryConfig, hashes: &[String], out: &OutputWriter) -> Result<u8> {
    let repo = open_repository(config)?;
    let mut results = Vec::new();

    for hash_str in hashes {
        let outcome = parse_hash(hash_str)
            .and_then(|hash| repo.verify_content(&hash).map_err(anyhow::Error::from));
        results.push(VerifyResult {
            hash: hash_str.clone(),
            valid: outcome.is_ok(),
            error: outcome.err().map(|e| format!("{:#}", e)),
        });
    }

    let all_valid = results.iter().all(|r| r.valid);
    let code = if all_valid { 0 } else { EXIT_FAILURE };
    let output = VerifyOutput {
        success: all_valid,
        result_code: code,
        results,
    };
    out.write(&output, || {
        output
            .results
            .iter()
            .map(|r| match &r.error {
                None => format!("{} OK\n", r.hash),
                Some(error) => format!("{} FAILED: {}\n", r.hash, error),
            })
            .collect()
    })?;
    Ok(code)
}

fn cmd_explode(config: RepositoryConfig, hash_str: &str, out: &OutputWriter) -> Result<u8> {
    let repo = open_repository(config)?;
    let source = parse_hash(hash_str)?;
    let exploded = repo
        .explode_content(&source)
        .with_context(|| format!("Failed to explode {}", source))?;

    let output = ExplodeOutput {
        success: true,
        result_code: 0,
        source,
        exploded,
    };
    out.write(&output, || format!("{}\n", exploded))?;
    Ok(0)
}

fn cmd_copy(config: RepositoryConfig, hash_str: &str, dest: &Path, out: &OutputWriter) -> Result<u8> {
    let repo = open_repository(config)?;
    let hash = parse_hash(hash_str)?;
    repo.copy_exploded_content(&hash, dest)
        .with_context(|| format!("Failed to copy {} to {}", hash, dest.display()))?;

    let output = CopyOutput {
        success: true,
        result_code: 0,
        hash,
        destination: dest.display().to_string(),
    };
    out.write(&output, || format!("Copied {} to {}\n", hash, dest.display()))?;
    Ok(0)
}

fn cmd_gc(
    config: RepositoryConfig,
    keep: &[String],
    passes: u32,
    interval_ms: Option<u64>,
    out: &OutputWriter,
) -> Result<u8> {
    let kept = keep
        .iter()
        .map(|arg| parse_keep(arg))
        .collect::<Result<Vec<_>>>()?;

    let repo = open_repository(config)?;
    let interval = Duration::from_millis(
        interval_ms.unwrap_or(repo.config().obsolescence_grace_period_ms.saturating_add(1)),
    );

    for reference in &kept {
        repo.add_content_reference(reference.clone());
    }

    let mut results = Vec::new();
    for pass in 1..=passes {
        let report = repo
            .clean_obsolete_content()
            .with_context(|| format!("Collection pass {} failed", pass))?;
        results.push(GcPass::new(pass, report));

        if pass < passes {
            tracing::info!(pass, interval_ms = interval.as_millis() as u64, "waiting for next pass");
            std::thread::sleep(interval);
        }
    }

    let output = GcOutput {
        success: true,
        result_code: 0,
        kept,
        passes: results,
    };
    out.write(&output, || {
        output
            .passes
            .iter()
            .map(|p| {
                format!(
                    "Pass {} ({}): marked {}, deleted {}\n",
                    p.pass,
                    p.completed_at.to_rfc3339(),
                    p.marked.len(),
                    p.deleted.len()
                )
            })
            .collect()
    })?;
    Ok(0)
}
