mod cli;
mod db;
mod diff;
mod error;
mod fileinfo;
mod filter;
mod repo;
mod repopath;
mod source;
mod traverse;

use anyhow::{Context as _, Result};
use clap::Parser;
use cli::{Cli, Command, FilterArgs, StoreArgs};
use colored::Colorize;
use db::codec::DbWriter;
use db::{Database, IterOptions};
use diff::{DiffOptions, DiffPlan};
use filter::{Filter, LoadMode};
use repo::lister::ListerOptions;
use repo::store::S3Store;
use repo::StoreSource;
use repopath::RepoLocator;
use source::local::LocalSource;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Scan {
            root,
            output,
            filters,
            cleanup,
            same_device,
            files_only,
            no_special,
        } => cmd_scan(&root, output.as_deref(), &filters, cleanup, same_device, files_only, no_special).await,
        Command::Diff {
            old,
            new,
            filters,
            no_ownerships,
            non_file_times,
            checks,
        } => cmd_diff(&old, &new, &filters, no_ownerships, non_file_times, checks).await,
        Command::List { uri, store } => cmd_list(&uri, &store).await,
        Command::Push { local, uri, path, store } => cmd_push(&local, &uri, &path, &store).await,
        Command::Pull { uri, path, local, store } => cmd_pull(&uri, &path, &local, &store).await,
        Command::Db { uri, output, cleanup, store } => {
            cmd_db(&uri, output.as_deref(), cleanup, &store).await
        }
    }
}

fn load_filters(args: &FilterArgs) -> Result<Vec<Filter>> {
    let mode = if args.prune_only {
        LoadMode::PruneOnly
    } else {
        LoadMode::Full
    };
    let mut filters = Vec::with_capacity(args.filter.len());
    for path in &args.filter {
        let filter = Filter::load(path, mode)
            .with_context(|| format!("loading filter {}", path.display()))?;
        filters.push(filter);
    }
    Ok(filters)
}

async fn scan_tree(
    root: &Path,
    filters: &[Filter],
    options: traverse::TraverseOptions,
) -> Result<Database> {
    let traversal = traverse::traverse(
        Arc::new(LocalSource::new(root)),
        filters,
        options,
        |e| eprintln!("{} {}", "error:".red(), e),
        // The database may be streaming to stdout; progress stays on stderr.
        |notice| eprintln!("{}", notice),
    )
    .await
    .with_context(|| format!("scanning {}", root.display()))?;
    Ok(traversal.into_database())
}

fn write_database(db: &Database, output: Option<&Path>) -> Result<()> {
    match output {
        Some(path) => db
            .write(path)
            .with_context(|| format!("writing {}", path.display()))?,
        None => {
            let mut writer = DbWriter::new(std::io::stdout().lock());
            for rec in db.iter() {
                writer.write_record(rec)?;
            }
            writer.finish()?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_scan(
    root: &Path,
    output: Option<&Path>,
    filter_args: &FilterArgs,
    cleanup: bool,
    same_device: bool,
    files_only: bool,
    no_special: bool,
) -> Result<()> {
    let filters = load_filters(filter_args)?;
    let options = traverse::TraverseOptions {
        repo_rules: filter_args.repo_rules,
        same_device,
        cleanup,
        files_only,
        no_special,
    };
    let database = scan_tree(root, &filters, options).await?;
    write_database(&database, output)
}

/// A diff operand is either a database file or a directory to scan.
async fn load_side(path: &Path, filters: &[Filter], repo_rules: bool) -> Result<Database> {
    let md = std::fs::metadata(path)
        .with_context(|| format!("reading {}", path.display()))?;
    if md.is_dir() {
        scan_tree(path, filters, traverse::TraverseOptions::default()).await
    } else {
        let opts = IterOptions {
            filters,
            repo_rules,
            ..Default::default()
        };
        Database::load(path, &opts).with_context(|| format!("reading {}", path.display()))
    }
}

async fn cmd_diff(
    old: &Path,
    new: &Path,
    filter_args: &FilterArgs,
    no_ownerships: bool,
    non_file_times: bool,
    checks: bool,
) -> Result<()> {
    let filters = load_filters(filter_args)?;
    let old_db = load_side(old, &filters, filter_args.repo_rules).await?;
    let new_db = load_side(new, &filters, filter_args.repo_rules).await?;

    let options = DiffOptions {
        filters,
        repo_rules: filter_args.repo_rules,
        no_ownerships,
        non_file_times,
    };
    let plan = diff::diff(&old_db, &new_db, &options);
    if plan.is_empty() {
        tracing::info!("no differences");
    }
    print_plan(&plan, checks);
    Ok(())
}

fn print_plan(plan: &DiffPlan, checks: bool) {
    if checks {
        for check in &plan.check {
            let times: Vec<String> = check.mod_times.iter().map(|t| t.to_string()).collect();
            println!("{} {} {}", "check".cyan(), check.path, times.join(" "));
        }
    }
    for path in &plan.type_change {
        println!("{} {}", "typechange".magenta(), path);
    }
    for rec in &plan.rm {
        println!("{} {}", "rm".red(), rec.path);
    }
    for rec in &plan.add {
        println!("{} {}", "add".green(), rec.path);
    }
    for rec in &plan.change {
        println!("{} {}", "change".yellow(), rec.path);
    }
    for meta in &plan.meta_change {
        let mut edits = Vec::new();
        if let Some(mode) = meta.permissions {
            edits.push(format!("chmod {:04o}", mode));
        }
        if meta.uid.is_some() || meta.gid.is_some() {
            edits.push(format!(
                "chown {}:{}",
                meta.uid.map_or_else(|| "-".to_string(), |v| v.to_string()),
                meta.gid.map_or_else(|| "-".to_string(), |v| v.to_string()),
            ));
        }
        if let Some(mtime) = meta.mod_time {
            edits.push(format!("mtime {}", mtime));
        }
        println!("{} {} [{}]", "meta".blue(), meta.path, edits.join(", "));
    }
}

async fn connect(uri: &str, store_args: &StoreArgs) -> Result<StoreSource> {
    let locator = RepoLocator::parse(uri)?;
    let store = S3Store::connect(
        locator.bucket.clone(),
        store_args.region.clone(),
        store_args.endpoint.clone(),
    )
    .await
    .with_context(|| format!("connecting to {}", locator))?;
    Ok(StoreSource::new(
        Arc::new(store),
        locator.prefix,
        ListerOptions {
            threads: store_args.threads.max(1),
            ..Default::default()
        },
    ))
}

async fn cmd_list(uri: &str, store_args: &StoreArgs) -> Result<()> {
    let locator = RepoLocator::parse(uri)?;
    let store = S3Store::connect(
        locator.bucket.clone(),
        store_args.region.clone(),
        store_args.endpoint.clone(),
    )
    .await?;
    let prefix = if locator.prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", locator.prefix)
    };
    let options = ListerOptions {
        threads: store_args.threads.max(1),
        ..Default::default()
    };
    repo::lister::list_prefix(
        Arc::new(store),
        &prefix,
        &options,
        &CancellationToken::new(),
        |obj| println!("{}", obj.key),
    )
    .await?;
    Ok(())
}

async fn cmd_push(local: &Path, uri: &str, path: &str, store_args: &StoreArgs) -> Result<()> {
    let source = connect(uri, store_args).await?;
    source
        .store_path(local, path)
        .await
        .with_context(|| format!("storing {} as {}", local.display(), path))?;
    Ok(())
}

async fn cmd_pull(uri: &str, path: &str, local: &Path, store_args: &StoreArgs) -> Result<()> {
    let source = connect(uri, store_args).await?;
    let changed = source
        .retrieve(path, local)
        .await
        .with_context(|| format!("retrieving {} to {}", path, local.display()))?;
    if changed {
        println!("{} {}", "updated".green(), local.display());
    }
    Ok(())
}

async fn cmd_db(uri: &str, output: Option<&Path>, cleanup: bool, store_args: &StoreArgs) -> Result<()> {
    let source = connect(uri, store_args).await?;
    let database = source.database(&CancellationToken::new()).await?;
    if cleanup {
        let removed = source.clean_extra_keys().await?;
        if removed > 0 {
            tracing::info!(removed, "cleaned orphan objects");
        }
    } else {
        let extra = source.take_extra_keys();
        if !extra.is_empty() {
            tracing::warn!(count = extra.len(), "repository has orphan keys");
            for key in &extra {
                tracing::info!(%key, "orphan");
            }
        }
    }
    write_database(&database, output)
}
