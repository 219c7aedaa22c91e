//! Save paths into a repository, locally or through a remote server

use crate::progress::SaveSpinner;
use crate::util::format_size;
use anyhow::{Context, Result};
use cairn_core::{Client, ObjectId, ObjectStore, RefName, RemoteLocation, RepoConfig, Repository};
use cairn_save::{SaveError, SaveOptions, SaveReport};
use clap::{ArgGroup, Args};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("output")
        .required(true)
        .multiple(true)
        .args(["tree", "commit", "name"])
))]
pub struct SaveArgs {
    /// Print the id of the saved tree
    #[arg(short = 't', long)]
    pub tree: bool,

    /// Write a commit and print its id
    #[arg(short = 'c', long)]
    pub commit: bool,

    /// Backup set to advance to the new commit
    #[arg(short = 'n', long, value_name = "NAME")]
    pub name: Option<String>,

    /// Save into a remote repository (host:path, or a local path)
    #[arg(short = 'r', long, value_name = "REMOTE")]
    pub remote: Option<String>,

    /// Files and directories to save
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

pub fn run(repo_dir: &Path, args: &SaveArgs, verbose: u8) -> Result<()> {
    let ref_name = args
        .name
        .as_deref()
        .map(RefName::backup_set)
        .transpose()
        .context("Invalid backup set name")?;

    let outcome = match &args.remote {
        Some(remote) => {
            let location = RemoteLocation::parse(remote);
            let program = std::env::current_exe().context("Cannot locate the cairn executable")?;
            let mut client = Client::connect(&location, &program)
                .with_context(|| format!("Failed to connect to remote {remote}"))?;
            let config = RepoConfig::load(&repo_dir.join("config.toml"))
                .context("Failed to load local configuration")?;
            let outcome = save_into(&mut client, &config, args, ref_name, verbose);
            if outcome.is_ok() {
                client.disconnect().context("Failed to close remote session")?;
            }
            outcome
        }
        None => {
            let mut repo = Repository::open(repo_dir)
                .with_context(|| format!("Failed to open repository {}", repo_dir.display()))?;
            let config = repo.config().clone();
            save_into(&mut repo, &config, args, ref_name, verbose)
        }
    };

    let report = match outcome {
        Ok(report) => report,
        Err(err) => {
            // The objects are durable even though the ref did not move
            if let SaveError::RefConflict { tree, commit, .. } = &err {
                print_ids(args, *tree, Some(*commit));
            }
            return Err(err).context("Save failed");
        }
    };

    print_ids(args, report.tree, report.commit);
    tracing::info!(
        files = report.files,
        size = %format_size(report.bytes),
        "save finished"
    );
    if report.has_errors() {
        eprintln!(
            "{}",
            format!("WARNING: {} errors encountered while saving.", report.errors.len()).yellow()
        );
    }
    Ok(())
}

/// Print the ids asked for with `-t` and `-c`, one per line
fn print_ids(args: &SaveArgs, tree: ObjectId, commit: Option<ObjectId>) {
    if args.tree {
        println!("{tree}");
    }
    if let (true, Some(commit)) = (args.commit, commit) {
        println!("{commit}");
    }
}

fn save_into<S: ObjectStore>(
    store: &mut S,
    config: &RepoConfig,
    args: &SaveArgs,
    ref_name: Option<RefName>,
    verbose: u8,
) -> Result<SaveReport, SaveError> {
    let options = SaveOptions {
        commit: args.commit,
        ref_name,
        message: SaveOptions::command_message(
            std::env::args_os().map(|arg| arg.to_string_lossy().into_owned()),
        ),
        chunking: config.chunking.clone(),
        author: None,
    };

    let mut spinner = SaveSpinner::new(verbose);
    let report = cairn_save::save(store, &args.paths, options, &mut spinner);
    spinner.finish();
    report
}
