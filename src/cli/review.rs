use crate::error::{OverlayError, Result};
use crate::jobs::{DEFAULT_QUEUE_DEPTH, JobQueue, JobStatus, ReviewRequest};
use crate::patch::DiffEngine;
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct ReviewArgs {
    /// TOML manifest naming the source and the downloaded files
    #[clap(value_parser)]
    manifest: PathBuf,

    /// Print the full job record as JSON
    #[clap(long)]
    json: bool,
}

impl ReviewArgs {
    pub fn execute(&self, engine: Arc<DiffEngine>) -> Result<()> {
        let request = ReviewRequest::load(&self.manifest)?;
        tracing::info!(
            "reviewing {} files from {}",
            request.files.len(),
            request.source
        );

        let queue = JobQueue::spawn(engine, DEFAULT_QUEUE_DEPTH)?;
        let id = queue.submit(request)?;
        if let Some(queued) = queue.status(id) {
            tracing::debug!("submitted: {:?}", queued.progress());
        }
        let status = queue
            .wait(id)
            .ok_or_else(|| OverlayError::Job(format!("job {id} disappeared")))?;

        if self.json {
            println!("{}", status.to_json()?);
        } else {
            print_summary(&status);
        }
        match &status.error {
            Some(error) => Err(OverlayError::Job(error.clone())),
            None => Ok(()),
        }
    }
}

fn print_summary(status: &JobStatus) {
    println!("job {} ({})", status.id, status.source);
    for file in &status.files {
        let state = file.status.as_deref().unwrap_or("unknown");
        println!("== {} [{state}]", file.filename.display());
        for error in &file.errors {
            println!("   error: {error}");
        }
        if let Some(upper) = &file.upper {
            if upper.diff.is_empty() {
                println!("   merged view: identical");
            } else {
                println!("   merged view:");
                print!("{}", upper.diff);
            }
        }
        if let Some(lower) = &file.lower {
            if lower.diff.is_empty() {
                println!("   original: identical");
            } else {
                println!("   original:");
                print!("{}", lower.diff);
            }
        }
    }
    println!(
        "{} files, {} compared with the merged view, {} with the original",
        status.files_count, status.compare_upper_count, status.compare_lower_count
    );
}
