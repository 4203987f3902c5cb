//! Cache eviction command.

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use texd_core::evict::EvictionProgressCallback;
use texd_core::{CompileService, Config, EvictionReport};

/// Run one eviction pass over both cache layers.
pub async fn run(config: Config, dry_run: bool) -> Result<()> {
    let ttl_hours = config.cache.ttl_hours;
    let persist_ttl_hours = config.persist.ttl_hours;
    let service = CompileService::new(config)?;

    if dry_run {
        println!(
            "{} Running eviction in dry-run mode (nothing will be deleted)...",
            style("→").cyan()
        );
    } else {
        println!(
            "{} Evicting artifact entries older than {}h and repos older than {}h...",
            style("→").cyan(),
            ttl_hours,
            persist_ttl_hours
        );
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap(),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let pb_clone = pb.clone();
    let progress: Arc<EvictionProgressCallback> = Arc::new(move |current: usize, total: usize, phase: &str| {
        pb_clone.set_message(format!("[{}/{}] {}", current, total, phase));
    });
    let report = service.run_eviction(dry_run, Some(progress)).await?;

    pb.finish_and_clear();
    print_report(&report, dry_run);
    Ok(())
}

fn print_report(report: &EvictionReport, dry_run: bool) {
    println!();
    println!("{}", style("Eviction Report:").bold());
    println!(
        "  Entries scanned:     {}",
        style(report.entries_scanned).cyan()
    );
    println!(
        "  Entries deleted:     {}",
        if report.entries_deleted > 0 {
            style(report.entries_deleted).yellow()
        } else {
            style(report.entries_deleted).green()
        }
    );
    println!(
        "  Skipped (locked):    {}",
        style(report.skipped_locked).cyan()
    );
    println!(
        "  Stale locks removed: {}",
        style(report.stale_locks_removed).cyan()
    );
    println!(
        "  Bytes freed:         {} ({:.2} MB)",
        style(format!("{}", report.bytes_freed)).cyan(),
        report.bytes_freed as f64 / 1_048_576.0
    );

    if !report.errors.is_empty() {
        println!();
        println!("{}", style("Errors encountered:").red().bold());
        for error in &report.errors {
            println!("  {} {}", style("×").red(), error);
        }
    }

    if dry_run && report.entries_deleted > 0 {
        println!();
        println!("This was a dry run. To actually delete entries, run:");
        println!("  {}", style("texd evict").cyan());
    } else if !dry_run && report.entries_deleted > 0 {
        println!();
        println!(
            "{} Successfully freed {:.2} MB",
            style("✓").green(),
            report.bytes_freed as f64 / 1_048_576.0
        );
    }
}
