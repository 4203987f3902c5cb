//! External tool check command.

use anyhow::{bail, Result};
use console::style;
use texd_core::{CompileService, Config};

/// Probe latexmk, git and pdftoppm the way `/health` does.
pub async fn run(config: Config) -> Result<()> {
    let service = CompileService::new(config)?;

    let spinner = indicatif::ProgressBar::new_spinner();
    spinner.set_message("Probing tools...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    let report = service.health().await;
    spinner.finish_and_clear();

    let line = |name: &str, ok: bool| {
        if ok {
            println!("  {} {}", style("✓").green(), name);
        } else {
            println!("  {} {} {}", style("×").red(), name, style("(not usable)").dim());
        }
    };
    println!("{}", style("Tool check:").bold());
    line("latexmk", report.checks.latexmk);
    line("git", report.checks.git);
    line("pdftoppm", report.checks.pdftoppm);
    if let Some(free) = report.disk_free_bytes {
        println!(
            "  Free space on work root: {:.2} GB",
            free as f64 / 1_073_741_824.0
        );
    }

    if !report.is_healthy() {
        bail!("one or more required tools are missing");
    }
    Ok(())
}
