//! Leftover cleanup command.

use anyhow::Result;
use console::style;
use texd_core::{CompileService, Config};

/// Remove job directories and artifact staging directories.
///
/// Run only while no server is using the same roots.
pub fn run(config: Config) -> Result<()> {
    let service = CompileService::new(config)?;
    let report = service.sweep()?;
    println!(
        "{} Removed {} job director{} and {} staging director{}",
        style("✓").green(),
        report.job_dirs,
        if report.job_dirs == 1 { "y" } else { "ies" },
        report.staging_dirs,
        if report.staging_dirs == 1 { "y" } else { "ies" },
    );
    Ok(())
}
