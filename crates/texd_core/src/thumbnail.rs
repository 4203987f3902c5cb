//! First-page thumbnails via `pdftoppm`.

use crate::error::{Result, TexdError};
use crate::paths::{ImageFormat, ThumbnailOptions};
use crate::process::{self, RunOptions};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Renders page one of `pdf` inside `work_dir` and returns the image bytes.
///
/// `work_dir` must be a job-scoped directory; the caller removes it.
pub async fn render_first_page(
    pdf: &[u8],
    opts: ThumbnailOptions,
    work_dir: &Path,
    timeout: Duration,
) -> Result<Vec<u8>> {
    if !pdf.starts_with(b"%PDF-") {
        return Err(TexdError::invalid("pdfBase64 does not decode to a PDF"));
    }
    let input = work_dir.join("input.pdf");
    fs::write(&input, pdf)?;
    let prefix = work_dir.join("thumb");

    let width = opts.width.to_string();
    let format_flag = match opts.format {
        ImageFormat::Png => "-png",
        ImageFormat::Jpeg => "-jpeg",
    };
    let input_arg = input.to_string_lossy();
    let prefix_arg = prefix.to_string_lossy();
    let args = [
        "-f",
        "1",
        "-l",
        "1",
        "-scale-to",
        width.as_str(),
        format_flag,
        "-singlefile",
        input_arg.as_ref(),
        prefix_arg.as_ref(),
    ];
    let out = process::run("pdftoppm", &args, &RunOptions::new(timeout)).await;
    if !out.success {
        return Err(TexdError::ToolFailed {
            tool: "pdftoppm",
            message: out.failure_reason(),
        });
    }

    let image = work_dir.join(format!("thumb.{}", opts.format.extension()));
    let bytes = fs::read(&image).map_err(|e| TexdError::ToolFailed {
        tool: "pdftoppm",
        message: format!("no output image: {}", e),
    })?;
    debug!(width = opts.width, bytes = bytes.len(), "rendered thumbnail");
    Ok(bytes)
}

/// `pdftoppm -v`, used by health checks.
pub async fn probe_pdftoppm(timeout: Duration) -> bool {
    // pdftoppm prints its version to stderr and exits 0 on -v.
    process::run("pdftoppm", &["-v"], &RunOptions::new(timeout))
        .await
        .success
}
