use crate::harness::{GitFixture, PaperToolchain, TestWorkspace};
use std::sync::Arc;
use texd_core::api::CompileRequest;
use texd_core::lock::LockOptions;
use texd_core::paths::Compiler;
use texd_core::workdir::JobDir;
use texd_core::CompileService;

async fn build(service: &CompileService, fixture: &GitFixture, paper_id: &str) {
    let mut req = CompileRequest::new(fixture.url(), "main.tex");
    req.paper_id = Some(paper_id.into());
    req.cache_mode = Some("aux".into());
    service.compile_from_git(req).await.unwrap();
}

#[tokio::test]
async fn test_eviction_skips_locked_repos_and_is_idempotent() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();
    build(&service, &fixture, "p1").await;
    build(&service, &fixture, "p2").await;

    // Same roots, but nothing fits.
    let evictor = ws
        .service_with(toolchain.clone(), |c| c.persist.max_mb = 0)
        .unwrap();
    let p1 = evictor.repos().entry_paths("p1").dir;
    let p2 = evictor.repos().entry_paths("p2").dir;

    let dry = evictor.run_eviction(true, None).await.unwrap();
    assert_eq!(dry.entries_deleted, 2);
    assert!(dry.bytes_freed > 0);
    assert!(p1.is_dir() && p2.is_dir(), "dry run must not delete");

    let held = evictor
        .repos()
        .lock("p2", LockOptions::from(&evictor.config().lock))
        .await
        .unwrap();
    let report = evictor.run_eviction(false, None).await.unwrap();
    assert_eq!(report.entries_deleted, 1);
    assert_eq!(report.skipped_locked, 1);
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert!(!p1.exists());
    assert!(p2.is_dir());

    held.release();
    let report = evictor.run_eviction(false, None).await.unwrap();
    assert_eq!(report.entries_deleted, 1);
    assert!(!p2.exists());

    let report = evictor.run_eviction(false, None).await.unwrap();
    assert_eq!(report.entries_deleted, 0);
    assert_eq!(report.bytes_freed, 0);
}

#[tokio::test]
async fn test_artifact_eviction_keeps_recent_entries_within_budget() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_artifact_cache();
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();
    build(&service, &fixture, "old").await;
    build(&service, &fixture, "new").await;

    // Generous limits: nothing to do.
    let report = service.run_eviction(false, None).await.unwrap();
    assert_eq!(report.entries_scanned, 2);
    assert_eq!(report.entries_deleted, 0);

    let evictor = ws
        .service_with(Arc::new(PaperToolchain::new()), |c| c.cache.max_mb = 0)
        .unwrap();
    let report = evictor.run_eviction(false, None).await.unwrap();
    assert_eq!(report.entries_deleted, 2);
    for id in ["old", "new"] {
        assert!(!evictor
            .artifacts()
            .entry_paths(id, Compiler::Pdflatex, "main.tex")
            .dir
            .exists());
    }
}

#[tokio::test]
async fn test_eviction_progress_reports_both_layers() {
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback: Arc<texd_core::evict::EvictionProgressCallback> =
        Arc::new(move |step: usize, total: usize, label: &str| {
            sink.lock().unwrap().push((step, total, label.to_string()));
        });

    let report = service.run_eviction(false, Some(callback)).await.unwrap();
    assert_eq!(report.entries_scanned, 0);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.first().map(|s| s.2.as_str()), Some("artifacts"));
    assert_eq!(seen.last().map(|s| s.2.as_str()), Some("done"));
}

#[tokio::test]
async fn test_sweep_removes_abandoned_job_dirs() {
    let ws = TestWorkspace::new().unwrap();
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();
    let abandoned = JobDir::create(&ws.work_root()).unwrap().keep();
    std::fs::write(abandoned.join("main.log"), b"half a build").unwrap();
    assert_eq!(ws.leftover_jobs(), 1);

    let report = service.sweep().unwrap();
    assert_eq!(report.job_dirs, 1);
    assert!(!abandoned.exists());
    assert_eq!(service.sweep().unwrap().job_dirs, 0);
}
