use crate::harness::{GitFixture, PaperToolchain, TestWorkspace};
use std::sync::Arc;
use texd_core::api::{ClearCacheRequest, CompileRequest};
use texd_core::paths::Compiler;

fn cached_request(fixture: &GitFixture, paper_id: &str) -> CompileRequest {
    let mut req = CompileRequest::new(fixture.url(), "main.tex");
    req.paper_id = Some(paper_id.into());
    req.cache_mode = Some("aux".into());
    req
}

#[tokio::test]
async fn test_second_build_starts_from_cached_aux() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_artifact_cache();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    service
        .compile_from_git(cached_request(&fixture, "paper-1"))
        .await
        .unwrap();
    let entry = service
        .artifacts()
        .entry_paths("paper-1", Compiler::Pdflatex, "main.tex");
    assert!(entry.aux.join("main.aux").is_file());
    assert!(entry.meta.is_file());
    // PDFs are never cached.
    assert!(!entry.out.join("main.pdf").exists());

    let second = service
        .compile_from_git(cached_request(&fixture, "paper-1"))
        .await
        .unwrap();
    assert!(second.pdf.starts_with(b"%PDF"));
    assert_eq!(toolchain.warm_aux(), vec![false, true]);
    assert_eq!(ws.leftover_jobs(), 0);
}

#[tokio::test]
async fn test_cache_requires_operator_and_request_opt_in() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();

    // Operator enabled, request silent.
    let ws = TestWorkspace::new().unwrap().with_artifact_cache();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();
    for _ in 0..2 {
        let mut req = CompileRequest::new(fixture.url(), "main.tex");
        req.paper_id = Some("paper-1".into());
        service.compile_from_git(req).await.unwrap();
    }
    assert_eq!(toolchain.warm_aux(), vec![false, false]);

    // Request asks, operator disabled.
    let ws = TestWorkspace::new().unwrap();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();
    for _ in 0..2 {
        service
            .compile_from_git(cached_request(&fixture, "paper-1"))
            .await
            .unwrap();
    }
    assert_eq!(toolchain.warm_aux(), vec![false, false]);
    assert!(!service.artifacts().paper_dir("paper-1").exists());
}

#[tokio::test]
async fn test_entries_are_keyed_by_compiler_and_target() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_artifact_cache();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    service
        .compile_from_git(cached_request(&fixture, "paper-1"))
        .await
        .unwrap();
    let mut xe = cached_request(&fixture, "paper-1");
    xe.compiler = "xelatex".into();
    service.compile_from_git(xe).await.unwrap();

    assert_eq!(toolchain.warm_aux(), vec![false, false]);
    let artifacts = service.artifacts();
    assert!(artifacts
        .entry_paths("paper-1", Compiler::Pdflatex, "main.tex")
        .dir
        .is_dir());
    assert!(artifacts
        .entry_paths("paper-1", Compiler::Xelatex, "main.tex")
        .dir
        .is_dir());
}

#[tokio::test]
async fn test_clear_cache_removes_only_named_papers() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_artifact_cache();
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();

    for id in ["paper-1", "paper-2"] {
        service
            .compile_from_git(cached_request(&fixture, id))
            .await
            .unwrap();
    }

    let cleared = service
        .clear_caches(&ClearCacheRequest {
            paper_id: None,
            paper_ids: Some(vec!["paper-1".into(), "never-built".into()]),
        })
        .await
        .unwrap();
    assert_eq!(cleared.deleted, 1);
    assert!(!service.artifacts().paper_dir("paper-1").exists());
    assert!(service.artifacts().paper_dir("paper-2").exists());

    let again = service
        .clear_caches(&ClearCacheRequest {
            paper_id: Some("paper-1".into()),
            paper_ids: None,
        })
        .await
        .unwrap();
    assert_eq!(again.deleted, 0);
}
