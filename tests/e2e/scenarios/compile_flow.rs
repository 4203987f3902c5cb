use crate::harness::{GitFixture, PaperToolchain, TestWorkspace};
use std::sync::Arc;
use texd_core::api::CompileRequest;
use texd_core::{ErrorKind, TexdError};

#[tokio::test]
async fn test_compile_returns_pdf_and_dependencies() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let result = service
        .compile_from_git(CompileRequest::new(fixture.url(), "main.tex"))
        .await
        .unwrap();

    assert!(result.pdf.starts_with(b"%PDF"));
    assert_eq!(result.attempts, 1);
    assert!(!result.persistent);
    assert_eq!(
        result.dependencies,
        vec![
            "chapters/intro.tex".to_string(),
            "figures/plot.pdf".to_string(),
            "main.tex".to_string(),
            "refs.bib".to_string(),
        ]
    );
    assert!(result.log.contains("Output written on main.pdf"));
    assert_eq!(toolchain.compiles(), 1);
    assert_eq!(ws.leftover_jobs(), 0, "job directory must be removed");
}

#[tokio::test]
async fn test_explicit_branch_and_compiler() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    fixture.branch("camera-ready").unwrap();
    fixture
        .commit_file("main.tex", b"\\documentclass{article}\\begin{document}main only\\end{document}\n", "Diverge main")
        .unwrap();
    let ws = TestWorkspace::new().unwrap();
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();

    let mut req = CompileRequest::new(fixture.url(), "main.tex");
    req.branch = Some("camera-ready".into());
    req.compiler = "xelatex".into();
    let result = service.compile_from_git(req).await.unwrap();

    // The branch still has the original paper with its figure.
    assert!(result.dependencies.contains(&"figures/plot.pdf".to_string()));
    assert!(String::from_utf8_lossy(&result.pdf).contains("xelatex"));

    let main_only = service
        .compile_from_git(CompileRequest::new(fixture.url(), "main.tex"))
        .await
        .unwrap();
    assert_eq!(main_only.dependencies, vec!["main.tex".to_string()]);
}

#[tokio::test]
async fn test_missing_target_is_not_found() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let err = service
        .compile_from_git(CompileRequest::new(fixture.url(), "thesis.tex"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(toolchain.compiles(), 0);
    assert_eq!(ws.leftover_jobs(), 0);
}

#[tokio::test]
async fn test_compile_failure_returns_log() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    fixture
        .commit_file(
            "main.tex",
            b"\\documentclass{article}\n\\begin{document}\n\\input{chapters/absent}\n\\end{document}\n",
            "Reference a missing chapter",
        )
        .unwrap();
    let ws = TestWorkspace::new().unwrap();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let err = service
        .compile_from_git(CompileRequest::new(fixture.url(), "main.tex"))
        .await
        .unwrap_err();

    match err {
        TexdError::CompileFailed { log, timed_out } => {
            assert!(log.contains("chapters/absent.tex"));
            assert!(!timed_out);
        }
        other => panic!("expected compile failure, got {:?}", other),
    }
    // A full checkout has nothing to repair.
    assert_eq!(toolchain.compiles(), 1);
    assert_eq!(ws.leftover_jobs(), 0);
}

#[tokio::test]
async fn test_unknown_branch_fails_without_leftovers() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let mut req = CompileRequest::new(fixture.url(), "main.tex");
    req.branch = Some("does-not-exist".into());
    assert!(service.compile_from_git(req).await.is_err());
    assert_eq!(toolchain.compiles(), 0);
    assert_eq!(ws.leftover_jobs(), 0);
}

#[tokio::test]
async fn test_file_urls_rejected_unless_enabled() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new()
        .unwrap()
        .configure(|c| c.git.allow_file_urls = false);
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();

    let err = service
        .compile_from_git(CompileRequest::new(fixture.url(), "main.tex"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_sparse_checkout_repairs_missing_figure() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let mut req = CompileRequest::new(fixture.url(), "main.tex");
    req.known_dependencies = Some(vec![
        "main.tex".into(),
        "chapters/intro.tex".into(),
        "refs.bib".into(),
    ]);
    let result = service.compile_from_git(req).await.unwrap();

    // First run misses the figure, the retry finds it.
    assert_eq!(result.attempts, 2);
    assert_eq!(toolchain.compiles(), 2);
    assert!(result.dependencies.contains(&"figures/plot.pdf".to_string()));
    assert!(!result.dependencies.contains(&"README.md".to_string()));
}
