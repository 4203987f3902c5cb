use crate::harness::{GitFixture, PaperToolchain, TestWorkspace};
use std::fs;
use std::sync::Arc;
use texd_core::api::CompileRequest;
use texd_core::lock::LockOptions;
use texd_core::TexdError;

fn persistent_request(fixture: &GitFixture, paper_id: &str) -> CompileRequest {
    let mut req = CompileRequest::new(fixture.url(), "main.tex");
    req.paper_id = Some(paper_id.into());
    req.cache_mode = Some("aux".into());
    req
}

#[tokio::test]
async fn test_working_tree_is_reused_and_updated() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let first = service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await
        .unwrap();
    assert!(first.persistent);

    let meta = service.repos().read_meta("p1").unwrap();
    assert_eq!(meta.git_url, fixture.url());
    assert_eq!(meta.branch, "main");
    assert_eq!(meta.target, "main.tex");
    assert_eq!(meta.sparse_paths, None);

    fixture
        .commit_file(
            "chapters/intro.tex",
            b"\\section{Introduction}\nRevised introduction.\n",
            "Revise intro",
        )
        .unwrap();
    let second = service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await
        .unwrap();
    assert!(second.persistent);
    assert!(service.repos().read_meta("p1").unwrap().last_used >= meta.last_used);

    let intro = fs::read_to_string(
        service
            .repos()
            .entry_paths("p1")
            .repo
            .join("chapters/intro.tex"),
    )
    .unwrap();
    assert!(intro.contains("Revised introduction"));
    // Outputs survived between builds.
    assert_eq!(toolchain.warm_aux(), vec![false, true]);
    assert_eq!(ws.leftover_jobs(), 0);
}

#[tokio::test]
async fn test_compiler_change_clears_outputs_but_keeps_tree() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await
        .unwrap();
    let mut xe = persistent_request(&fixture, "p1");
    xe.compiler = "lualatex".into();
    let result = service.compile_from_git(xe).await.unwrap();

    assert!(result.persistent);
    assert_eq!(toolchain.warm_aux(), vec![false, false]);
    let meta = service.repos().read_meta("p1").unwrap();
    assert_eq!(meta.compiler, texd_core::paths::Compiler::Lualatex);
}

#[tokio::test]
async fn test_remote_change_reclones() {
    crate::require_git!();
    let first_remote = GitFixture::from_fixture("paper").unwrap();
    let second_remote = GitFixture::from_fixture("paper").unwrap();
    second_remote
        .commit_file("NOTICE", b"second remote\n", "Mark second remote")
        .unwrap();
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();

    service
        .compile_from_git(persistent_request(&first_remote, "p1"))
        .await
        .unwrap();
    let repo = service.repos().entry_paths("p1").repo;
    assert!(!repo.join("NOTICE").exists());

    service
        .compile_from_git(persistent_request(&second_remote, "p1"))
        .await
        .unwrap();
    assert!(repo.join("NOTICE").is_file());
    assert_eq!(
        service.repos().read_meta("p1").unwrap().git_url,
        second_remote.url()
    );
}

#[tokio::test]
async fn test_sparse_set_grows_across_builds() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let mut req = persistent_request(&fixture, "p1");
    req.known_dependencies = Some(vec!["main.tex".into(), "chapters/intro.tex".into()]);
    let first = service.compile_from_git(req.clone()).await.unwrap();
    assert_eq!(first.attempts, 2);

    let sparse = service
        .repos()
        .read_meta("p1")
        .unwrap()
        .sparse_paths
        .unwrap();
    for path in ["main.tex", "chapters/intro.tex", "figures/plot.pdf"] {
        assert!(sparse.contains(&path.to_string()), "{} missing from {:?}", path, sparse);
    }

    // The repaired figure is remembered, so the next build needs no retry.
    let second = service.compile_from_git(req).await.unwrap();
    assert_eq!(second.attempts, 1);
    assert_eq!(toolchain.compiles(), 3);
}

#[tokio::test]
async fn test_failed_build_still_records_checkout() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    fixture
        .commit_file(
            "main.tex",
            b"\\documentclass{article}\n\\begin{document}\n\\input{chapters/absent}\n\\end{document}\n",
            "Break the build",
        )
        .unwrap();
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let service = ws.service(Arc::new(PaperToolchain::new())).unwrap();

    let err = service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await
        .unwrap_err();
    assert!(matches!(err, TexdError::CompileFailed { .. }));
    assert!(service.repos().read_meta("p1").is_some());
    assert!(service.repos().entry_paths("p1").repo.join("main.tex").is_file());
}

#[tokio::test]
async fn test_held_lock_times_out_request() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new()
        .unwrap()
        .with_persistence()
        .configure(|c| c.lock.wait_secs = 1);
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    let held = service
        .repos()
        .lock("p1", LockOptions::from(&service.config().lock))
        .await
        .unwrap();
    let err = service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await
        .unwrap_err();
    assert!(matches!(err, TexdError::LockTimeout { .. }));
    assert_eq!(toolchain.compiles(), 0);

    held.release();
    let ok = service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await
        .unwrap();
    assert!(ok.persistent);
}

#[tokio::test]
async fn test_concurrent_builds_of_one_paper_serialize() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new()
        .unwrap()
        .with_persistence()
        .configure(|c| c.lock.wait_secs = 30);
    let toolchain = Arc::new(PaperToolchain::new());
    let service = Arc::new(ws.service(toolchain.clone()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..3 {
        let service = Arc::clone(&service);
        let req = persistent_request(&fixture, "p1");
        handles.push(tokio::spawn(async move { service.compile_from_git(req).await }));
    }
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert!(result.persistent);
        assert!(result.pdf.starts_with(b"%PDF"));
    }
    assert_eq!(toolchain.compiles(), 3);
    // Exactly one build found a cold tree.
    assert_eq!(
        toolchain.warm_aux().iter().filter(|warm| !**warm).count(),
        1
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_unremovable_tree_falls_back_to_job_build() {
    use std::os::unix::fs::PermissionsExt;

    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().with_persistence();
    let toolchain = Arc::new(PaperToolchain::new());
    let service = ws.service(toolchain.clone()).unwrap();

    service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await
        .unwrap();

    // A broken HEAD makes the incremental update fail; a read-only
    // subdirectory makes the tree impossible to delete.
    let repo = service.repos().entry_paths("p1").repo;
    fs::remove_file(repo.join(".git/HEAD")).unwrap();
    let locked = repo.join("chapters");
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
    let writable = fs::write(locked.join("write-check"), b"x").is_ok();
    if writable {
        // Permission bits are not enforced for this user.
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        return;
    }

    let result = service
        .compile_from_git(persistent_request(&fixture, "p1"))
        .await;
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

    let result = result.unwrap();
    assert!(!result.persistent);
    assert!(result.pdf.starts_with(b"%PDF"));
    assert_eq!(toolchain.compiles(), 2);
    assert_eq!(ws.leftover_jobs(), 0);
}
