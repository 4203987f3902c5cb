use crate::harness::{GitFixture, PaperToolchain, TestWorkspace};
use std::sync::Arc;
use texd_core::api::{ArchiveRequest, FileRequest, HashRequest, HashResponse, RefsRequest, TreeRequest};
use texd_core::archive::Encoding;
use texd_core::git::TreeEntryKind;
use texd_core::{CompileService, ErrorKind};

fn service(ws: &TestWorkspace) -> CompileService {
    ws.service(Arc::new(PaperToolchain::new())).unwrap()
}

fn archive_request(fixture: &GitFixture) -> ArchiveRequest {
    ArchiveRequest {
        git_url: fixture.url(),
        branch: None,
        auth: None,
        extensions: Vec::new(),
        paths: Vec::new(),
    }
}

#[tokio::test]
async fn test_refs_resolve_head_and_report_unchanged() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let service = service(&ws);
    let head = fixture.head().unwrap();

    let mut req = RefsRequest {
        git_url: fixture.url(),
        branch: None,
        auth: None,
        known_sha: None,
    };
    let info = service.resolve_refs(&req).await.unwrap();
    assert_eq!(info.sha, head);
    assert_eq!(info.default_branch, "main");
    assert_eq!(info.unchanged, None);
    let details = info.details.unwrap();
    if !details.date_is_fallback {
        assert_eq!(details.message.trim(), "Initial commit");
        assert_eq!(details.author_name, "texd tests");
    }

    req.known_sha = Some(head.clone());
    let info = service.resolve_refs(&req).await.unwrap();
    assert_eq!(info.sha, head);
    assert_eq!(info.unchanged, Some(true));
    assert!(info.details.is_none());
}

#[tokio::test]
async fn test_refs_for_missing_branch_fail() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let err = service(&ws)
        .resolve_refs(&RefsRequest {
            git_url: fixture.url(),
            branch: Some("gone".into()),
            auth: None,
            known_sha: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_tree_lists_root_and_subdirectory() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let service = service(&ws);

    let root = service
        .list_tree(&TreeRequest {
            git_url: fixture.url(),
            path: None,
            branch: None,
            auth: None,
        })
        .await
        .unwrap();
    let chapters = root.files.iter().find(|e| e.name == "chapters").unwrap();
    assert_eq!(chapters.kind, TreeEntryKind::Dir);
    assert!(root
        .files
        .iter()
        .any(|e| e.path == "main.tex" && e.kind == TreeEntryKind::File));

    let sub = service
        .list_tree(&TreeRequest {
            git_url: fixture.url(),
            path: Some("chapters".into()),
            branch: None,
            auth: None,
        })
        .await
        .unwrap();
    assert_eq!(sub.files.len(), 1);
    assert_eq!(sub.files[0].path, "chapters/intro.tex");
    assert_eq!(ws.leftover_jobs(), 0);
}

#[tokio::test]
async fn test_read_single_file() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let service = service(&ws);

    let file = service
        .read_file(&FileRequest {
            git_url: fixture.url(),
            file_path: "chapters/intro.tex".into(),
            branch: None,
            auth: None,
        })
        .await
        .unwrap();
    assert_eq!(file.encoding, Encoding::Utf8);
    assert!(file.content.contains("\\section{Introduction}"));

    let err = service
        .read_file(&FileRequest {
            git_url: fixture.url(),
            file_path: "chapters/missing.tex".into(),
            branch: None,
            auth: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = service
        .read_file(&FileRequest {
            git_url: fixture.url(),
            file_path: "../outside.tex".into(),
            branch: None,
            auth: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_full_and_selective_archives() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let service = service(&ws);

    let full = service.archive(&archive_request(&fixture)).await.unwrap();
    let mut paths: Vec<&str> = full.files.iter().map(|f| f.path.as_str()).collect();
    paths.sort_unstable();
    assert_eq!(
        paths,
        vec![
            "README.md",
            "chapters/intro.tex",
            "figures/plot.pdf",
            "main.tex",
            "refs.bib",
        ]
    );
    assert!(full.total_bytes > 0);

    let mut req = archive_request(&fixture);
    req.extensions = vec!["tex".into()];
    let tex_only = service.selective_archive(&req).await.unwrap();
    assert!(tex_only.files.iter().all(|f| f.path.ends_with(".tex")));
    assert_eq!(tex_only.files.len(), 2);

    let mut req = archive_request(&fixture);
    req.paths = vec!["figures".into(), "refs.bib".into()];
    let picked = service.selective_archive(&req).await.unwrap();
    let mut paths: Vec<&str> = picked.files.iter().map(|f| f.path.as_str()).collect();
    paths.sort_unstable();
    assert_eq!(paths, vec!["figures/plot.pdf", "refs.bib"]);
}

#[tokio::test]
async fn test_archive_respects_file_limit() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new()
        .unwrap()
        .configure(|c| c.limits.max_archive_files = 2);
    let err = service(&ws)
        .archive(&archive_request(&fixture))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
}

#[tokio::test]
async fn test_file_hashes_match_git_blob_ids() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap();
    let service = service(&ws);

    let batch = service
        .file_hashes(&HashRequest {
            git_url: fixture.url(),
            branch: None,
            auth: None,
            file_path: None,
            file_paths: Some(vec!["main.tex".into(), "nope.tex".into()]),
        })
        .await
        .unwrap();
    let HashResponse::Batch { hashes } = batch else {
        panic!("expected batch response");
    };
    assert_eq!(hashes[0].file_path, "main.tex");
    assert_eq!(hashes[0].sha, Some(fixture.blob_sha("main.tex").unwrap()));
    assert_eq!(hashes[1].file_path, "nope.tex");
    assert_eq!(hashes[1].sha, None);

    let single = service
        .file_hashes(&HashRequest {
            git_url: fixture.url(),
            branch: None,
            auth: None,
            file_path: Some("refs.bib".into()),
            file_paths: None,
        })
        .await
        .unwrap();
    match single {
        HashResponse::Single(hash) => {
            assert_eq!(hash.sha, Some(fixture.blob_sha("refs.bib").unwrap()));
        }
        other => panic!("expected single response, got {:?}", other),
    }
}
