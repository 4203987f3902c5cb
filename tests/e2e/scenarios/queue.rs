use crate::harness::{GitFixture, PaperToolchain, TestWorkspace};
use std::sync::Arc;
use std::time::Duration;
use texd_core::api::CompileRequest;
use texd_core::{CompileService, TexdError};
use tokio::sync::Semaphore;

async fn wait_until(service: &CompileService, running: usize, queued: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let stats = service.queue().stats();
        if stats.running == running && stats.queued == queued {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue never reached {} running / {} queued: {:?}",
            running,
            queued,
            stats
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_excess_requests_fail_fast_while_busy() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().configure(|c| {
        c.queue.capacity = 1;
        c.queue.max_depth = 1;
    });
    let gate = Arc::new(Semaphore::new(0));
    let toolchain = Arc::new(PaperToolchain::gated(Arc::clone(&gate)));
    let service = Arc::new(ws.service(toolchain.clone()).unwrap());

    let spawn = |service: &Arc<CompileService>| {
        let service = Arc::clone(service);
        let req = CompileRequest::new(fixture.url(), "main.tex");
        tokio::spawn(async move { service.compile_from_git(req).await })
    };

    let running = spawn(&service);
    wait_until(&service, 1, 0).await;
    let waiting = spawn(&service);
    wait_until(&service, 1, 1).await;

    let err = service
        .compile_from_git(CompileRequest::new(fixture.url(), "main.tex"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TexdError::QueueFull { running: 1, queued: 1 }),
        "unexpected error: {:?}",
        err
    );

    gate.add_permits(2);
    assert!(running.await.unwrap().is_ok());
    assert!(waiting.await.unwrap().is_ok());
    assert_eq!(toolchain.compiles(), 2);
    wait_until(&service, 0, 0).await;
}

#[tokio::test]
async fn test_close_rejects_waiting_and_new_requests() {
    crate::require_git!();
    let fixture = GitFixture::from_fixture("paper").unwrap();
    let ws = TestWorkspace::new().unwrap().configure(|c| {
        c.queue.capacity = 1;
        c.queue.max_depth = 4;
    });
    let gate = Arc::new(Semaphore::new(0));
    let toolchain = Arc::new(PaperToolchain::gated(Arc::clone(&gate)));
    let service = Arc::new(ws.service(toolchain.clone()).unwrap());

    let running = {
        let service = Arc::clone(&service);
        let req = CompileRequest::new(fixture.url(), "main.tex");
        tokio::spawn(async move { service.compile_from_git(req).await })
    };
    wait_until(&service, 1, 0).await;
    let waiting = {
        let service = Arc::clone(&service);
        let req = CompileRequest::new(fixture.url(), "main.tex");
        tokio::spawn(async move { service.compile_from_git(req).await })
    };
    wait_until(&service, 1, 1).await;

    service.queue().close();
    assert!(matches!(
        waiting.await.unwrap(),
        Err(TexdError::ShuttingDown)
    ));
    assert!(matches!(
        service
            .compile_from_git(CompileRequest::new(fixture.url(), "main.tex"))
            .await,
        Err(TexdError::ShuttingDown)
    ));

    // The job already running is allowed to finish.
    gate.add_permits(1);
    assert!(running.await.unwrap().is_ok());
    assert!(service.queue().wait_idle(Duration::from_secs(5)).await);
    assert_eq!(toolchain.compiles(), 1);
    assert_eq!(ws.leftover_jobs(), 0);
}
