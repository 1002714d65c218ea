//! Exactly-once teardown and first-cause-wins error reporting

use std::sync::Arc;
use std::time::Duration;

use streamsplice::{
    BufferedStage, CancelHandle, ComposeError, ComposeOptions, StageEvent, StageSource,
    StreamCapability, compose, compose_with,
};

use crate::support::stages::{FailingDestroy, FailsOnTeardown, StuckStage, within};

fn closed_events(events: &mut tokio::sync::broadcast::Receiver<StageEvent>) -> usize {
    let mut closed = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, StageEvent::Closed(_)) {
            closed += 1;
        }
    }
    closed
}

#[tokio::test]
async fn repeated_destroy_closes_once() {
    let stage = Arc::new(BufferedStage::<i32>::pass_through(4));
    let duplex = compose(vec![StageSource::Capability(stage.clone())]).unwrap();
    let mut unit_events = StreamCapability::subscribe(&duplex);
    let mut stage_events = stage.subscribe();

    duplex.destroy(None);
    duplex.destroy(None);
    duplex.destroy(Some(ComposeError::stage("late")));

    assert_eq!(within(duplex.closed()).await, Some(ComposeError::abort()));
    assert_eq!(within(duplex.closed()).await, Some(ComposeError::abort()));
    assert_eq!(closed_events(&mut unit_events), 1);
    assert_eq!(closed_events(&mut stage_events), 1);
    assert!(matches!(
        duplex.write(1).await.unwrap_err(),
        ComposeError::Aborted(_)
    ));
}

#[tokio::test]
async fn destroy_after_clean_completion_reports_nothing() {
    let duplex = compose(vec![StageSource::from(vec![1])]).unwrap();
    assert_eq!(within(duplex.read()).await.unwrap(), Some(1));
    assert_eq!(within(duplex.read()).await.unwrap(), None);
    assert_eq!(within(duplex.closed()).await, None);

    duplex.destroy(None);
    assert_eq!(within(duplex.closed()).await, None);
}

#[tokio::test]
async fn stage_error_racing_destroy_wins() {
    let stage = Arc::new(BufferedStage::<i32>::pass_through(4));
    let duplex = compose(vec![StageSource::Capability(stage.clone())]).unwrap();

    stage.fail(ComposeError::stage("boom"));
    duplex.destroy(None);

    assert_eq!(
        within(duplex.closed()).await,
        Some(ComposeError::stage("boom"))
    );
    assert_eq!(
        duplex.write(1).await.unwrap_err(),
        ComposeError::stage("boom")
    );
}

#[tokio::test]
async fn first_error_wins_over_failing_destroy() {
    let head = Arc::new(BufferedStage::<i32>::pass_through(4));
    let middle = Arc::new(FailingDestroy::new());
    let tail = Arc::new(BufferedStage::<i32>::pass_through(4));
    let duplex = compose(vec![
        StageSource::Capability(head.clone()),
        StageSource::Capability(middle),
        StageSource::Capability(tail.clone()),
    ])
    .unwrap();

    head.fail(ComposeError::stage("first"));

    assert_eq!(
        within(duplex.closed()).await,
        Some(ComposeError::stage("first"))
    );
    assert_eq!(tail.status().borrow().error, Some(ComposeError::stage("first")));
    assert!(duplex.discarded_errors().contains(&FailingDestroy::error()));
}

#[tokio::test]
async fn teardown_error_from_a_later_stage_is_discarded() {
    let head = Arc::new(BufferedStage::<i32>::pass_through(4));
    let middle = Arc::new(BufferedStage::<i32>::pass_through(4));
    let duplex = compose(vec![
        StageSource::Capability(head),
        StageSource::Capability(middle.clone()),
        StageSource::capability(FailsOnTeardown::new(ComposeError::stage("stage3"))),
    ])
    .unwrap();

    middle.fail(ComposeError::stage("stage2"));

    assert_eq!(
        within(duplex.closed()).await,
        Some(ComposeError::stage("stage2"))
    );
    assert_eq!(duplex.discarded_errors(), vec![ComposeError::stage("stage3")]);
}

#[tokio::test]
async fn destroy_failure_surfaces_after_clean_completion() {
    let (sink, collected) = BufferedStage::<i32>::collector();
    let duplex = compose(vec![
        StageSource::capability(FailingDestroy::new()),
        StageSource::capability(sink),
    ])
    .unwrap();

    duplex.write(7).await.unwrap();
    within(duplex.end()).await.unwrap();

    assert_eq!(within(duplex.closed()).await, Some(FailingDestroy::error()));
    assert_eq!(*collected.lock().unwrap(), vec![7]);
}

#[tokio::test]
async fn pending_read_fails_with_the_stage_error() {
    let stage = Arc::new(BufferedStage::<i32>::pass_through(4));
    let duplex = compose(vec![StageSource::Capability(stage.clone())]).unwrap();
    let reader = {
        let duplex = duplex.clone();
        tokio::spawn(async move { duplex.read().await })
    };
    tokio::task::yield_now().await;

    stage.fail(ComposeError::stage("read side broke"));
    assert_eq!(
        within(reader).await.unwrap(),
        Err(ComposeError::stage("read side broke"))
    );
    assert_eq!(
        within(duplex.closed()).await,
        Some(ComposeError::stage("read side broke"))
    );
}

#[tokio::test]
async fn abort_signal_destroys_the_unit() {
    let signal = CancelHandle::new();
    let stage = Arc::new(BufferedStage::<i32>::pass_through(4));
    let duplex = compose_with(
        vec![StageSource::Capability(stage.clone())],
        ComposeOptions::builder()
            .label("signalled")
            .signal(signal.clone())
            .build(),
    )
    .unwrap();
    assert_eq!(duplex.label(), Some("signalled"));

    signal.cancel();
    let outcome = within(duplex.closed()).await;
    assert!(matches!(outcome, Some(ComposeError::Aborted(_))));
    assert!(stage.status().borrow().closed);
}

#[tokio::test(start_paused = true)]
async fn teardown_timeout_bounds_a_stuck_stage() {
    let duplex = compose_with(
        vec![StageSource::capability(StuckStage::default())],
        ComposeOptions::new().with_teardown_timeout(Duration::from_millis(50)),
    )
    .unwrap();

    duplex.destroy(Some(ComposeError::stage("stop")));
    let outcome = tokio::time::timeout(Duration::from_secs(5), duplex.closed())
        .await
        .unwrap();
    assert_eq!(outcome, Some(ComposeError::stage("stop")));
}

#[tokio::test]
async fn dropping_every_handle_destroys_the_stages() {
    let stage = Arc::new(BufferedStage::<i32>::pass_through(4));
    let duplex = compose(vec![StageSource::Capability(stage.clone())]).unwrap();
    duplex.write(1).await.unwrap();

    drop(duplex);
    let status = stage.status().borrow().clone();
    assert!(status.closed);
    assert_eq!(status.error, Some(ComposeError::abort()));
}
