//! Backpressure through the composed writable side

use std::sync::{Arc, Mutex};

use streamsplice::{
    BufferedStage, ComposeError, StageEvent, StageSource, StreamCapability, compose,
};
use tokio_test::{assert_pending, assert_ready_ok, task};

use crate::support::stages::within;

#[tokio::test]
async fn write_waits_while_head_is_full() {
    let head = Arc::new(BufferedStage::<i32>::pass_through(2));
    let duplex = compose(vec![StageSource::Capability(head.clone())]).unwrap();
    let mut events = head.subscribe();

    duplex.write(1).await.unwrap();
    duplex.write(2).await.unwrap();
    assert_eq!(head.buffered_len(), 2);

    let mut third = task::spawn(duplex.write(3));
    assert_pending!(third.poll());
    assert_eq!(head.buffered_len(), 2);

    assert_eq!(duplex.read().await.unwrap(), Some(1));
    assert!(third.is_woken());
    assert_ready_ok!(third.poll());
    assert_eq!(head.buffered_len(), 2);

    let mut drained = false;
    while let Ok(event) = events.try_recv() {
        drained |= event == StageEvent::Drain;
    }
    assert!(drained);
}

#[tokio::test]
async fn acknowledgements_resolve_in_write_order() {
    let duplex = compose(vec![
        StageSource::capability(BufferedStage::<i32>::pass_through(1)),
        StageSource::capability(BufferedStage::<i32>::pass_through(1)),
    ])
    .unwrap();
    let acks = Arc::new(Mutex::new(Vec::new()));

    let writers: Vec<_> = (0..5)
        .map(|n| {
            let duplex = duplex.clone();
            let acks = acks.clone();
            tokio::spawn(async move {
                duplex.write(n).await.unwrap();
                acks.lock().unwrap().push(n);
            })
        })
        .collect();

    let mut read = Vec::new();
    while read.len() < 5 {
        read.push(within(duplex.read()).await.unwrap().unwrap());
    }
    for writer in writers {
        within(writer).await.unwrap();
    }

    assert_eq!(read, vec![0, 1, 2, 3, 4]);
    assert_eq!(*acks.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn slow_reader_bounds_every_stage() {
    let first = Arc::new(BufferedStage::<i32>::pass_through(2));
    let second = Arc::new(BufferedStage::<i32>::pass_through(2));
    let duplex = compose(vec![
        StageSource::Capability(first.clone()),
        StageSource::Capability(second.clone()),
    ])
    .unwrap();

    let writer = {
        let duplex = duplex.clone();
        tokio::spawn(async move {
            for n in 0..20 {
                duplex.write(n).await.unwrap();
            }
            duplex.end().await.unwrap();
        })
    };

    let mut read = Vec::new();
    while let Some(chunk) = within(duplex.read()).await.unwrap() {
        assert!(first.buffered_len() <= first.high_water_mark());
        assert!(second.buffered_len() <= second.high_water_mark());
        read.push(chunk);
        tokio::task::yield_now().await;
    }
    within(writer).await.unwrap();
    assert_eq!(read, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn write_during_pending_end_is_rejected() {
    let duplex = compose(vec![
        StageSource::capability(BufferedStage::<i32>::pass_through(1)),
        StageSource::capability(BufferedStage::<i32>::pass_through(1)),
    ])
    .unwrap();
    within(duplex.write(1)).await.unwrap();
    within(duplex.write(2)).await.unwrap();

    let ending = {
        let duplex = duplex.clone();
        tokio::spawn(async move { duplex.end().await })
    };
    within(async {
        while duplex.is_writable_active() {
            tokio::task::yield_now().await;
        }
    })
    .await;

    assert_eq!(
        within(duplex.write(3)).await,
        Err(ComposeError::WriteAfterEnd)
    );

    assert_eq!(within(duplex.read()).await.unwrap(), Some(1));
    assert_eq!(within(duplex.read()).await.unwrap(), Some(2));
    assert_eq!(within(duplex.read()).await.unwrap(), None);
    within(ending).await.unwrap().unwrap();
}
