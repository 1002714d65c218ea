//! Data flowing through composed chains

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::StreamExt;
use proptest::prelude::*;
use streamsplice::{BufferedStage, ComposeError, ComposedDuplex, StageSource, compose};

use crate::support::stages::{doubler, plus_one, within};

async fn drain(duplex: &ComposedDuplex<i32>) -> Vec<i32> {
    let mut out = Vec::new();
    while let Some(chunk) = duplex.read().await.unwrap() {
        out.push(chunk);
    }
    out
}

async fn write_all(duplex: ComposedDuplex<i32>, items: Vec<i32>) -> streamsplice::Result<()> {
    for item in items {
        duplex.write(item).await?;
    }
    duplex.end().await
}

#[tokio::test]
async fn readable_source_doubled() {
    let duplex = compose(vec![
        StageSource::from(vec![1, 2, 3]),
        StageSource::capability(BufferedStage::map(4, |x: i32| Ok(x * 2))),
    ])
    .unwrap();

    assert_eq!(duplex.write(4).await.unwrap_err(), ComposeError::NotWritable);
    assert_eq!(within(drain(&duplex)).await, vec![2, 4, 6]);
    assert_eq!(within(duplex.closed()).await, None);
}

#[tokio::test]
async fn readable_source_into_genuine_sink() {
    let (sink, collected) = BufferedStage::<i32>::collector();
    let duplex = compose(vec![
        StageSource::from(vec![1, 2, 3]),
        StageSource::capability(BufferedStage::map(4, |x: i32| Ok(x * 2))),
        StageSource::capability(sink),
    ])
    .unwrap();

    assert_eq!(duplex.read().await.unwrap_err(), ComposeError::NotReadable);
    assert_eq!(within(duplex.closed()).await, None);
    assert_eq!(*collected.lock().unwrap(), vec![2, 4, 6]);
}

#[tokio::test]
async fn written_chunks_doubled() {
    let duplex = compose(vec![StageSource::capability(BufferedStage::map(
        8,
        |x: i32| Ok(x * 2),
    ))])
    .unwrap();

    for x in [1, 2, 3] {
        duplex.write(x).await.unwrap();
    }
    duplex.end().await.unwrap();
    assert_eq!(within(drain(&duplex)).await, vec![2, 4, 6]);
    assert_eq!(within(duplex.closed()).await, None);
}

#[tokio::test]
async fn producer_only_chain() {
    let duplex = compose(vec![StageSource::producer(|| {
        futures_util::stream::iter(vec![Ok(1), Ok(2), Ok(3)])
    })])
    .unwrap();

    assert_eq!(duplex.write(1).await.unwrap_err(), ComposeError::NotWritable);
    assert_eq!(duplex.end().await.unwrap_err(), ComposeError::NotWritable);
    assert_eq!(within(drain(&duplex)).await, vec![1, 2, 3]);
    assert_eq!(duplex.read().await.unwrap(), None);
    assert_eq!(within(duplex.closed()).await, None);
}

#[tokio::test]
async fn generator_chain_with_concurrent_reader() {
    let duplex = compose(vec![doubler(), plus_one()]).unwrap();

    let writer = tokio::spawn(write_all(duplex.clone(), vec![1, 2, 3]));
    assert_eq!(within(drain(&duplex)).await, vec![3, 5, 7]);
    within(writer).await.unwrap().unwrap();
    assert_eq!(within(duplex.closed()).await, None);
}

#[tokio::test]
async fn abandoned_write_does_not_block_later_writes() {
    let duplex = compose(vec![StageSource::generator(|chunks| {
        chunks.map(|x: i32| Ok(x))
    })])
    .unwrap();

    within(duplex.write(1)).await.unwrap();
    // The generator holds 1 until it is read, so 2 is never taken.
    let abandoned = tokio::time::timeout(Duration::from_millis(50), duplex.write(2)).await;
    assert!(abandoned.is_err());

    let writer = tokio::spawn({
        let duplex = duplex.clone();
        async move { duplex.write(3).await }
    });
    assert_eq!(within(duplex.read()).await.unwrap(), Some(1));
    assert_eq!(within(duplex.read()).await.unwrap(), Some(3));
    within(writer).await.unwrap().unwrap();

    within(duplex.end()).await.unwrap();
    assert_eq!(within(duplex.read()).await.unwrap(), None);
    assert_eq!(within(duplex.closed()).await, None);
}

#[tokio::test]
async fn consumer_tail_receives_everything() {
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = collected.clone();
    let duplex = compose(vec![
        StageSource::capability(BufferedStage::<i32>::pass_through(4)),
        StageSource::consumer(move |chunks| async move {
            let items: Vec<i32> = chunks.collect().await;
            sink.lock().unwrap().extend(items);
            Ok(())
        }),
    ])
    .unwrap();

    within(write_all(duplex.clone(), vec![1, 2, 3])).await.unwrap();
    assert_eq!(*collected.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(within(duplex.closed()).await, None);
}

#[tokio::test]
async fn consumer_rejection_becomes_terminal_error() {
    let duplex = compose(vec![
        StageSource::capability(BufferedStage::<i32>::pass_through(4)),
        StageSource::consumer(|chunks| async move {
            let _: Vec<i32> = chunks.collect().await;
            Err(ComposeError::stage("rejected"))
        }),
    ])
    .unwrap();

    let err = within(write_all(duplex.clone(), vec![1])).await.unwrap_err();
    assert_eq!(err, ComposeError::stage("rejected"));
    assert_eq!(
        within(duplex.closed()).await,
        Some(ComposeError::stage("rejected"))
    );
}

#[tokio::test]
async fn nested_composition_acts_as_a_stage() {
    let inner = compose(vec![StageSource::capability(BufferedStage::map(
        16,
        |x: i32| Ok(x * 2),
    ))])
    .unwrap();
    let outer = compose(vec![
        StageSource::from(inner.clone()),
        StageSource::capability(BufferedStage::map(16, |x: i32| Ok(x + 1))),
    ])
    .unwrap();

    within(write_all(outer.clone(), vec![1, 2, 3])).await.unwrap();
    assert_eq!(within(drain(&outer)).await, vec![3, 5, 7]);
    assert_eq!(within(outer.closed()).await, None);
    assert_eq!(within(inner.closed()).await, None);
}

#[tokio::test]
async fn into_stream_yields_until_end() {
    let duplex = compose(vec![StageSource::from(vec![4, 5, 6])]).unwrap();
    let items: Vec<i32> = within(duplex.into_stream().map(Result::unwrap).collect()).await;
    assert_eq!(items, vec![4, 5, 6]);
}

fn run_identity(len: usize, items: Vec<i32>) -> (Vec<i32>, Option<ComposeError>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let stages = (0..len)
            .map(|_| StageSource::capability(BufferedStage::<i32>::pass_through(2)))
            .collect();
        let duplex = compose(stages).unwrap();
        let writer = tokio::spawn(write_all(duplex.clone(), items));
        let out = within(drain(&duplex)).await;
        within(writer).await.unwrap().unwrap();
        (out, within(duplex.closed()).await)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    // Property: a chain of pass-through stages of any length delivers every
    // chunk unchanged and in order, then closes cleanly.
    #[test]
    fn prop_identity_chain_round_trips(
        len in 1usize..6,
        items in prop::collection::vec(any::<i32>(), 0..24),
    ) {
        let (out, outcome) = run_identity(len, items.clone());
        prop_assert_eq!(out, items);
        prop_assert_eq!(outcome, None);
    }
}
