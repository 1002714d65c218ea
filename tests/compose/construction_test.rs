//! Validation performed synchronously by `compose`

use std::any::Any;
use std::sync::Arc;

use streamsplice::{
    BufferedStage, ComposeError, ComposedDuplex, Direction, GeneratorFn, SharedCapability,
    StageSource, compose, compose_any,
};

use crate::support::stages::{doubler, within};

#[tokio::test]
async fn empty_chain_is_missing_stages() {
    let result: streamsplice::Result<ComposedDuplex<i32>> = streamsplice::compose!();
    assert_eq!(result.unwrap_err(), ComposeError::MissingStages);

    let err = compose_any::<i32>(Vec::new()).unwrap_err();
    assert_eq!(err, ComposeError::MissingStages);
}

#[tokio::test]
async fn plain_number_is_not_a_stage() {
    let err = compose_any::<i32>(vec![Box::new(42)]).unwrap_err();
    assert!(matches!(err, ComposeError::InvalidStageType { index: 0, .. }));
    assert!(err.is_construction());
}

#[tokio::test]
async fn invalid_element_reports_its_position() {
    let head: SharedCapability<i32> = Arc::new(BufferedStage::pass_through(4));
    let stages: Vec<Box<dyn Any + Send>> = vec![Box::new(head), Box::new("not a stage")];
    let err = compose_any::<i32>(stages).unwrap_err();
    assert!(matches!(err, ComposeError::InvalidStageType { index: 1, .. }));
}

#[tokio::test]
async fn dynamic_elements_are_classified() {
    let body: GeneratorFn<i32> = Box::new(|chunks: streamsplice::ChunkSource<i32>| {
        use futures_util::StreamExt;
        chunks.map(|x| Ok(x * 3)).boxed()
    });
    let stages: Vec<Box<dyn Any + Send>> = vec![Box::new(vec![1, 2]), Box::new(body)];
    let duplex = compose_any::<i32>(stages).unwrap();

    assert_eq!(within(duplex.read()).await.unwrap(), Some(3));
    assert_eq!(within(duplex.read()).await.unwrap(), Some(6));
    assert_eq!(within(duplex.read()).await.unwrap(), None);
}

#[tokio::test]
async fn sink_in_the_middle_is_a_direction_mismatch() {
    let (sink, _) = BufferedStage::<i32>::collector();
    let err = compose(vec![
        doubler(),
        StageSource::capability(sink),
        doubler(),
    ])
    .unwrap_err();
    assert_eq!(
        err,
        ComposeError::StageDirectionMismatch {
            index: 1,
            expected: Direction::Readable,
        }
    );
}

#[tokio::test]
async fn source_after_head_is_a_direction_mismatch() {
    let err = streamsplice::compose!(doubler(), vec![1, 2, 3]).unwrap_err();
    assert_eq!(
        err,
        ComposeError::StageDirectionMismatch {
            index: 1,
            expected: Direction::Writable,
        }
    );
    assert_eq!(
        err.to_string(),
        "stage direction mismatch: streams[1] must be writable"
    );
}

#[tokio::test]
async fn sink_tail_is_not_readable() {
    let (sink, _) = BufferedStage::<i32>::collector();
    let duplex = compose(vec![doubler(), StageSource::capability(sink)]).unwrap();
    assert_eq!(duplex.read().await.unwrap_err(), ComposeError::NotReadable);
    duplex.write(1).await.unwrap();
}
