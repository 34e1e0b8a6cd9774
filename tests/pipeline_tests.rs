//! Composite pipeline behaviour

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{drain_one, feed_complete, feed_f32, ring};
use sluice::{
    BatchMatcher, Filter, MatcherConfig, OverflowPolicy, Passthrough, PassthroughConfig, Pipeline,
    PipelineConfig, PropertyId, PropertyTable, PropertyValue, SampleType, SluiceError,
};

fn stage(name: &str) -> Box<dyn Filter> {
    Box::new(Passthrough::new(PassthroughConfig::new(name, SampleType::F32)).unwrap())
}

fn cascade() -> Pipeline {
    let config = PipelineConfig::new("cascade")
        .with_connection(0, 0, 1, 0)
        .with_connection(1, 0, 2, 0)
        .with_input(0, 0)
        .with_output(2, 0);
    Pipeline::new(config, vec![stage("first"), stage("second"), stage("third")]).unwrap()
}

#[test]
fn complete_shuts_down_three_filter_cascade() {
    let mut pipeline = cascade();
    let out = ring("terminal", SampleType::F32, 6, 4, OverflowPolicy::Block);
    pipeline.connect_sink(0, Arc::clone(&out)).unwrap();
    pipeline.start().unwrap();

    let input = pipeline.input_ring(0).unwrap();
    for i in 0..3u64 {
        feed_f32(&input, &[i as f32], i * 64_000, 1_000, i);
    }
    feed_complete(&input, 3);

    for i in 0..3u64 {
        let observed = drain_one(&out);
        assert_eq!(observed.batch_id, i);
        assert_eq!(observed.values, vec![i as f32]);
        assert!(!observed.complete);
    }
    let sentinel = drain_one(&out);
    assert!(sentinel.complete, "sentinel follows the data batches");

    // Every internal worker observes the sentinel and winds down
    let deadline = Instant::now() + Duration::from_secs(2);
    while pipeline.is_running() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    for index in 0..pipeline.len() {
        assert!(
            !pipeline.internal(index).unwrap().is_running(),
            "internal filter {index} still running"
        );
    }

    pipeline.stop().unwrap();
    assert!(pipeline.worker_err().is_none());
}

#[test]
fn pipeline_cycle_fails_init_with_cycle_message() {
    let config = PipelineConfig::new("ab-loop")
        .with_connection(0, 0, 1, 0)
        .with_connection(1, 0, 0, 0);
    match Pipeline::new(config, vec![stage("a"), stage("b")]) {
        Err(SluiceError::InvalidConfig { message }) => {
            assert!(message.contains("cycle"), "message was: {message}")
        }
        other => panic!("expected InvalidConfig with cycle message, got {other:?}"),
    }
}

#[test]
fn internal_worker_error_surfaces_as_pipelines_own() {
    // first -> matcher; a misaligned first batch trips the matcher's phase
    // check and the failure must surface through the composite
    let matcher = BatchMatcher::new(MatcherConfig::new("align", SampleType::F32)).unwrap();
    let config = PipelineConfig::new("faulty")
        .with_connection(0, 0, 1, 0)
        .with_input(0, 0)
        .with_output(1, 0);
    let mut pipeline =
        Pipeline::new(config, vec![stage("first"), Box::new(matcher)]).unwrap();

    let out = ring("terminal", SampleType::F32, 6, 4, OverflowPolicy::Block);
    pipeline.connect_sink(0, Arc::clone(&out)).unwrap();
    pipeline.start().unwrap();

    let input = pipeline.input_ring(0).unwrap();
    let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
    feed_f32(&input, &values, 12_345_000, 1_000_000, 0);

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(err) = pipeline.worker_err() {
            assert_eq!(err.code, sluice::ErrorCode::PhaseError);
            break;
        }
        assert!(Instant::now() < deadline, "phase error never surfaced");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(out.is_empty(), "no output escaped before the failure");

    pipeline.stop().unwrap();
    assert!(pipeline.worker_err().is_some());
}

#[test]
fn declared_input_properties_propagate_to_constraints() {
    let matcher = BatchMatcher::new(MatcherConfig::new("align", SampleType::F32)).unwrap();
    let config = PipelineConfig::new("typed")
        .with_connection(0, 0, 1, 0)
        .with_input(0, 0)
        .with_output(1, 0);
    let mut pipeline =
        Pipeline::new(config, vec![stage("first"), Box::new(matcher)]).unwrap();

    // Regular timing satisfies the matcher's constraint
    let mut regular = PropertyTable::new();
    regular.set(PropertyId::Regular, PropertyValue::Bool(true));
    regular.set(PropertyId::PeriodNs, PropertyValue::U64(1_000));
    pipeline.add_input_properties(regular).unwrap();

    // An irregular stream is rejected when the declaration changes
    let mut irregular = PropertyTable::new();
    irregular.set(PropertyId::Regular, PropertyValue::Bool(false));
    assert!(matches!(
        pipeline.add_input_properties(irregular),
        Err(SluiceError::PropertyMismatch { .. })
    ));
}

#[test]
fn pipeline_restarts_after_stop() {
    let mut pipeline = cascade();
    let out = ring("terminal", SampleType::F32, 6, 4, OverflowPolicy::Block);
    pipeline.connect_sink(0, Arc::clone(&out)).unwrap();

    pipeline.start().unwrap();
    feed_f32(&pipeline.input_ring(0).unwrap(), &[7.0], 0, 0, 0);
    assert_eq!(drain_one(&out).values, vec![7.0]);
    pipeline.stop().unwrap();

    out.start();
    pipeline.start().unwrap();
    feed_f32(&pipeline.input_ring(0).unwrap(), &[8.0], 0, 0, 0);
    assert_eq!(drain_one(&out).values, vec![8.0]);
    pipeline.stop().unwrap();
    assert!(pipeline.worker_err().is_none());
}

#[test]
fn pipeline_stats_reflect_external_endpoints() {
    let mut pipeline = cascade();
    let out = ring("terminal", SampleType::F32, 6, 4, OverflowPolicy::Block);
    pipeline.connect_sink(0, Arc::clone(&out)).unwrap();
    pipeline.start().unwrap();

    let input = pipeline.input_ring(0).unwrap();
    for i in 0..4u64 {
        feed_f32(&input, &[i as f32, i as f32], i * 2_000, 1_000, i);
    }
    for _ in 0..4 {
        drain_one(&out);
    }

    pipeline.stop().unwrap();
    let stats = pipeline.get_stats();
    assert_eq!(stats.batches_in, 4);
    assert_eq!(stats.samples_in, 8);
    assert_eq!(stats.batches_out, 4);
    assert_eq!(stats.samples_out, 8);
}
