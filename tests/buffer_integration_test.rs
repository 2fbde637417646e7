use std::time::Duration;

use api::StatusProvider;
use buffer::{BufferConfig, BufferedRecord};
use color_eyre::eyre::Result;
use engine::{Engine, PipelineSpec};
use tempfile::tempdir;

use crate::common::{init, wait_until, FlakySink, PushSource};

mod common;

fn buffer_config(dir: &std::path::Path) -> BufferConfig {
    BufferConfig {
        enabled: true,
        dir: dir.to_path_buf(),
        max_queue_size: 64,
        max_retries: 3,
        retry_interval_seconds: 1,
        max_retry_delay_seconds: 2,
        flush_interval_seconds: 1,
        dlq_enabled: true,
        dlq_path: None,
    }
}

/// A sink failing twice then succeeding: the record is delivered on the
/// third call, nothing is dead-lettered, and the engine never observed the
/// failures.
#[tokio::test]
async fn transient_sink_failures_are_retried() -> Result<()> {
    init();

    let dir = tempdir()?;
    let (source, handle) = PushSource::new();
    let (sink, records) = FlakySink::new(2);

    let mut engine = Engine::new();
    engine.set_output_buffer_config(buffer_config(dir.path()));
    engine.add_source("s1", Box::new(source))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "flaky".to_string(),
        sink: sink.clone(),
        filters: vec![],
        sources: vec![],
    })?;
    engine.start().await?;

    handle.push("info", "eventually delivered").await;

    assert!(wait_until(Duration::from_secs(15), || records.lock().unwrap().len() == 1).await);
    assert_eq!(sink.calls(), 3);

    let metrics = engine.state().metrics();
    let stats = metrics.pipelines[0].buffer.as_ref().expect("buffered pipeline");
    assert_eq!(stats.delivered, 1);
    assert!(stats.retried >= 1);
    assert_eq!(stats.dlq, 0);

    engine.stop().await?;
    Ok(())
}

/// A sink that always fails: after `max_retries` attempts the record is
/// appended to the DLQ file as a single JSON line.
#[tokio::test]
async fn exhausted_retries_reach_the_dlq() -> Result<()> {
    init();

    let dir = tempdir()?;
    let (source, handle) = PushSource::new();
    let (sink, _records) = FlakySink::new(u32::MAX);

    let mut engine = Engine::new();
    engine.set_output_buffer_config(buffer_config(dir.path()));
    engine.add_source("s1", Box::new(source))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "doomed".to_string(),
        sink,
        filters: vec![],
        sources: vec![],
    })?;
    engine.start().await?;

    handle.push("error", "unroutable").await;

    let state = engine.state();
    assert!(
        wait_until(Duration::from_secs(20), || {
            state
                .metrics()
                .pipelines
                .first()
                .and_then(|p| p.buffer.as_ref().map(|b| b.dlq))
                .unwrap_or(0)
                == 1
        })
        .await
    );

    engine.stop().await?;

    let dlq_path = dir.path().join("doomed").join("dlq.jsonl");
    let content = std::fs::read_to_string(dlq_path)?;
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);
    let dead: BufferedRecord = serde_json::from_str(lines[0])?;
    assert!(dead.attempts >= 3);
    assert_eq!(dead.record.message, "unroutable");
    assert_eq!(dead.output_name, "doomed");
    Ok(())
}

/// Buffer stats identity at a quiescent point:
/// enqueued = delivered + dlq + failed + queued + retrying.
#[tokio::test]
async fn stats_identity_holds_at_quiescence() -> Result<()> {
    init();

    let dir = tempdir()?;
    let (source, handle) = PushSource::new();
    let (sink, records) = FlakySink::new(0);

    let mut engine = Engine::new();
    engine.set_output_buffer_config(buffer_config(dir.path()));
    engine.add_source("s1", Box::new(source))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "steady".to_string(),
        sink,
        filters: vec![],
        sources: vec![],
    })?;
    engine.start().await?;

    for i in 0..10 {
        handle.push("info", &format!("m{i}")).await;
    }

    assert!(wait_until(Duration::from_secs(10), || records.lock().unwrap().len() == 10).await);

    let metrics = engine.state().metrics();
    let stats = metrics.pipelines[0].buffer.as_ref().expect("buffered pipeline");
    assert_eq!(stats.enqueued, 10);
    assert_eq!(
        stats.enqueued,
        stats.delivered
            + stats.dlq
            + stats.failed
            + stats.current_queued as u64
            + stats.current_retrying as u64
    );

    engine.stop().await?;
    Ok(())
}
