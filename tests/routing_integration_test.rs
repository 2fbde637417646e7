use std::{sync::Arc, time::Duration};

use color_eyre::eyre::Result;
use engine::{Engine, PipelineSpec};
use filter::keep_levels::KeepLevels;

use crate::common::{init, wait_until, CollectingSink, PushSource};

mod common;

/// Single source, single sink, WAL off, buffer off: the sink receives
/// exactly the injected records, in order.
#[tokio::test]
async fn single_source_single_sink_in_order() -> Result<()> {
    init();

    let (source, handle) = PushSource::new();
    let (sink, records) = CollectingSink::new();

    let mut engine = Engine::new();
    engine.add_source("s1", Box::new(source))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "console".to_string(),
        sink,
        filters: vec![],
        sources: vec![],
    })?;
    engine.start().await?;

    handle.push("info", "a").await;
    handle.push("error", "b").await;
    handle.push("warn", "c").await;

    assert!(wait_until(Duration::from_secs(5), || records.lock().unwrap().len() == 3).await);
    {
        let records = records.lock().unwrap();
        let seen: Vec<(&str, &str)> = records.iter().map(|r| (r.level.as_str(), r.message.as_str())).collect();
        assert_eq!(seen, vec![("info", "a"), ("error", "b"), ("warn", "c")]);
        assert!(records.iter().all(|r| r.source == "s1"));
    }
    assert_eq!(engine.state().total_records(), 3);

    engine.stop().await?;
    // Stopping a second time is a no-op.
    engine.stop().await?;
    Ok(())
}

/// A pipeline with a source allow-list sees only records from the listed
/// sources; the totals still count every routed record.
#[tokio::test]
async fn source_allow_list_restricts_a_pipeline() -> Result<()> {
    init();

    let (source1, handle1) = PushSource::new();
    let (source2, handle2) = PushSource::new();
    let (sink, records) = CollectingSink::new();

    let mut engine = Engine::new();
    engine.add_source("s1", Box::new(source1))?;
    engine.add_source("s2", Box::new(source2))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "p1".to_string(),
        sink,
        filters: vec![],
        sources: vec!["s1".to_string()],
    })?;
    engine.start().await?;

    handle1.push("info", "from s1").await;
    handle2.push("info", "from s2").await;

    assert!(wait_until(Duration::from_secs(5), || engine.state().total_records() == 2).await);
    // Give the router a moment to prove it does not deliver the s2 record.
    tokio::time::sleep(Duration::from_millis(100)).await;

    {
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "s1");
        assert_eq!(records[0].message, "from s1");
    }

    engine.stop().await?;
    Ok(())
}

/// The first filter that drops a record stops the evaluation for the
/// pipeline; surviving records reach the sink.
#[tokio::test]
async fn filter_chain_drops_unwanted_levels() -> Result<()> {
    init();

    let (source, handle) = PushSource::new();
    let (sink, records) = CollectingSink::new();

    let mut engine = Engine::new();
    engine.add_source("s1", Box::new(source))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "alerts".to_string(),
        sink,
        filters: vec![engine::NamedFilter {
            name: "severity".to_string(),
            filter: Box::new(KeepLevels::new(
                "severity",
                vec!["error".to_string(), "warn".to_string()],
            )),
        }],
        sources: vec![],
    })?;
    engine.start().await?;

    handle.push("info", "x").await;
    handle.push("error", "y").await;

    assert!(wait_until(Duration::from_secs(5), || engine.state().total_records() == 2).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    {
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].level, "error");
        assert_eq!(records[0].message, "y");
    }

    engine.stop().await?;
    Ok(())
}

/// Records are submitted to pipelines in declaration order, and one
/// pipeline dropping a record does not affect the others.
#[tokio::test]
async fn pipelines_filter_independently() -> Result<()> {
    init();

    let (source, handle) = PushSource::new();
    let (all_sink, all_records) = CollectingSink::new();
    let (error_sink, error_records) = CollectingSink::new();

    let mut engine = Engine::new();
    engine.add_source("s1", Box::new(source))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "everything".to_string(),
        sink: all_sink,
        filters: vec![],
        sources: vec![],
    })?;
    engine.add_output_pipeline(PipelineSpec {
        name: "errors-only".to_string(),
        sink: error_sink,
        filters: vec![engine::NamedFilter {
            name: "severity".to_string(),
            filter: Box::new(KeepLevels::new("severity", vec!["error".to_string()])),
        }],
        sources: vec![],
    })?;
    engine.start().await?;

    handle.push("info", "quiet").await;
    handle.push("error", "loud").await;

    assert!(wait_until(Duration::from_secs(5), || all_records.lock().unwrap().len() == 2).await);
    assert!(wait_until(Duration::from_secs(5), || error_records.lock().unwrap().len() == 1).await);
    assert_eq!(error_records.lock().unwrap()[0].message, "loud");

    engine.stop().await?;
    Ok(())
}

/// Filters enrich their own pipeline's copy of the record; other
/// pipelines never observe the mutation.
#[tokio::test]
async fn filter_enrichment_stays_per_pipeline() -> Result<()> {
    init();

    struct Tagger {}
    impl filter::Filter for Tagger {
        fn process(&self, record: &mut record::Record) -> bool {
            let _ = record.metadata.insert("tagged".to_string(), "yes".to_string());
            true
        }
    }

    let (source, handle) = PushSource::new();
    let (tagged_sink, tagged_records) = CollectingSink::new();
    let (plain_sink, plain_records) = CollectingSink::new();

    let mut engine = Engine::new();
    engine.add_source("s1", Box::new(source))?;
    engine.add_output_pipeline(PipelineSpec {
        name: "tagged".to_string(),
        sink: tagged_sink,
        filters: vec![engine::NamedFilter {
            name: "tagger".to_string(),
            filter: Box::new(Tagger {}),
        }],
        sources: vec![],
    })?;
    engine.add_output_pipeline(PipelineSpec {
        name: "plain".to_string(),
        sink: plain_sink,
        filters: vec![],
        sources: vec![],
    })?;
    engine.start().await?;

    handle.push("info", "once").await;

    assert!(wait_until(Duration::from_secs(5), || plain_records.lock().unwrap().len() == 1).await);
    assert!(wait_until(Duration::from_secs(5), || tagged_records.lock().unwrap().len() == 1).await);

    assert_eq!(
        tagged_records.lock().unwrap()[0].metadata.get("tagged").map(String::as_str),
        Some("yes")
    );
    assert!(plain_records.lock().unwrap()[0].metadata.is_empty());

    engine.stop().await?;
    Ok(())
}

/// The sink is reachable through an Arc because pipelines share it with
/// their buffer; make sure an unbuffered pipeline closes it on stop.
#[tokio::test]
async fn stop_closes_the_pipelines() -> Result<()> {
    init();

    struct ClosableSink {
        closed: Arc<std::sync::Mutex<bool>>,
    }

    #[async_trait::async_trait]
    impl sink::Sink for ClosableSink {
        async fn write(&self, _record: &record::Record) -> Result<(), sink::Error> {
            Ok(())
        }

        async fn close(&self) -> Result<(), sink::Error> {
            *self.closed.lock().unwrap() = true;
            Ok(())
        }
    }

    let closed = Arc::new(std::sync::Mutex::new(false));
    let mut engine = Engine::new();
    engine.add_output_pipeline(PipelineSpec {
        name: "closable".to_string(),
        sink: Arc::new(ClosableSink { closed: closed.clone() }),
        filters: vec![],
        sources: vec![],
    })?;
    engine.start().await?;
    engine.stop().await?;

    assert!(*closed.lock().unwrap());
    Ok(())
}
