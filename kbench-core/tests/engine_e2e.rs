//! End-to-end engine tests against the loopback broker. Timed runs use the
//! paused tokio clock so they finish instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use kbench_core::engine::{
    AccumulationConfig, ConsumeConfig, EngineError, JobEngine, LoadtestConsumerConfig,
    LoadtestProducerConfig, ProduceConfig, SendConfig,
};
use kbench_core::{
    BrokerClient, BrokerProducer, EventSink, JobEvent, JobRecord, JobStatus, MemoryJobStore,
    MemorySink, ProducerRecord,
};
use kbench_testbroker::MemoryBroker;

type Engine = JobEngine<MemoryBroker, MemoryJobStore>;

struct Fixture {
    broker: MemoryBroker,
    sink: Arc<MemorySink>,
    engine: Engine,
}

fn fixture() -> Fixture {
    let broker = MemoryBroker::with_topics(["benchmark"]);
    let sink = Arc::new(MemorySink::new());
    let events: Arc<dyn EventSink> = sink.clone();
    let engine = JobEngine::new(
        Arc::new(broker.clone()),
        Arc::new(MemoryJobStore::new()),
        events,
        "kbench-test",
    );
    Fixture {
        broker,
        sink,
        engine,
    }
}

async fn wait_done(engine: &Engine, job_id: &str) -> JobRecord {
    for _ in 0..10_000 {
        match engine.history_record(job_id).await {
            Ok(Some(record)) if record.status != JobStatus::Running => return record,
            Ok(_) => {}
            Err(err) => panic!("history lookup failed: {err}"),
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {job_id} did not finish");
}

fn terminal_events(sink: &MemorySink) -> Vec<JobEvent> {
    sink.events()
        .into_iter()
        .filter(|event| event.is_terminal())
        .collect()
}

fn sequenced_record(seq: u64) -> ProducerRecord {
    ProducerRecord {
        key: format!("key-{seq}"),
        value: serde_json::json!({
            "message": "m",
            "timestamp": 0u64,
            "sequence": seq,
        })
        .to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn loadtest_producer_completes_at_duration() {
    let fx = fixture();

    let record = match fx
        .engine
        .start_loadtest_producer(LoadtestProducerConfig {
            topic: "benchmark".to_string(),
            target_throughput: Some(100),
            duration_secs: 2,
            record_size: 100,
            batch_size: 1,
            compression: None,
            acks: None,
            name: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    let finished = wait_done(&fx.engine, &record.id).await;
    assert_eq!(finished.status, JobStatus::Completed);

    // 100 records/sec for 2 seconds.
    let produced = fx.broker.record_count("benchmark");
    assert!(
        (190..=200).contains(&produced),
        "produced {produced} records"
    );
    assert_eq!(finished.stats.total_records as usize, produced);
    assert_eq!(finished.stats.failed_records, 0);
    assert!(!finished.stats.running);
    assert!(finished.stats.end_time.is_some());
    assert!(
        (90.0..=110.0).contains(&finished.stats.records_per_sec),
        "records_per_sec {}",
        finished.stats.records_per_sec
    );
    assert!(finished.stats.percentiles.is_some());
    assert!(!finished.stats.throughput_history.is_empty());

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    match &terminal[0] {
        JobEvent::LoadtestComplete(snapshot) => assert_eq!(snapshot.job_id, record.id),
        other => panic!("unexpected terminal event: {other:?}"),
    }

    // The job left the registry during teardown.
    assert!(fx.engine.list_running().is_empty());
}

#[tokio::test(start_paused = true)]
async fn single_send_completes_within_the_call() {
    let fx = fixture();

    let record = match fx
        .engine
        .send_records(SendConfig {
            topic: "benchmark".to_string(),
            count: 1,
            message: Some("hello".to_string()),
            name: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("send failed: {err}"),
    };

    // Completed before the call returned; no live job was registered.
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.stats.total_records, 1);
    assert_eq!(record.stats.success_records, 1);
    assert!(fx.engine.list_running().is_empty());
    assert_eq!(fx.broker.record_count("benchmark"), 1);

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEvent::ProduceComplete(_)));
}

#[tokio::test(start_paused = true)]
async fn batch_send_reports_progress_per_record() {
    let fx = fixture();

    let record = match fx
        .engine
        .send_records(SendConfig {
            topic: "benchmark".to_string(),
            count: 5,
            message: None,
            name: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("send failed: {err}"),
    };
    assert_eq!(record.status, JobStatus::Running);

    let finished = wait_done(&fx.engine, &record.id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.stats.success_records, 5);
    assert_eq!(fx.broker.record_count("benchmark"), 5);

    let progress: Vec<(u64, u64)> = fx
        .sink
        .events()
        .into_iter()
        .filter_map(|event| match event {
            JobEvent::Produce(point) => Some((point.progress.current, point.progress.total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEvent::ProduceComplete(_)));
}

#[tokio::test(start_paused = true)]
async fn accumulation_producer_stops_at_end_bound() {
    let fx = fixture();

    let record = match fx
        .engine
        .start_produce(ProduceConfig {
            topic: "benchmark".to_string(),
            name: None,
            accumulation: AccumulationConfig {
                prefix: "TEST".to_string(),
                pad: 2,
                start: 1,
                end: Some(3),
                interval_ms: 10,
            },
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    let finished = wait_done(&fx.engine, &record.id).await;
    assert_eq!(finished.status, JobStatus::Completed);

    let values: Vec<String> = fx
        .broker
        .records("benchmark")
        .into_iter()
        .map(|r| r.value)
        .collect();
    assert_eq!(values, vec!["TEST01", "TEST02", "TEST03"]);

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEvent::ProduceComplete(_)));
}

#[tokio::test(start_paused = true)]
async fn stop_ends_a_job_early_and_is_idempotent() {
    let fx = fixture();

    let record = match fx
        .engine
        .start_loadtest_producer(LoadtestProducerConfig {
            topic: "benchmark".to_string(),
            target_throughput: Some(100),
            duration_secs: 60,
            record_size: 100,
            batch_size: 1,
            compression: None,
            acks: None,
            name: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    tokio::time::sleep(Duration::from_millis(500)).await;

    let outcome = match fx.engine.stop(&record.id).await {
        Some(outcome) => outcome,
        None => panic!("job should be live"),
    };
    assert!(!outcome.stats.running);
    assert!(outcome.persist_error.is_none());
    assert!(outcome.stats.total_records > 0);

    // Already torn down: a second stop finds nothing, and no second terminal
    // event was published.
    assert!(fx.engine.stop(&record.id).await.is_none());
    assert_eq!(terminal_events(&fx.sink).len(), 1);

    let finished = wait_done(&fx.engine, &record.id).await;
    assert_eq!(finished.status, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn consumer_reports_missing_sequences() {
    let fx = fixture();

    let producer = match fx.broker.producer("seed").await {
        Ok(p) => p,
        Err(err) => panic!("connect failed: {err}"),
    };
    for seq in [1u64, 2, 4, 5, 7] {
        if let Err(err) = producer
            .send("benchmark", std::slice::from_ref(&sequenced_record(seq)))
            .await
        {
            panic!("seed send failed: {err}");
        }
    }

    let record = match fx
        .engine
        .start_consume(ConsumeConfig {
            topic: "benchmark".to_string(),
            group_id: "gap-check".to_string(),
            from_beginning: true,
            name: None,
            duration_secs: None,
            max_records: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    // Wait for all five replayed records to be counted.
    for _ in 0..10_000 {
        match fx.engine.job_stats(&record.id).await {
            Ok(Some(stats)) if stats.total_records == 5 => break,
            Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(err) => panic!("stats lookup failed: {err}"),
        }
    }

    let report = match fx.engine.missing_sequences(&record.id, Some((1, 7))) {
        Some(report) => report,
        None => panic!("job should be live"),
    };
    assert_eq!(report.missing, vec![3, 6]);
    assert_eq!(report.ranges, vec!["3".to_string(), "6".to_string()]);
    assert_eq!(report.total_expected, 7);
    assert_eq!(report.total_received, 5);

    let outcome = match fx.engine.stop(&record.id).await {
        Some(outcome) => outcome,
        None => panic!("job should be live"),
    };
    assert_eq!(outcome.stats.unique_sequences, Some(5));

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEvent::ConsumeComplete(_)));
}

#[tokio::test(start_paused = true)]
async fn loadtest_consumer_counts_replayed_records() {
    let fx = fixture();

    let producer = match fx.broker.producer("seed").await {
        Ok(p) => p,
        Err(err) => panic!("connect failed: {err}"),
    };
    for seq in 1u64..=10 {
        if let Err(err) = producer
            .send("benchmark", std::slice::from_ref(&sequenced_record(seq)))
            .await
        {
            panic!("seed send failed: {err}");
        }
    }

    let record = match fx
        .engine
        .start_loadtest_consumer(LoadtestConsumerConfig {
            topic: "benchmark".to_string(),
            group_id: None,
            from_beginning: true,
            duration_secs: 2,
            name: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    let finished = wait_done(&fx.engine, &record.id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.stats.total_records, 10);
    assert_eq!(finished.stats.unique_sequences, Some(10));
    // Consumers track no per-operation latency.
    assert!(finished.stats.percentiles.is_none());

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEvent::LoadtestComplete(_)));
}

#[tokio::test(start_paused = true)]
async fn record_arriving_at_the_deadline_still_counts() {
    let fx = fixture();

    let producer = match fx.broker.producer("seed").await {
        Ok(p) => p,
        Err(err) => panic!("connect failed: {err}"),
    };
    for seq in 1u64..=5 {
        if let Err(err) = producer
            .send("benchmark", std::slice::from_ref(&sequenced_record(seq)))
            .await
        {
            panic!("seed send failed: {err}");
        }
    }

    let record = match fx
        .engine
        .start_loadtest_consumer(LoadtestConsumerConfig {
            topic: "benchmark".to_string(),
            group_id: None,
            from_beginning: true,
            duration_secs: 2,
            name: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    // Let the replay drain, then queue one more delivery and jump past the
    // deadline before the loop sees it.
    for _ in 0..10_000 {
        match fx.engine.job_stats(&record.id).await {
            Ok(Some(stats)) if stats.total_records == 5 => break,
            Ok(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(err) => panic!("stats lookup failed: {err}"),
        }
    }
    if let Err(err) = producer
        .send("benchmark", std::slice::from_ref(&sequenced_record(6)))
        .await
    {
        panic!("late send failed: {err}");
    }
    tokio::time::advance(Duration::from_secs(3)).await;

    let finished = wait_done(&fx.engine, &record.id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    // The delivery that was queued when the duration elapsed is counted.
    assert_eq!(finished.stats.total_records, 6);
    assert_eq!(finished.stats.unique_sequences, Some(6));

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEvent::LoadtestComplete(_)));
}

#[tokio::test(start_paused = true)]
async fn consumer_completes_at_max_records() {
    let fx = fixture();

    let producer = match fx.broker.producer("seed").await {
        Ok(p) => p,
        Err(err) => panic!("connect failed: {err}"),
    };
    for seq in 1u64..=3 {
        if let Err(err) = producer
            .send("benchmark", std::slice::from_ref(&sequenced_record(seq)))
            .await
        {
            panic!("seed send failed: {err}");
        }
    }

    let record = match fx
        .engine
        .start_consume(ConsumeConfig {
            topic: "benchmark".to_string(),
            group_id: "bounded".to_string(),
            from_beginning: true,
            name: None,
            duration_secs: None,
            max_records: Some(3),
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    // No duration and no stop request: the count bound alone ends the job.
    let finished = wait_done(&fx.engine, &record.id).await;
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.stats.total_records, 3);
    assert_eq!(finished.stats.unique_sequences, Some(3));
    assert!(finished.stats.lag.is_none());
    assert!(fx.engine.list_running().is_empty());

    let terminal = terminal_events(&fx.sink);
    assert_eq!(terminal.len(), 1);
    assert!(matches!(terminal[0], JobEvent::ConsumeComplete(_)));
}

#[tokio::test(start_paused = true)]
async fn failed_sends_are_counted_not_fatal() {
    let fx = fixture();
    fx.broker.set_fail_sends(true);

    let record = match fx
        .engine
        .start_loadtest_producer(LoadtestProducerConfig {
            topic: "benchmark".to_string(),
            target_throughput: Some(50),
            duration_secs: 1,
            record_size: 100,
            batch_size: 1,
            compression: None,
            acks: None,
            name: None,
        })
        .await
    {
        Ok(record) => record,
        Err(err) => panic!("start failed: {err}"),
    };

    let finished = wait_done(&fx.engine, &record.id).await;

    // The run completes despite every send failing.
    assert_eq!(finished.status, JobStatus::Completed);
    assert!(finished.stats.failed_records > 0);
    assert_eq!(finished.stats.success_records, 0);
    assert!((finished.stats.error_rate - 100.0).abs() < f64::EPSILON);
    assert_eq!(finished.stats.broker_errors, finished.stats.failed_records);
}

#[tokio::test]
async fn setup_validation_rejects_bad_configs() {
    let fx = fixture();

    match fx
        .engine
        .start_consume(ConsumeConfig {
            topic: String::new(),
            group_id: "g".to_string(),
            from_beginning: false,
            name: None,
            duration_secs: None,
            max_records: None,
        })
        .await
    {
        Err(EngineError::MissingTopic) => {}
        other => panic!("expected MissingTopic, got {other:?}"),
    }

    match fx
        .engine
        .start_consume(ConsumeConfig {
            topic: "benchmark".to_string(),
            group_id: String::new(),
            from_beginning: false,
            name: None,
            duration_secs: None,
            max_records: None,
        })
        .await
    {
        Err(EngineError::MissingGroupId) => {}
        other => panic!("expected MissingGroupId, got {other:?}"),
    }

    match fx
        .engine
        .send_records(SendConfig {
            topic: "benchmark".to_string(),
            count: 0,
            message: None,
            name: None,
        })
        .await
    {
        Err(EngineError::InvalidCount) => {}
        other => panic!("expected InvalidCount, got {other:?}"),
    }
}

#[tokio::test]
async fn connect_failure_marks_the_job_failed() {
    let fx = fixture();
    fx.broker.set_fail_connects(true);

    let err = match fx
        .engine
        .start_loadtest_producer(LoadtestProducerConfig {
            topic: "benchmark".to_string(),
            target_throughput: None,
            duration_secs: 1,
            record_size: 100,
            batch_size: 1,
            compression: None,
            acks: None,
            name: None,
        })
        .await
    {
        Ok(_) => panic!("start should fail"),
        Err(err) => err,
    };
    assert!(matches!(err, EngineError::Broker(_)));

    // The setup failure is recorded in history.
    let records = match fx.engine.history(&Default::default()).await {
        Ok(records) => records,
        Err(err) => panic!("history failed: {err}"),
    };
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, JobStatus::Failed);
    assert!(fx.engine.list_running().is_empty());
}
