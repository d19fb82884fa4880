//! End-to-end retrieval through a scheduler group

use cloudraid::config::{Config, EngineConfig};
use cloudraid::error::{Error, Failure};
use cloudraid::raid::{encode, RequestParams, RAIDPARTS};
use cloudraid::scheduler::SchedulerGroup;
use cloudraid::transport::{Demotion, Fault, FileTransport, MemoryTransport};
use rand::{Rng, SeedableRng};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; len];
    rng.fill(&mut data[..]);
    data
}

fn test_config() -> Config {
    Config {
        engine: EngineConfig {
            retry_delay_ms: 1,
            max_backoff_ms: 10,
            max_retries: 3,
            hang_threshold_ms: 50,
            stall_report_ms: 5_000,
            feed_timeout_ms: 10_000,
            reader_wake_ms: 10,
            ..EngineConfig::default()
        },
        ..Config::default()
    }
}

fn start(transport: &MemoryTransport) -> SchedulerGroup {
    SchedulerGroup::start(&test_config(), Arc::new(transport.clone())).unwrap()
}

#[test]
fn test_healthy_shards() {
    let transport = MemoryTransport::new();
    let data = payload(1_000_000, 1);
    let urls = transport.publish("healthy", &data);
    let group = start(&transport);

    let mut handle = group
        .submit(RequestParams::new(data.len() as u64, urls).unwrap())
        .unwrap();
    let mut out = Vec::new();
    handle.read_to_end(&mut out).unwrap();

    assert_eq!(out.len(), data.len());
    assert!(out == data);
    assert_eq!(handle.remaining(), 0);
    assert_eq!(handle.stats().progress, data.len() as u64);
    assert!(transport.latency_samples() > 0);

    let metrics = group.metrics();
    assert_eq!(metrics.bytes_delivered, data.len() as u64);
    assert_eq!(metrics.failed_transfers, 0);
    group.remove(handle);
}

#[test]
fn test_failing_shard_is_rebuilt_from_parity() {
    let transport = MemoryTransport::new();
    let data = payload(250_000, 2);
    let urls = transport.publish("failing", &data);
    transport.set_fault(3, Fault::Fail);
    let group = start(&transport);

    let mut handle = group
        .submit(RequestParams::new(data.len() as u64, urls).unwrap())
        .unwrap();
    let mut out = Vec::new();
    handle.read_to_end(&mut out).unwrap();
    assert!(out == data);

    let stats = handle.stats();
    assert!(stats.shards[3].errors > 0);
    assert!(stats.shards[5].bytes_received > 0);
    assert!(stats.failure.is_none());
}

#[test]
fn test_missing_url() {
    let transport = MemoryTransport::new();
    let data = payload(123_457, 3);
    let mut urls = transport.publish("missing", &data);
    urls[0].clear();
    let group = start(&transport);

    let mut handle = group
        .submit(RequestParams::new(data.len() as u64, urls).unwrap())
        .unwrap();
    assert!(handle.stats().missing_source);

    let mut out = Vec::new();
    handle.read_to_end(&mut out).unwrap();
    assert!(out == data);
    assert_eq!(handle.stats().shards[0].bytes_received, 0);
}

#[test]
fn test_watchdog_replaces_hanging_shard() {
    let transport = MemoryTransport::new();
    let data = payload(300_000, 4);
    let urls = transport.publish("hanging", &data);
    transport.set_fault(2, Fault::Hang);

    // a small buffer keeps the healthy shards connected, so shard 5 stays parked
    let mut config = test_config();
    config.engine.max_lines = 64;
    let group = SchedulerGroup::start(&config, Arc::new(transport.clone())).unwrap();

    let mut handle = group
        .submit(RequestParams::new(data.len() as u64, urls).unwrap())
        .unwrap();
    let mut out = Vec::new();
    handle.read_to_end(&mut out).unwrap();
    assert!(out == data);

    assert!(group.metrics().watchdog_switches >= 1);
    let stats = handle.stats();
    assert_eq!(stats.shards[2].errors, 1);
    assert!(stats.shards[5].bytes_received > 0);
    assert!(transport.demotions().contains(&(2, Demotion::Hanging)));
}

#[test]
fn test_two_exhausted_shards_fail_the_request() {
    let transport = MemoryTransport::new();
    let data = payload(100_000, 5);
    let urls = transport.publish("exhausted", &data);
    transport.set_fault(1, Fault::Fail);
    transport.set_fault(4, Fault::Fail);
    let group = start(&transport);

    let handle = group
        .submit(RequestParams::new(data.len() as u64, urls).unwrap())
        .unwrap();

    let mut buf = vec![0u8; 4096];
    let err = loop {
        match handle.read_data(&mut buf) {
            Ok(0) => panic!("request must not complete"),
            Ok(_) => continue,
            Err(e) => break e,
        }
    };
    assert!(matches!(
        err,
        Error::Request(Failure::SourcesExhausted { usable: 4, required: 5 })
    ));

    // terminal: every later read reports the same failure
    assert!(handle.consume(&mut buf).is_err());
    assert_eq!(transport.transfer_failures(), 1);
    assert_eq!(group.metrics().exhausted_sources, 2);

    let mut demoted = transport.demotions();
    demoted.retain(|&(_, reason)| reason == Demotion::Exhausted);
    demoted.sort_by_key(|&(part, _)| part);
    assert_eq!(demoted, vec![(1, Demotion::Exhausted), (4, Demotion::Exhausted)]);
}

#[test]
fn test_transient_failures_and_delays() {
    let transport = MemoryTransport::new();
    let data = payload(80_000, 6);
    let urls = transport.publish("flaky", &data);
    transport.set_fault(1, Fault::FailTimes(2));
    transport.set_fault(0, Fault::Delay(Duration::from_millis(5)));
    let group = start(&transport);

    let mut handle = group
        .submit(RequestParams::new(data.len() as u64, urls).unwrap())
        .unwrap();
    let mut out = Vec::new();
    handle.read_to_end(&mut out).unwrap();

    assert!(out == data);
    assert!(group.metrics().request_errors >= 1);
}

#[test]
fn test_random_ranges() {
    let transport = MemoryTransport::new();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let group = start(&transport);

    for round in 0..12 {
        let len = rng.gen_range(1..40_000);
        let data = payload(len, 100 + round);
        let urls = transport.publish(&format!("range{}", round), &data);

        let from = rng.gen_range(0..len);
        let count = rng.gen_range(0..=len - from);
        let params = RequestParams::new(len as u64, urls)
            .unwrap()
            .with_range(from as u64, count as u64)
            .unwrap();

        let mut handle = group.submit(params).unwrap();
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert!(
            out[..] == data[from..from + count],
            "round {}: {} bytes at {} of {}",
            round,
            count,
            from,
            len
        );
        group.remove(handle);
    }

    assert_eq!(group.active_requests(), 0);
}

#[test]
fn test_file_transport_with_missing_shard() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(77_777, 8);
    let mut urls = Vec::new();
    for (part, shard) in encode(&data).iter().enumerate() {
        let path = dir.path().join(format!("part{}", part));
        std::fs::write(&path, shard).unwrap();
        urls.push(format!("file://{}", path.display()));
    }
    urls[5].clear();
    assert_eq!(urls.len(), RAIDPARTS);

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let transport = FileTransport::new(runtime.handle().clone());
    let group = SchedulerGroup::start(&test_config(), Arc::new(transport)).unwrap();

    let params = RequestParams::new(data.len() as u64, urls)
        .unwrap()
        .with_range(1_000, 50_000)
        .unwrap();
    let mut handle = group.submit(params).unwrap();
    let mut out = Vec::new();
    handle.read_to_end(&mut out).unwrap();

    assert!(out[..] == data[1_000..51_000]);
}
