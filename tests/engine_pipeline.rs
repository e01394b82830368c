use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tagflow::{
    Coincidence, Combiner, Counter, Engine, EngineConfig, Error, GateState, GatedChannel, Measure,
    MeasureCtx, Measurement, NumberingScheme, ReplaySource, SyncGroup, Tag, TagBlock, TagKind,
    TimestampPolicy,
};

fn engine() -> Engine {
    Engine::new(EngineConfig {
        scheme: NumberingScheme::OneBased,
        input_channels: 8,
        ..EngineConfig::default()
    })
}

fn time_tags(events: &[(i64, i32)]) -> Vec<Tag> {
    events.iter().map(|&(t, ch)| Tag::time_tag(t, ch)).collect()
}

/// Collects the timestamps seen on one channel.
struct Recorder {
    channel: i32,
    seen: Arc<Mutex<Vec<i64>>>,
}

impl Measure for Recorder {
    fn on_block(
        &mut self,
        ctx: &mut MeasureCtx<'_>,
        tags: &[Tag],
        _begin: i64,
        _end: i64,
    ) -> tagflow::Result<()> {
        for tag in tags {
            ctx.check_abort()?;
            if tag.kind == TagKind::TimeTag && tag.channel == self.channel {
                self.seen.lock().expect("recorder lock").push(tag.time_ps);
            }
        }
        Ok(())
    }
}

fn recorder(engine: &Engine, channel: i32) -> (Measurement<Recorder>, Arc<Mutex<Vec<i64>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let m = Measurement::new(
        engine,
        Recorder {
            channel,
            seen: Arc::clone(&seen),
        },
        [channel],
    )
    .expect("recorder attaches");
    (m, seen)
}

#[test]
fn test_counter_ring_end_to_end() {
    let engine = engine();
    let input = engine.input();

    let counter = Counter::new(&engine, vec![1, 2], 1_000_000, 4).expect("counter");

    input
        .send_block(
            time_tags(&[(500_000, 1), (500_001, 2), (1_500_000, 1)]),
            0,
            4_000_000,
        )
        .expect("send");
    engine.flush(-1).expect("flush");

    assert_eq!(
        counter.get_data(),
        vec![vec![1, 1, 0, 0], vec![1, 0, 0, 0]],
    );

    let data = counter.get_data_object(false);
    assert_eq!(data.size(), 4);
    assert!(!data.overflow());
    assert_eq!(data.dropped_bins(), 0);
    assert_eq!(data.get_channels(), vec![1, 2]);
    assert_eq!(counter.get_data_total_counts(), vec![2, 1]);
}

#[test]
fn test_counter_data_object_exactly_once() {
    let engine = engine();
    let input = engine.input();
    let counter = Counter::new(&engine, vec![1], 1_000, 16).expect("counter");

    input
        .send_block(time_tags(&[(100, 1), (1_100, 1)]), 0, 2_000)
        .expect("send");
    engine.flush(-1).expect("flush");

    let first = counter.get_data_object(true);
    assert_eq!(first.size(), 2);
    assert_eq!(first.get_data(), vec![vec![1, 1]]);

    input
        .send_block(time_tags(&[(2_100, 1)]), 2_000, 3_000)
        .expect("send");
    engine.flush(-1).expect("flush");

    let second = counter.get_data_object(true);
    assert_eq!(second.size(), 1);
    assert_eq!(second.get_data(), vec![vec![1]]);

    assert_eq!(counter.get_data_object(true).size(), 0);
}

#[test]
fn test_fence_completes_with_producer_block() {
    let engine = engine();
    let input = engine.input();

    // Drive the allocator forward so the reserved fence is not the first.
    for _ in 0..6 {
        engine.get_fence(true);
    }

    let fence = input.reserve_fence();
    assert_eq!(fence, 7);
    assert_eq!(engine.get_fence(false), 7);

    // The producer is stalled: the sentinel has not been delivered.
    assert!(!engine.wait_for_fence(fence, 10));

    input
        .send(TagBlock::heartbeat(0, 1_000).with_fences(vec![fence]))
        .expect("send");
    assert!(engine.wait_for_fence(fence, -1));
}

#[test]
fn test_sync_reflects_prior_configuration() {
    let engine = engine();
    let toggles: Arc<Mutex<Vec<(i32, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let toggles = Arc::clone(&toggles);
        engine.on_channel_toggle(Box::new(move |channel, enabled| {
            toggles.lock().expect("toggle lock").push((channel, enabled));
        }));
    }

    let first = Counter::new(&engine, vec![3], 1_000, 1).expect("counter");
    let second = Counter::new(&engine, vec![3], 1_000, 1).expect("counter");
    assert!(engine.sync(1_000));

    // Dedup-counted: one enable for two users.
    assert_eq!(*toggles.lock().expect("toggle lock"), vec![(3, true)]);

    drop(first);
    assert_eq!(toggles.lock().expect("toggle lock").len(), 1);

    drop(second);
    assert_eq!(
        *toggles.lock().expect("toggle lock"),
        vec![(3, true), (3, false)],
    );
}

#[test]
fn test_combiner_counts_match_inputs() {
    let engine = engine();
    let input = engine.input();

    let combiner = Combiner::new(&engine, vec![1, 2]).expect("combiner");
    let (_rec, seen) = recorder(&engine, combiner.get_channel());

    let blocks = vec![
        TagBlock::new(time_tags(&[(10, 1), (20, 2), (30, 5)]), 0, 1_000),
        TagBlock::new(time_tags(&[(1_010, 2), (1_020, 2)]), 1_000, 2_000),
    ];
    ReplaySource::new(blocks).feed(&input).expect("replay");
    engine.flush(-1).expect("flush");

    assert_eq!(*seen.lock().expect("seen"), vec![10, 20, 1_010, 1_020]);
    assert_eq!(combiner.channel_counts(), vec![1, 3]);
}

#[test]
fn test_gated_channel_scenario() {
    let engine = engine();
    let input = engine.input();

    let gated = GatedChannel::new(&engine, 1, 2, 3, GateState::Closed).expect("gated");
    let (_rec, seen) = recorder(&engine, gated.get_channel());

    input
        .send_block(
            time_tags(&[(100, 1), (200, 2), (300, 1), (400, 3), (500, 1)]),
            0,
            1_000,
        )
        .expect("send");
    engine.flush(-1).expect("flush");

    assert_eq!(*seen.lock().expect("seen"), vec![300]);
}

#[test]
fn test_coincidence_last_scenario() {
    let engine = engine();
    let input = engine.input();

    let coin = Coincidence::new(&engine, vec![1, 2], 1_000, TimestampPolicy::Last)
        .expect("coincidence");
    let (_rec, seen) = recorder(&engine, coin.get_channel());

    input
        .send_block(
            time_tags(&[(100, 1), (900, 2), (1_500, 1), (2_600, 2)]),
            0,
            3_000,
        )
        .expect("send");
    engine.flush(-1).expect("flush");
    assert_eq!(*seen.lock().expect("seen"), vec![900]);

    input
        .send_block(time_tags(&[(3_000, 1), (3_500, 2)]), 3_000, 4_000)
        .expect("send");
    engine.flush(-1).expect("flush");
    assert_eq!(*seen.lock().expect("seen"), vec![900, 3_500]);
}

#[test]
fn test_start_for_bounds_capture_duration() {
    let engine = engine();
    let input = engine.input();

    let counter = Counter::new(&engine, vec![1], 1_000_000, 8).expect("counter");
    counter.start_for(3_000_000, true);

    for k in 0..5i64 {
        let begin = k * 1_000_000;
        input
            .send_block(time_tags(&[(begin + 500_000, 1)]), begin, begin + 1_000_000)
            .expect("send");
    }
    engine.flush(-1).expect("flush");

    assert_eq!(counter.wait_until_finished(1_000).expect("wait"), true);
    assert!(!counter.is_running());
    assert_eq!(counter.capture_duration(), 3_000_000);
    assert_eq!(counter.get_data_total_counts(), vec![3]);
}

#[test]
fn test_abort_in_tight_block_loop() {
    struct Spinner;

    impl Measure for Spinner {
        fn on_block(
            &mut self,
            ctx: &mut MeasureCtx<'_>,
            _tags: &[Tag],
            _begin: i64,
            _end: i64,
        ) -> tagflow::Result<()> {
            let start = Instant::now();
            while start.elapsed() < Duration::from_secs(5) {
                ctx.check_abort()?;
                std::hint::spin_loop();
            }
            Ok(())
        }
    }

    let engine = engine();
    let input = engine.input();

    let m = Measurement::new(&engine, Spinner, [1]).expect("spinner");
    engine.flush(-1).expect("flush");

    input
        .send_block(time_tags(&[(10, 1)]), 0, 1_000)
        .expect("send");

    std::thread::sleep(Duration::from_millis(50));
    m.abort();

    assert_eq!(m.wait_until_finished(1_000).expect("wait"), true);
    assert!(!m.is_running());
}

#[test]
fn test_abort_without_traffic() {
    let engine = engine();

    let counter = Counter::new(&engine, vec![1], 1_000, 1).expect("counter");
    counter.abort();

    assert_eq!(counter.wait_until_finished(1_000).expect("wait"), true);
    assert!(!counter.is_running());

    // Clear returns the measurement to its initial state.
    counter.clear();
    assert_eq!(counter.get_data_total_counts(), vec![0]);
}

#[test]
fn test_measurement_fault_is_isolated() {
    struct Faulty;

    impl Measure for Faulty {
        fn on_block(
            &mut self,
            _ctx: &mut MeasureCtx<'_>,
            _tags: &[Tag],
            _begin: i64,
            _end: i64,
        ) -> tagflow::Result<()> {
            Err(anyhow::anyhow!("bin table corrupted").into())
        }
    }

    let engine = engine();
    let input = engine.input();

    let faulty = Measurement::new(&engine, Faulty, [1]).expect("faulty");
    let counter = Counter::new(&engine, vec![1], 1_000_000, 1).expect("counter");

    input
        .send_block(time_tags(&[(10, 1), (20, 1)]), 0, 1_000)
        .expect("send");
    engine.flush(-1).expect("flush");

    // The fault stops only the raising measurement.
    let err = faulty.wait_until_finished(0).expect_err("fault surfaces");
    assert!(matches!(err, Error::Fault(_)));
    assert!(!faulty.is_running());

    assert!(counter.is_running());
    assert_eq!(counter.get_data_total_counts(), vec![2]);

    // Fence processing continues after the fault.
    assert!(engine.sync(1_000));
}

#[test]
fn test_sync_group_same_prefix() {
    let engine = engine();
    let input = engine.input();

    let group = SyncGroup::new(&engine);
    let c1 = Counter::new(group.tagger(), vec![1], 1_000_000_000, 1).expect("c1");
    let c2 = Counter::new(group.tagger(), vec![1], 1_000_000_000, 1).expect("c2");

    // Measurements built against the proxy do not start automatically.
    assert!(!c1.is_running());
    assert!(!group.is_running());

    input
        .send_block(time_tags(&[(10, 1)]), 0, 1_000)
        .expect("send");

    group.start();

    input
        .send_block(time_tags(&[(1_010, 1), (1_020, 1)]), 1_000, 2_000)
        .expect("send");
    engine.flush(-1).expect("flush");
    assert!(group.is_running());

    group.stop();

    input
        .send_block(time_tags(&[(2_010, 1)]), 2_000, 3_000)
        .expect("send");
    engine.flush(-1).expect("flush");

    // Both children saw exactly the blocks between start and stop.
    assert_eq!(c1.get_data_total_counts(), vec![2]);
    assert_eq!(c2.get_data_total_counts(), vec![2]);
    assert!(!group.is_running());
    assert_eq!(group.wait_until_finished(0).expect("wait"), true);
}

#[test]
fn test_sync_group_start_for() {
    let engine = engine();
    let input = engine.input();

    let group = SyncGroup::new(&engine);
    let c1 = Counter::new(group.tagger(), vec![1], 1_000_000, 8).expect("c1");
    let c2 = Counter::new(group.tagger(), vec![2], 1_000_000, 8).expect("c2");

    group.start_for(2_000_000, true);

    for k in 0..4i64 {
        let begin = k * 1_000_000;
        input
            .send_block(
                time_tags(&[(begin + 100, 1), (begin + 200, 2)]),
                begin,
                begin + 1_000_000,
            )
            .expect("send");
    }
    engine.flush(-1).expect("flush");

    assert_eq!(group.wait_until_finished(1_000).expect("wait"), true);
    assert_eq!(c1.capture_duration(), 2_000_000);
    assert_eq!(c2.capture_duration(), 2_000_000);
    assert_eq!(c1.get_data_total_counts(), vec![2]);
    assert_eq!(c2.get_data_total_counts(), vec![2]);
}

#[test]
fn test_delayed_channel_feeds_downstream_counter() {
    let engine = engine();
    let input = engine.input();

    let delayed = tagflow::DelayedChannel::new(&engine, 1, 250).expect("delayed");
    let (_rec, seen) = recorder(&engine, delayed.get_channel());

    input
        .send_block(time_tags(&[(100, 1), (900, 1)]), 0, 1_000)
        .expect("send");
    engine.flush(-1).expect("flush");

    // 100 + 250 emits in-block; 900 + 250 carries into the next block.
    assert_eq!(*seen.lock().expect("seen"), vec![350]);

    input.heartbeat(1_000, 2_000).expect("send");
    engine.flush(-1).expect("flush");
    assert_eq!(*seen.lock().expect("seen"), vec![350, 1_150]);
}

#[test]
fn test_invalid_channel_is_rejected() {
    let engine = engine();

    let err = Counter::new(&engine, vec![99], 1_000, 1).expect_err("out of scheme");
    assert!(matches!(err, Error::InvalidChannel(99)));

    let err = Counter::new(&engine, vec![0], 1_000, 1).expect_err("one-based has no zero");
    assert!(matches!(err, Error::InvalidChannel(0)));
}

#[test]
fn test_inverted_channel_mapping() {
    let engine = engine();
    assert_eq!(engine.inverted_channel(5).expect("physical"), -5);

    let combiner = Combiner::new(&engine, vec![1]).expect("combiner");
    let inverted = engine
        .inverted_channel(combiner.get_channel())
        .expect("virtual channels map to unused");
    assert!(engine.is_unused_channel(inverted));
}

#[test]
fn test_shutdown_rejects_input() {
    let engine = engine();
    let input = engine.input();

    engine.shutdown();

    let err = input.heartbeat(0, 1_000).expect_err("stream closed");
    assert!(matches!(err, Error::Shutdown));
}

#[test]
fn test_stats_snapshot_counts_stream() {
    let engine = engine();
    let input = engine.input();
    let _counter = Counter::new(&engine, vec![1], 1_000, 1).expect("counter");

    input
        .send_block(time_tags(&[(10, 1), (20, 1), (30, 2)]), 0, 1_000)
        .expect("send");
    engine.flush(-1).expect("flush");

    let stats = engine.stats();
    assert_eq!(stats.blocks, 1);
    assert_eq!(stats.total_time_tags(), 3);
    assert!(stats.fences_completed >= 1);
    assert_eq!(stats.tags_by_channel, vec![(1, 2), (2, 1)]);
}
