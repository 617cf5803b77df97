use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::*;

fn options_with_threads(num_threads: usize) -> WriteOptions {
    WriteOptions {
        num_threads,
        ..WriteOptions::default()
    }
}

fn lettered_items(letters: &[&'static str], delay_for: fn(usize) -> u64) -> Vec<WorkItem> {
    letters
        .iter()
        .enumerate()
        .map(|(index, letter)| {
            let letter: &'static str = letter;
            let delay = Duration::from_millis(delay_for(index));
            Box::new(move || {
                std::thread::sleep(delay);
                Ok(letter.as_bytes().to_vec())
            }) as WorkItem
        })
        .collect()
}

#[test]
fn reversed_completion_order_still_writes_in_submission_order() {
    // Later chunks finish first; the sink must still see submission order.
    let items = lettered_items(&["A", "B", "C", "D", "E"], |index| (5 - index as u64) * 15);
    let mut source = TaskSource::new(items.into_iter());
    let mut sink = Vec::new();

    let stats = write_ordered_threads(&mut source, &mut sink, &options_with_threads(2))
        .expect("threaded write should succeed");

    assert_eq!(sink, b"ABCDE");
    assert_eq!(stats.chunk_count, 5);
    assert_eq!(stats.output_bytes, 5);
    assert_eq!(stats.threads, 2);
    assert!(stats.inflight_chunks_max <= 2 * INFLIGHT_FACTOR);
}

#[test]
fn empty_source_writes_nothing() {
    let mut source = TaskSource::new(Vec::new().into_iter());
    let mut sink = Vec::new();

    let stats = write_ordered_threads(&mut source, &mut sink, &options_with_threads(2))
        .expect("empty write should succeed");

    assert!(sink.is_empty());
    assert_eq!(stats.chunk_count, 0);
    assert_eq!(stats.output_bytes, 0);
    assert_eq!(stats.inflight_chunks_max, 0);
}

#[test]
fn single_worker_output_is_ordered() {
    let items = lettered_items(&["A", "B", "C", "D"], |index| (index as u64 * 7) % 11);
    let mut source = TaskSource::new(items.into_iter());
    let mut sink = Vec::new();

    let stats = write_ordered_threads(&mut source, &mut sink, &options_with_threads(1))
        .expect("single worker write should succeed");

    assert_eq!(sink, b"ABCD");
    assert_eq!(stats.threads, 1);
    assert!(stats.inflight_chunks_max <= INFLIGHT_FACTOR);
}

#[test]
fn inflight_window_stays_bounded() {
    let items: Vec<WorkItem> = (0..64_usize)
        .map(|index| {
            Box::new(move || {
                std::thread::sleep(Duration::from_millis(1));
                Ok(vec![index as u8])
            }) as WorkItem
        })
        .collect();
    let mut source = TaskSource::new(items.into_iter());
    let mut sink = Vec::new();

    let stats = write_ordered_threads(&mut source, &mut sink, &options_with_threads(2))
        .expect("threaded write should succeed");

    let expected: Vec<u8> = (0..64).map(|index| index as u8).collect();
    assert_eq!(sink, expected);
    // Priming fills the window exactly; refill churn must never record past
    // it, even though each replacement is submitted before the head is popped.
    assert_eq!(stats.inflight_chunks_max, 2 * INFLIGHT_FACTOR);
}

#[test]
fn chunk_failure_aborts_after_earlier_chunks_are_written() {
    let items: Vec<WorkItem> = vec![
        Box::new(|| Ok(b"A".to_vec())),
        Box::new(|| Ok(b"B".to_vec())),
        Box::new(|| Err(PipelineError::Chunk("encode failed".to_string()))),
        Box::new(|| Ok(b"D".to_vec())),
        Box::new(|| Ok(b"E".to_vec())),
    ];
    let mut source = TaskSource::new(items.into_iter());
    let mut sink = Vec::new();

    let error = write_ordered_threads(&mut source, &mut sink, &options_with_threads(2))
        .expect_err("failing chunk should abort the pipeline");

    assert!(matches!(error, PipelineError::Chunk(_)));
    assert_eq!(sink, b"AB");
}

#[test]
fn panicking_work_item_surfaces_as_chunk_failure() {
    let items: Vec<WorkItem> = vec![
        Box::new(|| Ok(b"A".to_vec())),
        Box::new(|| panic!("boom")),
        Box::new(|| Ok(b"C".to_vec())),
    ];
    let mut source = TaskSource::new(items.into_iter());
    let mut sink = Vec::new();

    let error = write_ordered_threads(&mut source, &mut sink, &options_with_threads(2))
        .expect_err("panicking chunk should abort the pipeline");

    match error {
        PipelineError::Chunk(message) => assert!(message.contains("panicked")),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(sink, b"A");
}

#[test]
fn record_source_partitions_in_submission_order() {
    let records: Vec<u32> = (0..100).collect();
    let mut source = RecordSource::new(records, |chunk: &[u32]| {
        let mut out = Vec::new();
        for value in chunk {
            out.extend_from_slice(format!("{value};").as_bytes());
        }
        Ok(out)
    });
    assert_eq!(source.len(), 100);
    assert!(!source.is_empty());

    let mut sink = Vec::new();
    let options = WriteOptions {
        num_threads: 3,
        chunk_size: 7,
        ..WriteOptions::default()
    };

    let stats =
        write_ordered(&mut source, &mut sink, &options).expect("record write should succeed");

    let expected: String = (0..100).map(|value| format!("{value};")).collect();
    assert_eq!(sink, expected.as_bytes());
    assert_eq!(stats.chunk_count, 100_usize.div_ceil(7));
}

#[test]
fn sequential_and_threaded_outputs_match() {
    let records: Vec<u16> = (0..500).map(|value| value * 3 % 257).collect();
    let encode = |chunk: &[u16]| {
        let mut out = Vec::new();
        for value in chunk {
            out.extend_from_slice(&value.to_le_bytes());
        }
        Ok(out)
    };
    let options = WriteOptions {
        num_threads: 4,
        chunk_size: 19,
        ..WriteOptions::default()
    };

    let mut serial_sink = Vec::new();
    let serial_stats = write_ordered_sequential(
        &mut RecordSource::new(records.clone(), encode),
        &mut serial_sink,
        &options,
    )
    .expect("sequential write should succeed");

    let mut threaded_sink = Vec::new();
    let threaded_stats = write_ordered_threads(
        &mut RecordSource::new(records, encode),
        &mut threaded_sink,
        &options,
    )
    .expect("threaded write should succeed");

    assert_eq!(serial_sink, threaded_sink);
    assert_eq!(serial_stats.output_crc32, threaded_stats.output_crc32);
    assert_eq!(serial_stats.chunk_count, threaded_stats.chunk_count);
    assert_eq!(serial_stats.writer_yield_events, 0);
}

#[test]
fn parallel_not_ok_falls_back_to_sequential() {
    let records: Vec<u8> = (0..32).collect();
    let mut source = RecordSource::new(records, |chunk: &[u8]| Ok(chunk.to_vec()));
    let mut sink = Vec::new();
    let options = WriteOptions {
        parallel_ok: false,
        num_threads: 8,
        chunk_size: 5,
        ..WriteOptions::default()
    };

    let stats =
        write_ordered(&mut source, &mut sink, &options).expect("fallback write should succeed");

    let expected: Vec<u8> = (0..32).collect();
    assert_eq!(sink, expected);
    assert_eq!(stats.threads, 1);
    assert!(stats.inflight_chunks_max <= 1);
}

#[test]
fn zero_chunk_size_is_rejected() {
    let mut source = TaskSource::new(Vec::new().into_iter());
    let mut sink = Vec::new();
    let options = WriteOptions {
        chunk_size: 0,
        ..WriteOptions::default()
    };

    let error = write_ordered(&mut source, &mut sink, &options)
        .expect_err("zero chunk_size should be rejected");
    assert!(matches!(error, PipelineError::InvalidOptions(_)));
}

#[test]
fn zero_threads_resolves_to_available_parallelism() {
    assert!(resolve_thread_count(0) >= 1);
    assert_eq!(resolve_thread_count(5), 5);

    let items = lettered_items(&["A", "B", "C"], |_| 0);
    let mut source = TaskSource::new(items.into_iter());
    let mut sink = Vec::new();

    let stats = write_ordered_threads(&mut source, &mut sink, &options_with_threads(0))
        .expect("default thread count should work");
    assert_eq!(sink, b"ABC");
    assert!(stats.threads >= 1);
}

#[test]
#[should_panic(expected = "exhausted source")]
fn next_chunk_past_exhaustion_panics() {
    let mut source = TaskSource::new(Vec::new().into_iter());
    let _ = source.next_chunk(&WriteOptions::default());
}

#[test]
fn retrieve_before_readiness_blocks_until_done() {
    let pool = ThreadPool::new(1);
    let handle = pool.submit(Box::new(|| {
        std::thread::sleep(Duration::from_millis(20));
        Ok(b"late".to_vec())
    }));

    let bytes = handle.retrieve().expect("retrieve should succeed");
    assert_eq!(bytes, b"late");
}

#[test]
fn pool_shutdown_resolves_abandoned_tasks() {
    let pool = ThreadPool::new(1);
    assert_eq!(pool.thread_count(), 1);

    let started = Arc::new(AtomicBool::new(false));
    let started_flag = Arc::clone(&started);
    let running = pool.submit(Box::new(move || {
        started_flag.store(true, Ordering::Release);
        std::thread::sleep(Duration::from_millis(50));
        Ok(b"ran".to_vec())
    }));
    while !started.load(Ordering::Acquire) {
        std::thread::yield_now();
    }

    let queued = pool.submit(Box::new(|| Ok(b"never".to_vec())));
    drop(pool);

    let bytes = running.retrieve().expect("running task should finish");
    assert_eq!(bytes, b"ran");

    let error = queued
        .retrieve()
        .expect_err("queued task should be abandoned on shutdown");
    assert!(matches!(error, PipelineError::Internal(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_wrapper_round_trips_sink_and_stats() {
    let records: Vec<u8> = (0..64).collect();
    let source = RecordSource::new(records, |chunk: &[u8]| Ok(chunk.to_vec()));
    let options = WriteOptions {
        num_threads: 2,
        chunk_size: 9,
        ..WriteOptions::default()
    };

    let (sink, stats) = write_ordered_async(source, Vec::new(), options)
        .await
        .expect("async write should succeed");

    let expected: Vec<u8> = (0..64).collect();
    assert_eq!(sink, expected);
    assert_eq!(stats.output_bytes, 64);
}
