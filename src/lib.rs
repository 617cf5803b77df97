use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use log::debug;
use thiserror::Error;

mod pool;

pub use pool::{TaskHandle, ThreadPool};

/// Number of concurrent chunks allowed per worker.
///
/// Too few may starve workers (such as due to uneven chunk splits).
/// Too many increases costs, such as storing chunk results in memory before
/// they are written.
pub const INFLIGHT_FACTOR: usize = 3;

pub type ChunkResult = Result<Vec<u8>, PipelineError>;

/// A deferred computation producing the serialized bytes of one chunk.
pub type WorkItem = Box<dyn FnOnce() -> ChunkResult + Send + 'static>;

/// Sequential generator of independent units of work.
///
/// Both methods are called only from the coordinating thread.
/// `next_chunk` must only be called after `has_next` returned true and before
/// any other chunk has been requested; calling it on an exhausted source is a
/// contract violation and panics.
pub trait ChunkSource {
    fn has_next(&mut self) -> bool;
    fn next_chunk(&mut self, options: &WriteOptions) -> WorkItem;
}

#[derive(Debug, Clone)]
pub struct WriteOptions {
    /// Whether the parallel implementation is allowed.
    pub parallel_ok: bool,
    /// Number of worker threads. 0 means `std::thread::available_parallelism()`.
    pub num_threads: usize,
    /// Chunk size hint in records, passed through to the source uninterpreted.
    pub chunk_size: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            parallel_ok: true,
            num_threads: 0,
            chunk_size: 2 << 12,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid options: {0}")]
    InvalidOptions(&'static str),
    #[error("chunk computation failed: {0}")]
    Chunk(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteStats {
    pub chunk_count: usize,
    pub output_bytes: u64,
    pub output_crc32: u32,
    pub threads: usize,
    pub inflight_chunks_max: usize,
    pub writer_yield_events: usize,
    pub total_ms: f64,
}

fn validate_options(options: &WriteOptions) -> Result<(), PipelineError> {
    if options.chunk_size == 0 {
        return Err(PipelineError::InvalidOptions(
            "chunk_size must be greater than 0",
        ));
    }
    Ok(())
}

pub fn resolve_thread_count(num_threads: usize) -> usize {
    if num_threads > 0 {
        return num_threads;
    }
    std::thread::available_parallelism()
        .map(|value| value.get())
        .unwrap_or(1)
        .max(1)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PipelineError> {
    mutex
        .lock()
        .map_err(|_| PipelineError::Internal("mutex poisoned"))
}

pub(crate) fn wait_on_condvar<'a, T>(
    condvar: &Condvar,
    guard: MutexGuard<'a, T>,
) -> Result<MutexGuard<'a, T>, PipelineError> {
    condvar
        .wait(guard)
        .map_err(|_| PipelineError::Internal("mutex poisoned"))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

struct HashingCountWriter<'a, W: Write + ?Sized> {
    inner: &'a mut W,
    hasher: crc32fast::Hasher,
    written: u64,
}

impl<'a, W: Write + ?Sized> HashingCountWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
            written: 0,
        }
    }
}

impl<W: Write + ?Sized> Write for HashingCountWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let written = self.inner.write(buf)?;
        if written > 0 {
            self.hasher.update(&buf[..written]);
            self.written = self
                .written
                .saturating_add(u64::try_from(written).unwrap_or(u64::MAX));
        }
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Write every chunk the source produces to the sink, in generation order.
///
/// Dispatches to the threaded implementation when allowed and more than one
/// worker is available, otherwise to the sequential one.
pub fn write_ordered<S, W>(
    source: &mut S,
    sink: &mut W,
    options: &WriteOptions,
) -> Result<WriteStats, PipelineError>
where
    S: ChunkSource + ?Sized,
    W: Write + ?Sized,
{
    validate_options(options)?;
    let threads = resolve_thread_count(options.num_threads);
    if options.parallel_ok && threads > 1 {
        write_ordered_threads(source, sink, options)
    } else {
        write_ordered_sequential(source, sink, options)
    }
}

/// Threaded pipeline: serial chunk generation and I/O on the calling thread,
/// parallel chunk computation on a worker pool.
///
/// Chunks are created sequentially by the source, computed in parallel, and
/// written in the same order they were created in, regardless of the order
/// workers finish them.
pub fn write_ordered_threads<S, W>(
    source: &mut S,
    sink: &mut W,
    options: &WriteOptions,
) -> Result<WriteStats, PipelineError>
where
    S: ChunkSource + ?Sized,
    W: Write + ?Sized,
{
    validate_options(options)?;
    let total_start = Instant::now();
    let threads = resolve_thread_count(options.num_threads);
    let inflight_limit = INFLIGHT_FACTOR.saturating_mul(threads).max(1);

    let mut stats = WriteStats {
        threads,
        ..WriteStats::default()
    };
    let mut output = HashingCountWriter::new(sink);
    let pool = ThreadPool::new(threads);
    let mut pending: VecDeque<TaskHandle> = VecDeque::with_capacity(inflight_limit);

    debug!("ordered write: {threads} workers, window {inflight_limit}");

    while pending.len() < inflight_limit && source.has_next() {
        let item = source.next_chunk(options);
        pending.push_back(pool.submit(item));
    }
    stats.inflight_chunks_max = pending.len();

    loop {
        let head_ready = match pending.front() {
            Some(handle) => handle.is_ready(),
            None => break,
        };

        if !head_ready {
            // Later handles are irrelevant until the head resolves, so only
            // the head is ever polled. Yield the CPU for it.
            stats.writer_yield_events = stats.writer_yield_events.saturating_add(1);
            std::thread::yield_now();
            continue;
        }

        // Start a replacement before popping so the window stays full as long
        // as the source has work.
        if source.has_next() {
            let item = source.next_chunk(options);
            pending.push_back(pool.submit(item));
        }

        let Some(handle) = pending.pop_front() else {
            break;
        };
        // Sampled after the pop: the resolved head is about to be written and
        // no longer counts against the window.
        stats.inflight_chunks_max = stats.inflight_chunks_max.max(pending.len());
        let bytes = handle.retrieve()?;
        output.write_all(&bytes)?;
        stats.chunk_count = stats.chunk_count.saturating_add(1);
    }

    stats.output_bytes = output.written;
    stats.output_crc32 = output.hasher.finalize();
    stats.total_ms = elapsed_ms(total_start);
    debug!(
        "ordered write done: {} chunks, {} bytes",
        stats.chunk_count, stats.output_bytes
    );
    Ok(stats)
}

/// Zero-concurrency fallback: compute each chunk inline, write immediately.
pub fn write_ordered_sequential<S, W>(
    source: &mut S,
    sink: &mut W,
    options: &WriteOptions,
) -> Result<WriteStats, PipelineError>
where
    S: ChunkSource + ?Sized,
    W: Write + ?Sized,
{
    validate_options(options)?;
    let total_start = Instant::now();
    let mut stats = WriteStats {
        threads: 1,
        ..WriteStats::default()
    };
    let mut output = HashingCountWriter::new(sink);

    while source.has_next() {
        let item = source.next_chunk(options);
        let bytes = item()?;
        output.write_all(&bytes)?;
        stats.chunk_count = stats.chunk_count.saturating_add(1);
        stats.inflight_chunks_max = 1;
    }

    stats.output_bytes = output.written;
    stats.output_crc32 = output.hasher.finalize();
    stats.total_ms = elapsed_ms(total_start);
    Ok(stats)
}

/// Run [`write_ordered`] on a blocking task, for callers inside a Tokio
/// runtime. Returns the sink so owned buffers and files come back out.
pub async fn write_ordered_async<S, W>(
    mut source: S,
    mut sink: W,
    options: WriteOptions,
) -> Result<(W, WriteStats), PipelineError>
where
    S: ChunkSource + Send + 'static,
    W: Write + Send + 'static,
{
    tokio::task::spawn_blocking(move || -> Result<(W, WriteStats), PipelineError> {
        let stats = write_ordered(&mut source, &mut sink, &options)?;
        Ok((sink, stats))
    })
    .await
    .map_err(|_| PipelineError::Internal("blocking pipeline task panicked"))?
}

/// Chunk source over a shared record slice.
///
/// Each work item receives one contiguous range of records and encodes it
/// with the shared encoder; the range length follows `options.chunk_size`.
pub struct RecordSource<T, F> {
    records: Arc<[T]>,
    encode: Arc<F>,
    cursor: usize,
}

impl<T, F> RecordSource<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&[T]) -> ChunkResult + Send + Sync + 'static,
{
    pub fn new(records: impl Into<Arc<[T]>>, encode: F) -> Self {
        Self {
            records: records.into(),
            encode: Arc::new(encode),
            cursor: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<T, F> ChunkSource for RecordSource<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&[T]) -> ChunkResult + Send + Sync + 'static,
{
    fn has_next(&mut self) -> bool {
        self.cursor < self.records.len()
    }

    fn next_chunk(&mut self, options: &WriteOptions) -> WorkItem {
        assert!(
            self.cursor < self.records.len(),
            "next_chunk called on an exhausted source"
        );
        let start = self.cursor;
        let end = start
            .saturating_add(options.chunk_size.max(1))
            .min(self.records.len());
        self.cursor = end;

        let records = Arc::clone(&self.records);
        let encode = Arc::clone(&self.encode);
        Box::new(move || (*encode)(&records[start..end]))
    }
}

/// Adapter for callers that build their own deferred computations.
pub struct TaskSource<I: Iterator<Item = WorkItem>> {
    items: std::iter::Peekable<I>,
}

impl<I: Iterator<Item = WorkItem>> TaskSource<I> {
    pub fn new(items: I) -> Self {
        Self {
            items: items.peekable(),
        }
    }
}

impl<I: Iterator<Item = WorkItem>> ChunkSource for TaskSource<I> {
    fn has_next(&mut self) -> bool {
        self.items.peek().is_some()
    }

    fn next_chunk(&mut self, _options: &WriteOptions) -> WorkItem {
        match self.items.next() {
            Some(item) => item,
            None => panic!("next_chunk called on an exhausted source"),
        }
    }
}

#[cfg(test)]
mod tests;
