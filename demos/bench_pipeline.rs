use std::env;
use std::io::Write;
use std::time::Instant;

use ordpipe::{
    write_ordered_sequential, write_ordered_threads, PipelineError, RecordSource, WriteOptions,
};

#[derive(Debug, Clone)]
struct BenchConfig {
    size_mib: usize,
    threads: usize,
    chunk_kib: usize,
    level: u32,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            size_mib: 256,
            threads: 0,
            chunk_kib: 1024,
            level: 6,
        }
    }
}

impl BenchConfig {
    fn from_args() -> Result<Self, String> {
        let mut cfg = Self::default();
        let mut args = env::args().skip(1);

        while let Some(arg) = args.next() {
            if arg == "--help" || arg == "-h" {
                return Err(help_text());
            }
            let value = args
                .next()
                .ok_or_else(|| format!("missing value for {arg}\n{}", help_text()))?;
            match arg.as_str() {
                "--size-mib" => cfg.size_mib = parse(&arg, &value)?,
                "--threads" => cfg.threads = parse(&arg, &value)?,
                "--chunk-kib" => cfg.chunk_kib = parse(&arg, &value)?,
                "--level" => cfg.level = parse(&arg, &value)?,
                _ => return Err(format!("unknown argument {arg}\n{}", help_text())),
            }
        }

        if cfg.size_mib == 0 || cfg.chunk_kib == 0 {
            return Err("size and chunk must be greater than 0".to_string());
        }
        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(arg: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid value {value} for {arg}"))
}

fn help_text() -> String {
    "usage: bench_pipeline [--size-mib N] [--threads N] [--chunk-kib N] [--level N]".to_string()
}

fn build_mixed_dataset(bytes: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes);
    let mut state: u32 = 0x1234_5678;

    while out.len() < bytes {
        let zone = (out.len() / 4096) % 3;
        match zone {
            0 => out.extend_from_slice(b"ordpipe-ordered-output-"),
            1 => out.extend_from_slice(b"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"),
            _ => {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                out.push((state >> 24) as u8);
            }
        }
    }

    out.truncate(bytes);
    out
}

fn deflate_chunk(chunk: &[u8], level: u32) -> Result<Vec<u8>, PipelineError> {
    let mut encoder = flate2::write::DeflateEncoder::new(
        Vec::new(),
        flate2::Compression::new(level.clamp(0, 9)),
    );
    encoder.write_all(chunk)?;
    Ok(encoder.finish()?)
}

fn main() {
    let cfg = match BenchConfig::from_args() {
        Ok(cfg) => cfg,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let input = build_mixed_dataset(cfg.size_mib * 1024 * 1024);
    let level = cfg.level;
    let options = WriteOptions {
        num_threads: cfg.threads,
        chunk_size: cfg.chunk_kib * 1024,
        ..WriteOptions::default()
    };

    println!(
        "bench_pipeline: input={} MiB chunk={} KiB threads={} level={}",
        cfg.size_mib,
        cfg.chunk_kib,
        if cfg.threads == 0 {
            "auto".to_string()
        } else {
            cfg.threads.to_string()
        },
        level,
    );

    let serial_start = Instant::now();
    let mut serial_sink = Vec::new();
    let serial_stats = write_ordered_sequential(
        &mut RecordSource::new(input.clone(), move |chunk: &[u8]| {
            deflate_chunk(chunk, level)
        }),
        &mut serial_sink,
        &options,
    )
    .expect("sequential bench run failed");
    let serial_secs = serial_start.elapsed().as_secs_f64();

    let threaded_start = Instant::now();
    let mut threaded_sink = Vec::new();
    let threaded_stats = write_ordered_threads(
        &mut RecordSource::new(input.clone(), move |chunk: &[u8]| {
            deflate_chunk(chunk, level)
        }),
        &mut threaded_sink,
        &options,
    )
    .expect("threaded bench run failed");
    let threaded_secs = threaded_start.elapsed().as_secs_f64();

    let mib = input.len() as f64 / (1024.0 * 1024.0);
    println!(
        "[SEQUENTIAL] {:.3}s {:.1} MiB/s chunks={} out_bytes={} crc32={:08x}",
        serial_secs,
        mib / serial_secs,
        serial_stats.chunk_count,
        serial_stats.output_bytes,
        serial_stats.output_crc32,
    );
    println!(
        "[THREADED  ] {:.3}s {:.1} MiB/s chunks={} out_bytes={} crc32={:08x} threads={} inflight_max={} yields={}",
        threaded_secs,
        mib / threaded_secs,
        threaded_stats.chunk_count,
        threaded_stats.output_bytes,
        threaded_stats.output_crc32,
        threaded_stats.threads,
        threaded_stats.inflight_chunks_max,
        threaded_stats.writer_yield_events,
    );

    assert_eq!(serial_sink, threaded_sink);
    println!(
        "outputs identical ({} bytes); speedup {:.2}x",
        serial_sink.len(),
        serial_secs / threaded_secs
    );
}
