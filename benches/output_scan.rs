//! Benchmarks for ffmpeg output interpretation
//!
//! Measures the incremental scanners over realistic stdout/stderr text, fed
//! chunk by chunk the way a running process delivers it.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fp_av::{extract_error, CodecBannerScanner, ProgressScanner};

const BANNER: &str = "\
ffmpeg version 6.1 Copyright (c) 2000-2023 the FFmpeg developers
  built with gcc 13.2.0
  configuration: --enable-gpl --enable-libx264 --enable-libx265
Input #0, matroska,webm, from 'movie.mkv':
  Metadata:
    title           : Movie
  Duration: 02:00:00.00, start: 0.000000, bitrate: 15000 kb/s
  Stream #0:0(eng): Video: hevc (Main 10), yuv420p10le(tv, bt2020nc/bt2020/smpte2084), 3840x2160, 23.98 fps
  Stream #0:1(eng): Audio: truehd, 48000 Hz, 7.1, s32 (24 bit) (default)
  Stream #0:2(eng): Subtitle: hdmv_pgs_subtitle, 1920x1080
Stream mapping:
  Stream #0:0 -> #0:0 (hevc (native) -> h264 (libx264))
Output #0, mp4, to 'out.mp4':
";

/// `-progress` output with `blocks` reports.
fn progress_text(blocks: usize) -> String {
    let mut text = String::new();
    for i in 1..=blocks {
        text.push_str(&format!(
            "frame={}\nfps=48.00\nbitrate=4000.0kbits/s\ntotal_size={}\nout_time=00:{:02}:{:02}.000000\nspeed=2.0x\nprogress=continue\n",
            i * 24,
            i * 500_000,
            (i / 60) % 60,
            i % 60
        ));
    }
    text
}

/// Classic stats lines separated by carriage returns.
fn stats_text(lines: usize) -> String {
    (1..=lines)
        .map(|i| {
            format!(
                "frame={i:5} fps= 48 q=28.0 size= {}kB time=00:{:02}:{:02}.00 bitrate=4000.0kbits/s speed=2.0x\r",
                i * 500,
                (i / 60) % 60,
                i % 60
            )
        })
        .collect()
}

/// Feed `text` to `scan` in 4 KiB chunks, passing the growing buffer.
fn feed<F: FnMut(&str)>(text: &str, mut scan: F) {
    let mut end = 0;
    while end < text.len() {
        end = (end + 4096).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        scan(&text[..end]);
    }
}

fn bench_progress(c: &mut Criterion) {
    let mut group = c.benchmark_group("progress_scan");

    for blocks in [100, 1_000] {
        let text = progress_text(blocks);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("progress_blocks", blocks), &text, |b, text| {
            b.iter(|| {
                let mut scanner = ProgressScanner::new(Some(7200.0));
                let mut reports = 0;
                feed(text, |buf| reports += scanner.scan(buf).len());
                black_box(reports)
            })
        });

        let text = stats_text(blocks);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::new("stats_lines", blocks), &text, |b, text| {
            b.iter(|| {
                let mut scanner = ProgressScanner::new(Some(7200.0));
                let mut reports = 0;
                feed(text, |buf| reports += scanner.scan(buf).len());
                black_box(reports)
            })
        });
    }

    group.finish();
}

fn bench_banner(c: &mut Criterion) {
    let text = format!("{BANNER}{}", stats_text(200));

    c.bench_function("codec_banner_scan", |b| {
        b.iter(|| {
            let mut scanner = CodecBannerScanner::new();
            let mut found = None;
            feed(&text, |buf| {
                if let Some(data) = scanner.scan(buf) {
                    found = Some(data);
                }
            });
            black_box(found)
        })
    });
}

fn bench_extract_error(c: &mut Criterion) {
    let stderr = format!(
        "{BANNER}{}[libx264 @ 0x55d0c2a4] broken ffmpeg default settings detected\n\
Error initializing output stream 0:0 -- Error while opening encoder\n\
Conversion failed!\n",
        stats_text(500)
    );

    c.bench_function("extract_error", |b| {
        b.iter(|| black_box(extract_error(black_box(&stderr))))
    });
}

criterion_group!(benches, bench_progress, bench_banner, bench_extract_error);
criterion_main!(benches);
