//! Benchmarks for cron parsing, next-fire search and asset resolution.
use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use runforge_core::backends::{resolve_asset, BackendId, Platform, ReleaseAsset};
use runforge_core::jobs::CronSchedule;

const EXPRESSIONS: [(&str, &str); 5] = [
    ("every_minute", "* * * * *"),
    ("every_five", "*/5 * * * *"),
    ("business_hours", "0 9-17 * * mon-fri"),
    ("monthly", "30 2 1 * *"),
    ("leap_day", "0 0 29 2 *"),
];

fn bench_cron_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("cron_parse");
    for (label, expr) in EXPRESSIONS {
        group.bench_with_input(BenchmarkId::from_parameter(label), expr, |b, e| {
            b.iter(|| black_box(CronSchedule::parse(e).ok()));
        });
    }
    group.finish();
}

fn bench_cron_next_after(c: &mut Criterion) {
    let mut group = c.benchmark_group("cron_next_after");
    let from = Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap();
    for (label, expr) in EXPRESSIONS {
        let schedule = CronSchedule::parse(expr).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(label), &schedule, |b, s| {
            b.iter(|| black_box(s.next_after(from)));
        });
    }
    group.finish();
}

fn bench_cron_fire_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("cron_fire_sequence");
    let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    for n in [12usize, 288] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let mut at = start;
                for _ in 0..n {
                    match schedule.next_after(at) {
                        Some(next) => at = next,
                        None => break,
                    }
                }
                black_box(at)
            });
        });
    }
    group.finish();
}

fn release_assets(tag: &str) -> Vec<ReleaseAsset> {
    let mut names = Vec::new();
    for os in ["win", "ubuntu", "macos"] {
        for backend in ["cpu", "vulkan", "cuda-11.7", "cuda-12.4", "hip-radeon", "sycl"] {
            for arch in ["x64", "arm64"] {
                names.push(format!("llama-{}-bin-{}-{}-{}.zip", tag, os, backend, arch));
            }
        }
    }
    names
        .into_iter()
        .map(|name| ReleaseAsset {
            browser_download_url: format!("https://example.invalid/{}", name),
            name,
            size: 0,
            digest: None,
        })
        .collect()
}

fn bench_resolve_asset(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_asset");
    let assets = release_assets("b4567");
    let windows = Platform::new("windows", "x86_64");
    let linux = Platform::new("linux", "x86_64");
    for (label, backend, platform) in [
        ("win_vulkan", BackendId::Vulkan, &windows),
        ("win_cpu", BackendId::Cpu, &windows),
        ("linux_vulkan_fallback", BackendId::Vulkan, &linux),
    ] {
        group.bench_function(label, |b| {
            b.iter(|| black_box(resolve_asset(&assets, "b4567", backend, platform, None).ok()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_cron_parse,
    bench_cron_next_after,
    bench_cron_fire_sequence,
    bench_resolve_asset
);
criterion_main!(benches);
