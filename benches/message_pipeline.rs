use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rs_mcp::content::normalize_result;
use rs_mcp::framing::{is_protocol_frame, FrameReader};
use serde_json::json;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Benchmark line classification on the kinds of lines servers actually emit
fn bench_frame_classification(c: &mut Criterion) {
    let lines = [
        "Secure MCP Filesystem Server running on stdio",
        "warning: experimental feature enabled",
        "",
        "   {\"jsonrpc\":\"2.0\",\"id\":42,\"result\":{\"tools\":[]}}",
        "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}",
        "{\"not\":\"a frame\"}",
    ];

    c.bench_function("frame_classification", |b| {
        b.iter(|| {
            let mut hits = 0usize;
            for line in lines.iter() {
                if is_protocol_frame(black_box(line)) {
                    hits += 1;
                }
            }
            black_box(hits)
        });
    });
}

/// Benchmark startup filtering with different amounts of banner noise
fn bench_startup_filtering(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("startup_filtering");

    for banner_lines in [0usize, 10, 100].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(banner_lines),
            banner_lines,
            |b, &count| {
                let mut data = String::new();
                for i in 0..count {
                    data.push_str(&format!("starting subsystem {i}...\n"));
                }
                data.push_str("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n");

                b.to_async(&rt).iter(|| async {
                    let mut reader =
                        FrameReader::new(black_box(data.as_bytes()), Duration::from_secs(5));
                    black_box(reader.read_frame().await.unwrap())
                });
            },
        );
    }

    group.finish();
}

/// Benchmark result shaping across representative tool outputs
fn bench_result_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_normalization");

    let small = json!({"content": [{"type": "text", "text": "done"}]});
    let many_items = json!({
        "content": (0..50)
            .map(|i| json!({"type": "text", "text": format!("item {i}")}))
            .collect::<Vec<_>>()
    });
    let oversized = json!({"content": [{"type": "text", "text": "x".repeat(40_000)}]});
    let image_heavy = json!({
        "content": [{"type": "image", "data": "A".repeat(8_000), "mimeType": "image/png"}]
    });

    for (label, payload) in [
        ("small_text", &small),
        ("fifty_items", &many_items),
        ("oversized_text", &oversized),
        ("inline_image", &image_heavy),
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(label),
            payload,
            |b, payload| {
                b.iter(|| black_box(normalize_result(black_box(payload))));
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_frame_classification,
    bench_startup_filtering,
    bench_result_normalization,
);
criterion_main!(benches);
