use criterion::{Criterion, criterion_group, criterion_main, black_box};
use loraforge::config::{ComputeDType, QuantizationConfig};
use loraforge::quantization::{dequantize, quantize_4bit, quantized_matmul};
use loraforge::Tensor;

fn make_tensor(shape: &[usize]) -> Tensor {
    let n: usize = shape.iter().product();
    let data: Vec<f32> = (0..n).map(|i| (i as f32 * 0.013).sin() * 0.1).collect();
    Tensor::from_f32(data, shape).unwrap()
}

fn bench_quantize(c: &mut Criterion) {
    let w = make_tensor(&[1024, 1024]);
    let mut group = c.benchmark_group("quantize_4bit");
    for double_quant in [false, true] {
        let config = QuantizationConfig { double_quant, ..QuantizationConfig::default() };
        group.bench_function(format!("1024x1024_dq={}", double_quant), |b| {
            b.iter(|| quantize_4bit(black_box(&w), &config).unwrap())
        });
    }
    group.finish();
}

fn bench_dequantize(c: &mut Criterion) {
    let q = quantize_4bit(&make_tensor(&[1024, 1024]), &QuantizationConfig::default()).unwrap();
    c.bench_function("dequantize_1024x1024", |b| {
        b.iter(|| dequantize(black_box(&q)).unwrap())
    });
}

fn bench_matmul(c: &mut Criterion) {
    let w = make_tensor(&[4096, 1024]);
    let q = quantize_4bit(&w, &QuantizationConfig::default()).unwrap();
    let mut group = c.benchmark_group("matmul_4096x1024");
    for rows in [1usize, 16] {
        let x = make_tensor(&[1, rows, 1024]);
        group.bench_function(format!("nf4_bf16_rows={}", rows), |b| {
            b.iter(|| quantized_matmul(black_box(&x), &q, ComputeDType::BF16).unwrap())
        });
        group.bench_function(format!("dense_f32_rows={}", rows), |b| {
            b.iter(|| black_box(&x).matmul_transposed(&w).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_quantize, bench_dequantize, bench_matmul);
criterion_main!(benches);
