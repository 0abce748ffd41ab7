use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use vocalis::analysis::spectrum::SpectrumAnalyzer;

const SAMPLE_RATE: usize = 16_000;

fn one_second_waveform() -> Vec<f32> {
    (0..SAMPLE_RATE)
        .map(|n| {
            let t = n as f32 / SAMPLE_RATE as f32;
            (t * 440.0 * std::f32::consts::TAU).sin() * 0.5
        })
        .collect()
}

fn bench_magnitudes(c: &mut Criterion) {
    let analyzer = SpectrumAnalyzer::new(SAMPLE_RATE);
    let waveform = one_second_waveform();
    c.bench_with_input(
        BenchmarkId::new("magnitudes", SAMPLE_RATE),
        &waveform,
        |b, waveform| {
            b.iter(|| {
                let spectrum = analyzer.magnitudes(black_box(waveform)).expect("transform");
                black_box(spectrum);
            });
        },
    );
}

criterion_group!(benches, bench_magnitudes);
criterion_main!(benches);
