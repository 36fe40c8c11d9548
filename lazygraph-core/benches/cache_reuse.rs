use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lazygraph_core::{creator, ElementType, Var};

const N: i32 = 128;

fn build() -> (Var, Var) {
    let x = creator::input(&[N, N], ElementType::F32).unwrap();
    let w = creator::uniform::<f32>(&[N, N], -1.0, 1.0, 0).unwrap();
    let y = (x.matmul(&w) + creator::scalar(1.0f32).unwrap()).sum(&[1]);
    (x, y)
}

fn bench_content_change(c: &mut Criterion) {
    let (x, y) = build();
    let values = vec![0.5f32; (N * N) as usize];
    x.write_map(&values).unwrap();
    y.read_map::<f32>().unwrap();
    c.bench_function("rerun_after_content_change_128", |bencher| {
        bencher.iter(|| {
            x.write_map(&values).unwrap();
            black_box(y.read_map::<f32>().unwrap())
        });
    });
}

fn bench_shape_change(c: &mut Criterion) {
    let (x, y) = build();
    let values = vec![0.5f32; (N * N) as usize];
    let half = vec![0.5f32; (N * N / 2) as usize];
    c.bench_function("rebuild_after_resize_128", |bencher| {
        let mut tall = true;
        bencher.iter(|| {
            if tall {
                x.resize(&[N, N]).unwrap();
                x.write_map(&values).unwrap();
            } else {
                x.resize(&[N / 2, N]).unwrap();
                x.write_map(&half).unwrap();
            }
            tall = !tall;
            black_box(y.read_map::<f32>().unwrap())
        });
    });
}

criterion_group!(benches, bench_content_change, bench_shape_change);
criterion_main!(benches);
