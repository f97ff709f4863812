use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{Array1, Array4};
use neural_style as ns;
use ns::layers::{Conv2d, Layer};
use std::time::{Duration, Instant};

fn conv(out_channels: usize, in_channels: usize) -> Layer {
    let weight = Array4::from_shape_fn((out_channels, in_channels, 3, 3), |(o, i, y, x)| {
        ((o * 31 + i * 7 + y * 3 + x) as f32 * 0.37).sin() * 0.1
    });
    Layer::Conv2d(Conv2d::new(weight, Array1::zeros(out_channels), 1, 1).unwrap())
}

// the first two blocks of VGG, with fewer channels
fn backbone() -> ns::Backbone {
    ns::Backbone::new(vec![
        conv(16, 3),
        Layer::Relu { inplace: true },
        conv(16, 16),
        Layer::Relu { inplace: true },
        Layer::max_pool(),
        conv(32, 16),
        Layer::Relu { inplace: true },
        conv(32, 32),
        Layer::Relu { inplace: true },
        Layer::max_pool(),
    ])
}

fn image(dim: usize, phase: f32) -> ns::Tensor {
    ns::Tensor::from_shape_fn((1, 3, dim, dim), |(_, c, y, x)| {
        0.5 + 0.5 * ((x * 3 + y * 5 + c) as f32 * 0.1 + phase).sin()
    })
}

fn gram_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("gram_matrix");

    for dim in [32, 64, 128].iter() {
        let activation = ns::Tensor::from_shape_fn((1, 64, *dim, *dim), |(_, c, y, x)| {
            ((c * 13 + y * 7 + x) as f32 * 0.01).cos()
        });

        group.bench_with_input(BenchmarkId::from_parameter(dim), &activation, |b, a| {
            b.iter(|| black_box(ns::tensor::gram_matrix(a)));
        });
    }
    group.finish();
}

fn pipeline(c: &mut Criterion) {
    static DIM: usize = 32;

    let mut group = c.benchmark_group("pipeline");
    group.sample_size(10);

    let ctx = ns::ExecutionContext::default();
    let backbone = backbone();

    for dim in [DIM, 2 * DIM, 4 * DIM].iter() {
        let content = image(*dim, 0.0);
        let style = image(*dim, 1.0);

        let mut pipeline = ns::model::assemble(
            &backbone,
            &ns::Normalization::imagenet(),
            &style,
            &content,
            &["conv_4"],
            &["conv_1", "conv_2", "conv_3", "conv_4"],
            &ctx,
        )
        .unwrap();

        let input = image(*dim, 2.0);

        group.bench_with_input(BenchmarkId::new("forward_backward", dim), dim, |b, _| {
            b.iter(|| {
                pipeline.forward(&input).unwrap();
                black_box(pipeline.backward(1e6, 1.0).unwrap())
            });
        });
    }
    group.finish();
}

fn session(c: &mut Criterion) {
    static DIM: u32 = 32;

    // Build the images once to reduce variation between runs,
    // though we still do a memcpy each run
    let content = ns::image::DynamicImage::ImageRgb8(ns::tensor_to_rgb(&image(128, 0.0)));
    let style = ns::image::DynamicImage::ImageRgb8(ns::tensor_to_rgb(&image(128, 1.5)));

    let mut group = c.benchmark_group("session");
    group.sample_size(10);

    for dim in [DIM, 2 * DIM].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dim), dim, |b, &dim| {
            b.iter_custom(|iters| {
                let mut total_elapsed = Duration::new(0, 0);
                for _i in 0..iters {
                    let sess = ns::Session::builder()
                        .content(content.clone())
                        .style(style.clone())
                        .backbone(backbone())
                        .content_layers(vec!["conv_4"])
                        .style_layers(vec!["conv_1", "conv_2", "conv_3", "conv_4"])
                        .image_size(dim)
                        .num_steps(20)
                        .build()
                        .unwrap();

                    let start = Instant::now();
                    black_box(sess.run(None).unwrap());
                    total_elapsed += start.elapsed();
                }

                total_elapsed
            });
        });
    }
    group.finish();
}

criterion_group!(benches, gram_matrix, pipeline, session);
criterion_main!(benches);
