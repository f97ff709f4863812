use ndarray::{Array1, Array4};
use neural_style as ns;
use ns::layers::{Conv2d, Layer};
use std::sync::{Arc, Mutex};

const SIZE: u32 = 16;

fn conv(out_channels: usize, in_channels: usize, seed: f32) -> Layer {
    let weight = Array4::from_shape_fn((out_channels, in_channels, 3, 3), |(o, i, y, x)| {
        ((o * 31 + i * 7 + y * 3 + x) as f32 * 0.61 + seed).sin() * 0.25
    });
    let bias = Array1::from_shape_fn(out_channels, |o| (o as f32 * 0.3 + seed).cos() * 0.05);
    Layer::Conv2d(Conv2d::new(weight, bias, 1, 1).unwrap())
}

// a miniature VGG: conv_1 relu_1 conv_2 relu_2 pool_2 conv_3 relu_3 pool_3
fn backbone() -> ns::Backbone {
    ns::Backbone::new(vec![
        conv(4, 3, 0.0),
        Layer::Relu { inplace: true },
        conv(4, 4, 1.0),
        Layer::Relu { inplace: true },
        Layer::max_pool(),
        conv(6, 4, 2.0),
        Layer::Relu { inplace: true },
        Layer::max_pool(),
    ])
}

fn gradient_image(seed: u32) -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(SIZE, SIZE, |x, y| {
        ns::image::Rgb([
            ((x * 16 + seed * 40) % 256) as u8,
            ((y * 16 + seed * 90) % 256) as u8,
            (((x ^ y) * 16 + seed * 10) % 256) as u8,
        ])
    }))
}

fn stripes() -> ns::image::DynamicImage {
    ns::image::DynamicImage::ImageRgb8(ns::image::RgbImage::from_fn(SIZE, SIZE, |x, _| {
        if (x / 2) % 2 == 0 {
            ns::image::Rgb([230, 40, 40])
        } else {
            ns::image::Rgb([20, 20, 200])
        }
    }))
}

fn builder<'a>() -> ns::SessionBuilder<'a> {
    ns::Session::builder()
        .content(gradient_image(0))
        .style(stripes())
        .backbone(backbone())
        .image_size(SIZE)
        .content_layers(vec!["conv_3"])
        .style_layers(vec!["conv_1", "conv_2"])
        // We always use a single thread to ensure we get consistent results
        // across runs
        .max_thread_count(1)
}

fn mse(a: &ns::Tensor, b: &ns::Tensor) -> f32 {
    a.iter().zip(b.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f32>() / a.len() as f32
}

// (step, style score, content score, min pixel, max pixel) of every report
type Reports = Arc<Mutex<Vec<(u32, f32, f32, f32, f32)>>>;

fn recorder() -> (Reports, Box<dyn ns::TransferProgress>) {
    let reports = Reports::default();
    let sink = reports.clone();

    let progress = move |update: ns::ProgressUpdate<'_>| {
        let min = update.image.iter().copied().fold(f32::INFINITY, f32::min);
        let max = update.image.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        sink.lock().unwrap().push((
            update.step,
            update.style_score,
            update.content_score,
            min,
            max,
        ));
    };

    (reports, Box::new(progress))
}

macro_rules! fails_with {
    ($name:ident, $pattern:pat, $gen:expr) => {
        #[test]
        fn $name() {
            let result = $gen.build().and_then(|session| session.run(None));

            match result {
                Err($pattern) => {}
                Err(other) => panic!("unexpected error: {}", other),
                Ok(_) => panic!("expected the run to fail"),
            }
        }
    };
}

fails_with!(
    unknown_content_layer,
    ns::Error::UnknownTapLayer {
        kind: ns::TapKind::Content,
        ..
    },
    builder().content_layers(vec!["conv_9"])
);

fails_with!(
    unknown_style_layer,
    ns::Error::UnknownTapLayer {
        kind: ns::TapKind::Style,
        ..
    },
    builder().style_layers(vec!["bn_1"])
);

fails_with!(
    no_layers,
    ns::Error::NoTaps,
    builder()
        .content_layers(Vec::<String>::new())
        .style_layers(Vec::<String>::new())
);

fails_with!(unrecognized_layer, ns::Error::UnrecognizedLayer(_), {
    let mut layers = backbone().into_layers();
    layers.insert(2, Layer::Other("Dropout".to_owned()));
    builder().backbone(ns::Backbone::new(layers))
});

fails_with!(
    non_finite_loss,
    ns::Error::NonFiniteLoss { step: 1, .. },
    builder().normalization(ns::Normalization::new(&[0.0; 3], &[1e-30; 3]).unwrap())
);

fails_with!(
    too_small_for_the_taps,
    ns::Error::InputTooSmall { .. },
    builder().image_size(1).style_layers(vec!["conv_3"])
);

#[test]
fn identical_images_without_style_are_a_no_op() {
    let session = builder()
        .style(gradient_image(0))
        .style_weight(0.0)
        .init(ns::Init::Content)
        .num_steps(1)
        .build()
        .unwrap();

    let mut expected = session.content().clone();
    expected.mapv_inplace(|v| v.clamp(0.0, 1.0));

    let styled = session.run(None).unwrap();
    assert_eq!(styled.tensor(), &expected);
    assert_eq!(styled.summary().content_score, 0.0);
}

#[test]
fn pixels_stay_in_range() {
    let (reports, progress) = recorder();

    let styled = builder()
        .init(ns::Init::Noise { seed: 7 })
        .num_steps(40)
        .log_every(1)
        .build()
        .unwrap()
        .run(Some(progress))
        .unwrap();

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 40);
    for (step, _, _, min, max) in reports.iter() {
        assert!(*min >= 0.0 && *max <= 1.0, "step {}: [{}, {}]", step, min, max);
    }

    assert!(styled.tensor().iter().all(|v| (0.0..=1.0).contains(v)));
    assert!(styled.summary().steps > 40);
}

#[test]
fn content_only_reduces_content_loss() {
    let (reports, progress) = recorder();

    let styled = builder()
        .style_weight(0.0)
        .init(ns::Init::Noise { seed: 1 })
        .line_search(ns::LineSearch::Backtracking)
        .num_steps(60)
        .log_every(1)
        .build()
        .unwrap()
        .run(Some(progress))
        .unwrap();

    let first = reports.lock().unwrap()[0].2;
    let last = styled.summary().content_score;
    assert!(last < first, "{} -> {}", first, last);
}

#[test]
fn style_only_moves_away_from_content() {
    let (reports, progress) = recorder();

    let session = builder()
        .content_weight(0.0)
        .style_weight(1e3)
        .init(ns::Init::Content)
        .num_steps(40)
        .log_every(5)
        .build()
        .unwrap();

    let content = session.content().clone();
    let styled = session.run(Some(progress)).unwrap();

    assert!(mse(styled.tensor(), &content) > 0.0);

    // the divergence isn't monotonic from one report to the next
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 8);
    let (first, last) = (reports[0].2, reports[reports.len() - 1].2);
    assert!(last > first, "{} -> {}", first, last);
}

#[test]
fn reported_scores_are_unweighted() {
    let first_report = |style_weight: f32| {
        let (reports, progress) = recorder();

        builder()
            .style_weight(style_weight)
            .init(ns::Init::Content)
            .num_steps(1)
            .log_every(1)
            .build()
            .unwrap()
            .run(Some(progress))
            .unwrap();

        let reports = reports.lock().unwrap();
        (reports[0].1, reports[0].2)
    };

    let (style, content) = first_report(1e3);
    assert!(style > 0.0);
    assert_eq!(first_report(1e5), (style, content));
}

#[test]
fn style_weight_lowers_style_loss() {
    let (reports, progress) = recorder();

    let styled = builder()
        .style_weight(1e4)
        .init(ns::Init::Content)
        .line_search(ns::LineSearch::Backtracking)
        .num_steps(60)
        .log_every(1)
        .build()
        .unwrap()
        .run(Some(progress))
        .unwrap();

    let first = reports.lock().unwrap()[0].1;
    assert!(styled.summary().style_score < first);
}

#[test]
fn single_threaded_runs_are_deterministic() {
    let run = || {
        builder()
            .init(ns::Init::Noise { seed: 3 })
            .num_steps(10)
            .build()
            .unwrap()
            .run(None)
            .unwrap()
    };

    assert_eq!(run().tensor(), run().tensor());
}

#[test]
fn snapshot_cadence() {
    let session = builder().num_steps(60).build().unwrap();

    let mut steps = Vec::new();
    let mut sink = |step: u32, image: &ns::Tensor| -> Result<(), ns::Error> {
        assert_eq!(image.dim(), (1, 3, SIZE as usize, SIZE as usize));
        steps.push(step);
        Ok(())
    };

    let mut input = session.input().clone();
    let summary = ns::transfer::run_style_transfer(
        &backbone(),
        &ns::Normalization::imagenet(),
        session.content(),
        session.style(),
        &mut input,
        session.params(),
        &ns::ExecutionContext::single_threaded(),
        None,
        Some(&mut sink),
    )
    .unwrap();

    assert!(summary.steps > 60);
    assert_eq!(steps, vec![25, 50]);
}

#[test]
fn snapshots_are_written_to_disk() {
    let dir = std::env::temp_dir().join(format!("neural-style-snapshots-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    builder()
        .num_steps(30)
        .snapshot_every(10)
        .snapshot_dir(&dir)
        .build()
        .unwrap()
        .run(None)
        .unwrap();

    for step in &[10, 20, 30] {
        let path = dir.join(format!("step_{}.jpg", step));
        let img = ns::image::open(&path).unwrap();
        assert_eq!(ns::image::GenericImageView::dimensions(&img), (SIZE, SIZE));
    }
    assert!(!dir.join("step_40.jpg").exists());

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn assembly_is_deterministic() {
    let session = builder().build().unwrap();
    let ctx = ns::ExecutionContext::single_threaded();

    let assemble = || {
        ns::model::assemble(
            &backbone(),
            &ns::Normalization::imagenet(),
            session.style(),
            session.content(),
            &["conv_3"],
            &["conv_1", "conv_2"],
            &ctx,
        )
        .unwrap()
    };

    let (a, b) = (assemble(), assemble());

    assert!(a.names().eq(b.names()));
    assert!(a.content_losses().map(|l| l.target()).eq(b.content_losses().map(|l| l.target())));
    assert!(a.style_losses().map(|l| l.target()).eq(b.style_losses().map(|l| l.target())));

    let last_tap = a.stages().rposition(|s| s.is_tap()).unwrap();
    assert_eq!(a.len(), last_tap + 1);
    assert_eq!(a.names().last(), Some("content_loss_3"));
}

#[test]
fn preserve_colors_changes_only_the_style() {
    let plain = builder().build().unwrap();
    let matched = builder().preserve_colors(true).build().unwrap();

    assert_eq!(plain.content(), matched.content());
    assert!(mse(plain.style(), matched.style()) > 0.0);
}

#[test]
fn styled_image_round_trips_through_disk() {
    let styled = builder().num_steps(5).build().unwrap().run(None).unwrap();

    let path = std::env::temp_dir().join(format!("neural-style-out-{}.png", std::process::id()));
    styled.save(&path).unwrap();

    let loaded = ns::image_to_tensor(&ns::image::open(&path).unwrap().to_rgb8());
    std::fs::remove_file(&path).unwrap();

    // 8-bit quantization is all that's lost
    let max_error = loaded
        .iter()
        .zip(styled.tensor().iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f32::max);
    assert!(max_error <= 0.5 / 255.0 + 1e-6, "{}", max_error);
}
