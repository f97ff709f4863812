use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    let backbone = ns::Backbone::load("vgg19".parse()?, "weights/vgg19.safetensors")?;

    let session = ns::Session::builder()
        .content(&"imgs/dancing.jpg")
        .style(&"imgs/picasso.jpg")
        .backbone(backbone)
        .image_size(256)
        .crop(256)
        // recolor the style image first, so the output keeps the content's palette
        .preserve_colors(true)
        // start from the content image rather than noise, which converges faster
        .init(ns::Init::Content)
        .num_steps(150)
        // keep an intermediate image every 25 steps
        .snapshot_dir("out/02_steps")
        .build()?;

    let styled = session.run(Some(Box::new(|update: ns::ProgressUpdate<'_>| {
        println!(
            "step {}/{}: style {:.4} content {:.4}",
            update.step, update.total, update.style_score, update.content_score
        );
    })))?;

    styled.save("out/02.png")
}
