use neural_style as ns;

fn main() -> Result<(), ns::Error> {
    // the VGG-19 feature stack, exported from torchvision as safetensors
    let backbone = ns::Backbone::load(ns::Architecture::vgg19(), "weights/vgg19.safetensors")?;

    let session = ns::Session::builder()
        // the image whose shapes we keep
        .content(&"imgs/dancing.jpg")
        // the image whose textures we borrow
        .style(&"imgs/picasso.jpg")
        .backbone(backbone)
        // both images need the same size, cropping takes care of differing aspect ratios
        .image_size(512)
        .crop(512)
        .build()?;

    // optimize an image that paints "dancing.jpg" in the style of "picasso.jpg"
    let styled = session.run(None)?;

    // save the result to the disk
    styled.save("out/01.png")
}
