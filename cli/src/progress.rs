use indicatif::{ProgressBar, ProgressStyle};

pub struct ProgressReporter {
    pb: ProgressBar,
}

impl ProgressReporter {
    pub fn new(total_steps: u32) -> Self {
        let sty = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>5}/{len} {msg}")
            .progress_chars("##-");

        let pb = ProgressBar::new(u64::from(total_steps));
        pb.set_style(sty);

        Self { pb }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.pb.finish();
    }
}

impl neural_style::TransferProgress for ProgressReporter {
    fn update(&mut self, update: neural_style::ProgressUpdate<'_>) {
        self.pb.set_length(u64::from(update.total));
        self.pb.set_position(u64::from(update.step));
        self.pb.set_message(&format!(
            "style {:.4} content {:.4}",
            update.style_score, update.content_score
        ));
    }
}
