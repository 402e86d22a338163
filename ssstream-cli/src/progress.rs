//! Progress display while an upload is running
use std::time::Duration;

/// Spinner showing how many bytes have been uploaded so far, fed by the transfer's progress
/// updates
pub(crate) struct UploadProgress {
    bar: indicatif::ProgressBar,
    updater: tokio::task::JoinHandle<()>,
}

impl UploadProgress {
    pub(crate) fn start(globals: &super::Globals, transfer: &ssstream::StreamTransfer) -> Self {
        let bar = if !hide_progress(globals) {
            indicatif::ProgressBar::new_spinner()
        } else {
            indicatif::ProgressBar::hidden()
        };

        bar.set_style(
            indicatif::ProgressStyle::with_template(
                "{spinner:.blue} {msg}: {bytes} uploaded ({binary_bytes_per_sec})",
            )
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message(format!(
            "Uploading to s3://{}/{}",
            transfer.bucket(),
            transfer.key()
        ));

        let updater = {
            let bar = bar.clone();
            let progress = transfer.progress();

            tokio::spawn(async move {
                if let Some(mut progress) = progress {
                    while let Some(bytes) = progress.recv().await {
                        bar.inc(bytes);
                    }
                }
            })
        };

        Self { bar, updater }
    }

    /// Stop updating and remove the spinner
    pub(crate) fn finish(self) {
        // The transfer never closes the progress channel, so the updater won't exit on its own
        self.updater.abort();
        self.bar.finish_and_clear();
    }
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the spinner rendering will be all messed up), or quiet mode (because spinners are
/// not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}
