use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assetsync_engine::{AssetOutcome, ProgressEvent};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tracing::info;

use super::format_bytes;

fn download_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} {msg}\n[{elapsed_precise}] [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

#[derive(Clone)]
pub struct ProgressManager {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
    disabled: bool,
}

impl ProgressManager {
    pub fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: false,
        }
    }

    pub fn new_disabled(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: Arc::new(Mutex::new(HashMap::new())),
            disabled: true,
        }
    }

    pub fn handle_event(&self, event: ProgressEvent) {
        if self.disabled {
            return;
        }
        let Ok(mut bars) = self.bars.lock() else {
            return;
        };

        match event {
            ProgressEvent::PhaseChanged { phase } => {
                info!(%phase, "Phase changed");
            }
            ProgressEvent::AssetStarted { path } => {
                let bar = self.multi.add(ProgressBar::new(0));
                bar.set_style(download_style());
                bar.set_message(format!("Downloading {path}"));
                bar.enable_steady_tick(Duration::from_millis(500));
                bars.insert(path, bar);
            }
            ProgressEvent::AssetProgress { path, bytes, total } => {
                if let Some(bar) = bars.get(&path) {
                    if let Some(total) = total {
                        bar.set_length(total);
                    }
                    bar.set_position(bytes);
                }
            }
            ProgressEvent::AssetFinished { path, outcome } => {
                let Some(bar) = bars.remove(&path) else {
                    return;
                };
                let message = match outcome {
                    AssetOutcome::Downloaded => {
                        format!("Finished {path} ({})", format_bytes(bar.position()))
                    }
                    AssetOutcome::NotModified => format!("Unchanged {path}"),
                    AssetOutcome::Skipped => format!("Present {path}"),
                    AssetOutcome::Failed(code) => format!("Failed {path}: {code}"),
                };
                bar.finish_with_message(message);
            }
        }
    }
}
