use indicatif::{ProgressBar, ProgressStyle};

use crate::{Error, Result};

/// Liveness callback invoked once per loop iteration.
pub trait TaskTracker: Send + Sync {
    fn keep_alive(&self, step: usize);
}

impl<F> TaskTracker for F
where
    F: Fn(usize) + Send + Sync,
{
    fn keep_alive(&self, step: usize) {
        self(step)
    }
}

/// Reports inference progress on a terminal progress bar.
pub struct ProgressTracker {
    pbar: ProgressBar,
}

impl ProgressTracker {
    pub fn new(message: &str, total_steps: u64) -> Result<Self> {
        let pbar = ProgressBar::new(total_steps);
        pbar.set_style(
            ProgressStyle::default_bar()
                .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({per_sec}, {eta})")
                .map_err(|e| Error::Config(e.to_string()))?
                .progress_chars("#>-"),
        );
        pbar.set_message(message.to_string());
        Ok(Self { pbar })
    }

    /// A tracker that draws nothing.
    pub fn hidden() -> Self {
        Self {
            pbar: ProgressBar::hidden(),
        }
    }

    pub fn position(&self) -> u64 {
        self.pbar.position()
    }

    pub fn finish(&self) {
        self.pbar.finish();
    }
}

impl TaskTracker for ProgressTracker {
    fn keep_alive(&self, step: usize) {
        self.pbar.set_position(step as u64 + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn closures_and_bars_track_steps() {
        let seen = AtomicUsize::new(0);
        let tracker = |step: usize| {
            seen.fetch_max(step, Ordering::Relaxed);
        };
        tracker.keep_alive(3);
        assert_eq!(seen.load(Ordering::Relaxed), 3);

        let bar = ProgressTracker::hidden();
        bar.keep_alive(4);
        assert_eq!(bar.position(), 5);
        bar.finish();
    }
}
