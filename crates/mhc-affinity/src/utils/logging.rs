use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe progress counter for rayon loops.
///
/// Drawing is skipped entirely when `log` is filtered below `Info`.
pub struct Progress {
    total: usize,
    count: AtomicUsize,
    bar: ProgressBar,
}

impl Progress {
    pub fn new(total: usize, description: &str) -> Self {
        let bar = ProgressBar::new(total as u64);
        if !log::log_enabled!(log::Level::Info) {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        let style = ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(description.to_string());
        Self {
            total,
            count: AtomicUsize::new(0),
            bar,
        }
    }

    pub fn inc(&self) {
        let new_count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if new_count > self.total {
            log::warn!("Progress overflow ({} > {}), ignoring update", new_count, self.total);
            return;
        }
        self.bar.inc(1);
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire).min(self.total)
    }

    pub fn finish(self) {
        self.bar.finish();
    }
}
