use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_args(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty)
    }

    /// Never draws; used by tests and library callers.
    pub fn plain() -> Self {
        Self::new(UiMode::Plain, false)
    }

    fn use_pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    /// Progress over `total` folder images.
    pub fn progress(&self, total: usize) -> Progress {
        if self.use_pretty() {
            let bar = ProgressBar::new(total as u64);
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template(
                "{spinner} [{elapsed_precise}] {bar:30} {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar.enable_steady_tick(Duration::from_millis(120));
            Progress::new(total, Some(bar))
        } else {
            log::info!("processing {} image(s)", total);
            Progress::new(total, None)
        }
    }
}

pub struct Progress {
    total: usize,
    done: usize,
    start: Instant,
    bar: Option<ProgressBar>,
}

impl Progress {
    fn new(total: usize, bar: Option<ProgressBar>) -> Self {
        Self {
            total,
            done: 0,
            start: Instant::now(),
            bar,
        }
    }

    pub fn advance(&mut self, label: &str) {
        self.done += 1;
        match &self.bar {
            Some(bar) => {
                bar.set_message(label.to_string());
                bar.inc(1);
            }
            None => log::debug!("[{}/{}] {}", self.done, self.total, label),
        }
    }

    pub fn finish(&mut self) {
        let message = format!(
            "✔ {}/{} image(s) ({})",
            self.done,
            self.total,
            format_duration(self.start.elapsed())
        );
        match self.bar.take() {
            Some(bar) => bar.finish_with_message(message),
            None => log::info!("{}", message),
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.abandon();
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pretty_needs_a_tty() {
        assert!(!Ui::from_args(Some("pretty"), false).use_pretty());
        assert!(Ui::from_args(Some("pretty"), true).use_pretty());
        assert!(Ui::from_args(None, true).use_pretty());
        assert!(!Ui::from_args(Some("plain"), true).use_pretty());
    }

    #[test]
    fn plain_progress_counts() {
        let mut progress = Ui::plain().progress(2);
        progress.advance("a.jpg");
        progress.advance("b.jpg");
        assert_eq!(progress.done, 2);
        progress.finish();
    }

    #[test]
    fn durations_are_human_readable() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
