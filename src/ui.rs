//! Terminal output of `skein`: a spinner while a job runs, coloured retry and
//! skip notices, and the final execution summary as JSON.

use std::fmt::Debug;
use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::Failure;
use crate::execution::{JobExecution, JobExecutionSnapshot};
use crate::retry::{RetryContext, RetryListener};
use crate::status::BatchStatus;
use crate::step::SkipListener;

/// Progress of one job run in the terminal.
///
/// Doubles as a retry and skip listener so that fault-tolerance events are
/// printed above the spinner as they happen.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(job_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("{job_name}: starting"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn message(&self, message: impl Into<String>) {
        self.pb.set_message(message.into());
    }

    /// Prints the outcome of one execution above the spinner.
    pub fn report(&self, execution: &JobExecution) {
        let status = execution.status();
        let exit = execution.exit_status();
        let line = match status {
            BatchStatus::Completed => {
                format!("  {} {} {exit}", self.green.apply_to("✓"), execution.job_name())
            }
            BatchStatus::Stopped => {
                format!("  {} {} stopped: {exit}", self.yellow.apply_to("■"), execution.job_name())
            }
            _ => format!("  {} {} {status}: {exit}", self.red.apply_to("✗"), execution.job_name()),
        };
        self.pb.println(line);
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }

    pub fn print_summary(&self, snapshot: &JobExecutionSnapshot) {
        let style = match snapshot.status {
            BatchStatus::Completed => &self.green,
            BatchStatus::Stopped => &self.yellow,
            _ => &self.red,
        };
        println!();
        println!("{}", style.apply_to("─── Job Execution ───"));
        println!("{}", serde_json::to_string_pretty(snapshot).unwrap_or_default());
    }
}

impl RetryListener for JobProgress {
    fn on_error(&self, context: &RetryContext, failure: &Failure) {
        self.pb.println(format!(
            "  {} attempt {} failed: {failure}",
            self.yellow.apply_to("↻"),
            context.retry_count()
        ));
    }
}

impl<I: Debug, O: Debug> SkipListener<I, O> for JobProgress {
    fn on_skip_in_read(&self, failure: &Failure) {
        self.pb
            .println(format!("  {} skipped read: {failure}", self.yellow.apply_to("↷")));
    }

    fn on_skip_in_process(&self, item: &I, failure: &Failure) {
        self.pb.println(format!(
            "  {} skipped {item:?} in processing: {failure}",
            self.yellow.apply_to("↷")
        ));
    }

    fn on_skip_in_write(&self, item: &O, failure: &Failure) {
        self.pb.println(format!(
            "  {} skipped {item:?} in writing: {failure}",
            self.yellow.apply_to("↷")
        ));
    }
}
