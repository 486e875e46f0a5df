use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indicatif::{
    HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle,
};

use crate::protocol::Action;

#[derive(Debug, Default)]
struct ActionCounters {
    list: AtomicU64,
    by_ids: AtomicU64,
    subtree: AtomicU64,
}

impl ActionCounters {
    fn inc(&self, action: Action) {
        let counter = match action {
            Action::ListComments => &self.list,
            Action::FetchByIds => &self.by_ids,
            Action::FetchSubtree => &self.subtree,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.list.load(Ordering::Relaxed),
            self.by_ids.load(Ordering::Relaxed),
            self.subtree.load(Ordering::Relaxed),
        )
    }
}

/// Terminal progress for one `run`. Display only; numbers that callers need
/// come back in `FetchMetrics`.
pub struct Progress {
    enabled: bool,
    start: Instant,
    max_concurrency: usize,

    // UI
    mp: Option<MultiProgress>,
    stage: ProgressBar,
    batches: ProgressBar,
    http: ProgressBar,

    // Counters
    http_in_flight: AtomicU64,
    http_done: AtomicU64,
    http_failed: AtomicU64,
    http_bytes: AtomicU64,
    done_by_action: ActionCounters,
    last_http_label: Mutex<String>,
}

impl Progress {
    pub fn new(enabled: bool, max_concurrency: usize) -> Arc<Self> {
        let start = Instant::now();
        let max_concurrency = max_concurrency.max(1);

        if !enabled {
            return Arc::new(Self {
                enabled: false,
                start,
                max_concurrency,
                mp: None,
                stage: ProgressBar::hidden(),
                batches: ProgressBar::hidden(),
                http: ProgressBar::hidden(),
                http_in_flight: AtomicU64::new(0),
                http_done: AtomicU64::new(0),
                http_failed: AtomicU64::new(0),
                http_bytes: AtomicU64::new(0),
                done_by_action: ActionCounters::default(),
                last_http_label: Mutex::new(String::new()),
            });
        }

        let mp = MultiProgress::with_draw_target(ProgressDrawTarget::stderr());

        let stage = mp.add(ProgressBar::new_spinner());
        stage.set_style(spinner_style());
        stage.enable_steady_tick(Duration::from_millis(80));
        stage.set_message("starting");

        let batches = mp.add(ProgressBar::new(0));
        if let Ok(style) = ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}") {
            batches.set_style(style.progress_chars("##-"));
        }
        batches.set_message("requests");

        let http = mp.add(ProgressBar::new_spinner());
        http.set_style(spinner_style());
        http.enable_steady_tick(Duration::from_millis(120));
        http.set_message("http");

        Arc::new(Self {
            enabled: true,
            start,
            max_concurrency,
            mp: Some(mp),
            stage,
            batches,
            http,
            http_in_flight: AtomicU64::new(0),
            http_done: AtomicU64::new(0),
            http_failed: AtomicU64::new(0),
            http_bytes: AtomicU64::new(0),
            done_by_action: ActionCounters::default(),
            last_http_label: Mutex::new(String::new()),
        })
    }

    pub fn set_stage(&self, msg: impl Into<String>) {
        if !self.enabled {
            return;
        }
        self.stage.set_message(msg.into());
    }

    /// Adds `count` planned requests to the bar; threads may add more later.
    pub fn add_batches(&self, count: usize) {
        if self.enabled {
            self.batches.inc_length(count as u64);
        }
    }

    pub fn batch_done(&self, ids: usize) {
        if self.enabled {
            self.batches.inc(1);
            self.batches.set_message(format!("last batch {ids} ids"));
        }
    }

    pub fn http_start(&self, action: Action) {
        self.http_in_flight.fetch_add(1, Ordering::Relaxed);
        if self.enabled {
            self.set_label(format!("POST {action}"));
            self.refresh_http();
        }
    }

    pub fn http_throttled(&self, action: Action, status: u16, wait: Duration) {
        if !self.enabled {
            return;
        }
        self.set_label(format!(
            "POST {action} throttled {status} wait {}ms",
            wait.as_millis()
        ));
        self.refresh_http();
    }

    pub fn http_ok(&self, action: Action, bytes: usize) {
        self.http_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.http_done.fetch_add(1, Ordering::Relaxed);
        self.http_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.done_by_action.inc(action);

        if self.enabled {
            self.set_label(format!("POST {action} ok {bytes}B"));
            self.refresh_http();
        }
    }

    pub fn http_err(&self, action: Action) {
        self.http_in_flight.fetch_sub(1, Ordering::Relaxed);
        self.http_failed.fetch_add(1, Ordering::Relaxed);
        if self.enabled {
            self.set_label(format!("POST {action} failed"));
            self.refresh_http();
        }
    }

    pub fn finish(&self) {
        if !self.enabled {
            return;
        }
        self.refresh_http();
        self.stage.finish_with_message("done");
        self.batches.finish_and_clear();
        self.http.finish_and_clear();
        if let Some(mp) = &self.mp {
            // Flush the last render.
            let _ = mp.println(format!("Done in {}", HumanDuration(self.start.elapsed())));
        }
    }

    fn set_label(&self, label: String) {
        if let Ok(mut last) = self.last_http_label.lock() {
            *last = label;
        }
    }

    fn refresh_http(&self) {
        let in_flight = self.http_in_flight.load(Ordering::Relaxed);
        let done = self.http_done.load(Ordering::Relaxed);
        let failed = self.http_failed.load(Ordering::Relaxed);
        let bytes = self.http_bytes.load(Ordering::Relaxed);
        let (list, by_ids, subtree) = self.done_by_action.snapshot();

        let elapsed = self.start.elapsed().as_secs_f64().max(0.001);
        let rate = (bytes as f64 / elapsed) as u64;

        let last = self
            .last_http_label
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        self.http.set_message(format!(
            "HTTP: done {done} failed {failed} | in-flight {in_flight}/{max} | bytes {bytes} ({rate}/s) | pages {list} batches {by_ids} subtrees {subtree} | {last}",
            max = self.max_concurrency,
            bytes = HumanBytes(bytes),
            rate = HumanBytes(rate),
        ));
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {msg}  [{elapsed_precise}]")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}
