//! Helpers shared by the integration suites
#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use treeexec::{ExecutionContext, RunReport};

pub const LATCH_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init() {
    treeexec::init_tracing("treeexec=debug");
}

/// Count-down latch; bodies block on it to prove they run at the same time
#[derive(Clone)]
pub struct Latch {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl Latch {
    pub fn new(count: usize) -> Self {
        Self {
            inner: Arc::new((Mutex::new(count), Condvar::new())),
        }
    }

    pub fn count_down(&self) {
        let (count, cvar) = &*self.inner;
        let mut count = count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            cvar.notify_all();
        }
    }

    /// `true` if the count reached zero within `timeout`
    pub fn wait(&self, timeout: Duration) -> bool {
        let (count, cvar) = &*self.inner;
        let mut count = count.lock();
        while *count > 0 {
            if cvar.wait_for(&mut count, timeout).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Count down, then wait for the others
    pub fn arrive_and_wait(&self) -> anyhow::Result<()> {
        self.count_down();
        anyhow::ensure!(self.wait(LATCH_TIMEOUT), "latch timed out");
        Ok(())
    }
}

/// Tracks how many bodies are inside a critical section at once
#[derive(Clone, Default)]
pub struct ActiveCounter {
    active: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl ActiveCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> usize {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        now
    }

    pub fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    /// Enter, hold for `pause`, exit
    pub fn occupy(&self, pause: Duration) -> usize {
        let now = self.enter();
        thread::sleep(pause);
        self.exit();
        now
    }
}

/// Counter updated with a racy read-sleep-write; concurrent writers lose
/// updates, so a correct final value witnesses mutual exclusion.
#[derive(Clone, Default)]
pub struct SharedCounter {
    value: Arc<AtomicUsize>,
}

impl SharedCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_slowly(&self) {
        let seen = self.value.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        self.value.store(seen + 1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.value.load(Ordering::SeqCst)
    }

    /// Increment, let any concurrent sibling catch up on `latch`, then check
    /// nobody else touched the counter meanwhile.
    pub fn increment_block_and_check(&self, latch: &Latch) -> anyhow::Result<()> {
        let value = self.value.fetch_add(1, Ordering::SeqCst) + 1;
        latch.count_down();
        // Times out when siblings are correctly kept out
        latch.wait(Duration::from_millis(200));
        let seen = self.value.load(Ordering::SeqCst);
        anyhow::ensure!(seen == value, "expected {value}, got {seen}");
        Ok(())
    }
}

/// Body that publishes the running thread's label
pub fn publish_thread(ctx: &ExecutionContext) {
    ctx.publish_entry("thread", treeexec::exec::current_thread_label());
}

/// Whether two nodes' Started..Finished intervals are disjoint
pub fn disjoint(report: &RunReport, a: &str, b: &str) -> bool {
    let (a_start, a_end) = report.interval(a).expect("interval for a");
    let (b_start, b_end) = report.interval(b).expect("interval for b");
    a_end < b_start || b_end < a_start
}

pub fn assert_pairwise_disjoint(report: &RunReport, ids: &[&str]) {
    for (i, a) in ids.iter().enumerate() {
        for b in &ids[i + 1..] {
            assert!(disjoint(report, a, b), "{a} and {b} overlapped");
        }
    }
}
