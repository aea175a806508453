//! Adaptive parallel enumeration of a sorted key space.
//!
//! A single `list_objects` stream is bounded by round-trip latency. This
//! lister carves the key space into disjoint ranges discovered at runtime:
//! a doubly linked list of range nodes, each owned by one worker, with new
//! ranges opened by bisecting the largest remaining gap. Synthetic split
//! points come from code-point midpoints between known keys.

use crate::error::{QfsError, Result};
use crate::repo::store::{list_page_with_retry, ObjectMeta, ObjectStore};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ListerOptions {
    /// Maximum concurrent range workers.
    pub threads: usize,
    /// Keys requested per list call.
    pub page_size: usize,
}

impl Default for ListerOptions {
    fn default() -> Self {
        Self {
            threads: 20,
            page_size: 1000,
        }
    }
}

/// Code points the midpoint computation must not emit: snap into the
/// nearest usable neighbor instead.
fn clamp_code_point(mut c: u32) -> char {
    if c < 0x20 {
        c = 0x20;
    }
    if c > 0x10FFFD {
        c = 0x10FFFD;
    }
    if (0xD800..=0xDFFF).contains(&c) {
        c = 0xD7FF;
    }
    if (0xFDD0..=0xFDEF).contains(&c) {
        c = 0xFDCF;
    }
    if c & 0xFFFF >= 0xFFFE {
        c = (c & !0xFFFF) | 0xFFFD;
    }
    char::from_u32(c).unwrap_or(char::REPLACEMENT_CHARACTER)
}

/// A key lexically between `s1` and `s2` in code-point space, or `s1`
/// itself when the two are adjacent and nothing fits between.
pub fn midpoint(s1: &str, s2: &str) -> String {
    if s1 == s2 {
        return s1.to_string();
    }
    debug_assert!(s1 < s2, "midpoint arguments out of order: {s1:?} {s2:?}");

    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    let mut i = 0;
    while i < a.len() && i < b.len() && a[i] == b[i] {
        i += 1;
    }
    let d1 = a.get(i).map_or(0, |c| *c as u32);
    let d2 = b.get(i).map_or(0, |c| *c as u32);

    let mut out: Vec<char>;
    if d1 == 0 {
        // s1 is a proper prefix of s2: extend it below s2's next rune.
        out = a.clone();
        out.push(clamp_code_point(0x10 + d2 / 2));
    } else if d2 - d1 == 1 {
        // Adjacent runes: split one level deeper.
        let next = a.get(i + 1).map_or(0, |c| *c as u32);
        out = a[..=i].to_vec();
        out.push(clamp_code_point(0x4F + next));
    } else {
        out = a[..i].to_vec();
        out.push(clamp_code_point((d1 + d2) / 2));
    }

    let result: String = out.into_iter().collect();
    if s1 < result.as_str() && result.as_str() < s2 {
        result
    } else {
        s1.to_string()
    }
}

/// Gap-size heuristic over the first two differing code points. The
/// second position keeps deeply nested prefix clusters competitive with
/// top-level spreads when ranking ranges for bisection.
pub fn key_distance(s1: &str, s2: &str) -> u64 {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    let mut i = 0;
    while i < a.len() && i < b.len() && a[i] == b[i] {
        i += 1;
    }
    let at = |v: &[char], idx: usize| v.get(idx).map_or(0i64, |c| *c as i64);
    let hi = at(&b, i) - at(&a, i);
    let lo = at(&b, i + 1) - at(&a, i + 1);
    ((hi << 32) + lo) as u64
}

#[derive(Debug)]
struct RangeNode {
    /// First key actually seen in this range; empty for an unstarted head.
    start_key: String,
    /// Most recent key read; the next page starts after it.
    last_key: String,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct ListState {
    /// Node slab; unlinked nodes stay allocated so indices remain stable.
    nodes: Vec<RangeNode>,
    head: Option<usize>,
    /// Inclusive upper bound of the remaining key space, tightened as
    /// tail ranges finish.
    upper_bound: String,
}

impl ListState {
    fn end_key(&self, idx: usize) -> String {
        match self.nodes[idx].next {
            Some(next) => self.nodes[next].start_key.clone(),
            None => self.upper_bound.clone(),
        }
    }

    /// A range that has not yet seen a key beyond its seed.
    fn empty_range(&self, idx: usize) -> bool {
        self.nodes[idx].start_key == self.nodes[idx].last_key
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        match prev {
            Some(p) => self.nodes[p].next = next,
            None => self.head = next,
        }
        if let Some(n) = next {
            self.nodes[n].prev = prev;
        }
        self.nodes[idx].prev = None;
        self.nodes[idx].next = None;
    }

    fn insert_after(&mut self, idx: usize, start: String) -> usize {
        let new_idx = self.nodes.len();
        let next = self.nodes[idx].next;
        self.nodes.push(RangeNode {
            start_key: start.clone(),
            last_key: start,
            prev: Some(idx),
            next,
        });
        self.nodes[idx].next = Some(new_idx);
        if let Some(n) = next {
            self.nodes[n].prev = Some(new_idx);
        }
        new_idx
    }

    /// Bisect the widest open range, if any range is worth splitting.
    /// Open means the node has produced keys and does not sit right after
    /// one that has not settled yet.
    fn insert_node(&mut self) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        let mut cur = self.head;
        while let Some(i) = cur {
            let node = &self.nodes[i];
            let open = !self.empty_range(i)
                && node.prev.map_or(true, |p| !self.empty_range(p));
            if open {
                let end = self.end_key(i);
                let last = self.nodes[i].last_key.clone();
                if last < end {
                    let mid = midpoint(&last, &end);
                    if last < mid && mid < end {
                        let gap = key_distance(&last, &end);
                        if best.map_or(true, |(_, g)| gap > g) {
                            best = Some((i, gap));
                        }
                    }
                }
            }
            cur = self.nodes[i].next;
        }
        let (idx, _) = best?;
        let end = self.end_key(idx);
        let mid = midpoint(&self.nodes[idx].last_key.clone(), &end);
        Some(self.insert_after(idx, mid))
    }
}

/// Derive an inclusive upper bound for the whole prefix by probing with
/// ever-larger sentinel keys.
async fn probe_upper_bound(store: &dyn ObjectStore, prefix: &str) -> Result<String> {
    let mut code: u32 = 0x7E; // '~'
    loop {
        let Some(ch) = char::from_u32(code) else {
            return Err(QfsError::Other(format!(
                "cannot bound key space under {:?}",
                prefix
            )));
        };
        let sentinel = format!("{}{}", prefix, ch);
        let page = list_page_with_retry(store, prefix, &sentinel, 1).await?;
        if page.objects.is_empty() {
            return Ok(sentinel);
        }
        code = if code == 0x7E { 0x100 } else { code * 2 };
        if code > 0x10FFFF {
            return Err(QfsError::Other(format!(
                "cannot bound key space under {:?}",
                prefix
            )));
        }
    }
}

struct WorkerCtx {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    page_size: usize,
    state: Arc<Mutex<ListState>>,
    cancel: CancellationToken,
    sink: Arc<dyn Fn(ObjectMeta) + Send + Sync>,
}

async fn range_worker(ctx: Arc<WorkerCtx>, idx: usize) -> Result<()> {
    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }
        let start_after = ctx.state.lock().unwrap().nodes[idx].last_key.clone();
        let page =
            list_page_with_retry(ctx.store.as_ref(), &ctx.prefix, &start_after, ctx.page_size)
                .await?;

        let mut accepted: Vec<ObjectMeta> = Vec::new();
        let mut end_of_range = !page.truncated;
        let mut resume = false;
        {
            let mut state = ctx.state.lock().unwrap();
            let end_key = state.end_key(idx);
            for obj in page.objects {
                if obj.key > end_key {
                    end_of_range = true;
                    break;
                }
                if state.nodes[idx].start_key.is_empty() {
                    state.nodes[idx].start_key = obj.key.clone();
                }
                state.nodes[idx].last_key = obj.key.clone();
                accepted.push(obj);
            }

            if end_of_range {
                let start = state.nodes[idx].start_key.clone();
                let last = state.nodes[idx].last_key.clone();
                if state.nodes[idx].next.is_none() && !start.is_empty() {
                    // Finished tail: nothing can exist beyond this range's
                    // first key anymore.
                    state.upper_bound = start.clone();
                }
                let pred = state.nodes[idx].prev;
                if last == start && pred.is_some() {
                    // The bisection landed past every real key. Slide the
                    // seed back toward the predecessor and try again; a
                    // seed that cannot move means the range is truly
                    // empty and falls through to the merge below.
                    let pred_last = state.nodes[pred.unwrap_or(0)].last_key.clone();
                    let new_start = midpoint(&pred_last, &start);
                    if new_start != start {
                        state.nodes[idx].start_key = new_start.clone();
                        state.nodes[idx].last_key = new_start;
                        resume = true;
                    }
                }
                if !resume {
                    if let Some(next) = state.nodes[idx].next {
                        state.nodes[next].start_key = start;
                    }
                    state.unlink(idx);
                }
            }
        }

        // The sink runs outside the range lock; consumers see keys from
        // several workers interleaved.
        for obj in accepted {
            (ctx.sink)(obj);
        }

        if end_of_range && !resume {
            return Ok(());
        }
    }
}

/// Enumerate every key under `prefix`, invoking `sink` once per object.
///
/// Output order is not globally sorted across workers; the sink is called
/// concurrently and must not assume order. On any worker error the shared
/// token is cancelled so peers exit promptly, and the collected errors are
/// joined into one.
pub async fn list_prefix(
    store: Arc<dyn ObjectStore>,
    prefix: &str,
    options: &ListerOptions,
    cancel: &CancellationToken,
    sink: impl Fn(ObjectMeta) + Send + Sync + 'static,
) -> Result<()> {
    let upper_bound = probe_upper_bound(store.as_ref(), prefix).await?;
    let state = Arc::new(Mutex::new(ListState {
        nodes: vec![RangeNode {
            start_key: String::new(),
            last_key: String::new(),
            prev: None,
            next: None,
        }],
        head: Some(0),
        upper_bound,
    }));

    let ctx = Arc::new(WorkerCtx {
        store,
        prefix: prefix.to_string(),
        page_size: options.page_size.max(1),
        state: state.clone(),
        cancel: cancel.clone(),
        sink: Arc::new(sink),
    });

    let threads = options.threads.max(1);
    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    workers.spawn(range_worker(ctx.clone(), 0));
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    let mut errors: Vec<QfsError> = Vec::new();

    loop {
        tokio::select! {
            joined = workers.join_next() => {
                match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        errors.push(e);
                        cancel.cancel();
                    }
                    Some(Err(e)) => {
                        errors.push(QfsError::Other(format!("lister worker panicked: {e}")));
                        cancel.cancel();
                    }
                }
            }
            _ = tick.tick() => {}
        }
        if cancel.is_cancelled() {
            continue;
        }
        while workers.len() < threads {
            let inserted = state.lock().unwrap().insert_node();
            match inserted {
                Some(idx) => {
                    workers.spawn(range_worker(ctx.clone(), idx));
                }
                None => break,
            }
        }
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(QfsError::Other(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; "),
        )),
    }
}
