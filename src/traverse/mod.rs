//! Concurrent filesystem traversal.
//!
//! A fixed pool of workers drains a shared queue of tree nodes, so an
//! arbitrarily deep tree never recurses. A pending-count reaching zero
//! signals that the last directory has been fully expanded.

pub mod queue;

use crate::db::Database;
use crate::error::{QfsError, Result};
use crate::fileinfo::{FileRecord, FileType};
use crate::filter::{self, Filter, Group};
use crate::source::Source;
use queue::WorkQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct TraverseOptions {
    /// Apply the reserved `.qfs` layout rules.
    pub repo_rules: bool,
    /// Do not descend into directories on a different device than the root.
    pub same_device: bool,
    /// Unlink files whose base name matches a junk pattern.
    pub cleanup: bool,
    /// Omit directories from the flattened view.
    pub files_only: bool,
    /// Omit special files (devices, pipes, sockets) from the flattened view.
    pub no_special: bool,
}

#[derive(Debug)]
struct Node {
    path: String,
    state: Mutex<NodeState>,
}

#[derive(Debug, Default)]
struct NodeState {
    record: Option<FileRecord>,
    included: bool,
    children: Vec<Arc<Node>>,
}

impl Node {
    fn new(path: String) -> Self {
        Self {
            path,
            state: Mutex::new(NodeState::default()),
        }
    }
}

struct Shared {
    source: Arc<dyn Source>,
    filters: Vec<Filter>,
    options: TraverseOptions,
    queue: WorkQueue<Arc<Node>>,
    pending: AtomicUsize,
    done: mpsc::Sender<()>,
    errors: mpsc::UnboundedSender<QfsError>,
    notices: mpsc::UnboundedSender<String>,
    root_dev: OnceLock<Option<u64>>,
    fatal: Mutex<Option<QfsError>>,
    cancel: CancellationToken,
}

impl Shared {
    async fn process(&self, node: &Arc<Node>) {
        let path = node.path.as_str();
        let (mut included, group) =
            filter::is_included(path, &self.filters, self.options.repo_rules);

        let mut rec = match self.source.stat(path).await {
            Ok(rec) => rec,
            Err(e) => {
                if path == "." {
                    // Losing the root is fatal; everything else is not.
                    *self.fatal.lock().unwrap() = Some(e);
                    self.cancel.cancel();
                } else {
                    let _ = self.errors.send(e);
                }
                return;
            }
        };
        if path == "." {
            let _ = self.root_dev.set(rec.dev);
        }

        match rec.file_type {
            FileType::File => {
                if group == Group::Junk && self.options.cleanup {
                    match self.source.remove(path).await {
                        Ok(()) => {
                            let _ = self
                                .notices
                                .send(format!("removing: {}", self.source.full_path(path)));
                        }
                        Err(e) => {
                            let _ = self.errors.send(e);
                        }
                    }
                }
            }
            FileType::Link => match self.source.read_link(path).await {
                Ok(target) => rec.special = target,
                Err(e) => {
                    let _ = self.errors.send(e);
                    included = false;
                }
            },
            FileType::Directory => {
                let pruned = group == Group::Prune;
                let crossed = self.options.same_device
                    && self.source.has_device_ids()
                    && self.root_dev.get().copied().flatten() != rec.dev;
                if crossed {
                    included = false;
                }
                if !pruned && !crossed {
                    match self.source.read_dir(path).await {
                        Ok(mut names) => {
                            names.sort();
                            let children: Vec<Arc<Node>> = names
                                .iter()
                                .map(|name| {
                                    let child_path = if path == "." {
                                        name.clone()
                                    } else {
                                        format!("{}/{}", path, name)
                                    };
                                    Arc::new(Node::new(child_path))
                                })
                                .collect();
                            node.state.lock().unwrap().children = children.clone();
                            if !children.is_empty() {
                                self.pending.fetch_add(children.len(), Ordering::AcqRel);
                                self.queue.push(children);
                            }
                        }
                        Err(e) => {
                            let _ = self.errors.send(e);
                        }
                    }
                }
            }
            // Devices arrive with MAJOR,MINOR already in `special`;
            // pipes and sockets need nothing further.
            _ => {}
        }

        let mut state = node.state.lock().unwrap();
        state.record = Some(rec);
        state.included = included;
    }
}

async fn worker(shared: Arc<Shared>) {
    loop {
        let batch = shared.queue.drain_all(&shared.cancel).await;
        if batch.is_empty() {
            return;
        }
        for node in batch {
            shared.process(&node).await;
            if shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _ = shared.done.try_send(());
            }
        }
    }
}

/// Walk a source tree, producing records for everything in scope.
///
/// Non-fatal I/O errors stream through `on_error` while the traversal
/// keeps going; junk-cleanup removals announce themselves via `on_notice`.
/// Only a failure to stat the root aborts the whole walk.
pub async fn traverse(
    source: Arc<dyn Source>,
    filters: &[Filter],
    options: TraverseOptions,
    mut on_error: impl FnMut(QfsError),
    mut on_notice: impl FnMut(&str),
) -> Result<Traversal> {
    let (done_tx, mut done_rx) = mpsc::channel(1);
    let (err_tx, mut err_rx) = mpsc::unbounded_channel();
    let (note_tx, mut note_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        source,
        filters: filters.to_vec(),
        options: options.clone(),
        queue: WorkQueue::new(),
        pending: AtomicUsize::new(1),
        done: done_tx,
        errors: err_tx,
        notices: note_tx,
        root_dev: OnceLock::new(),
        fatal: Mutex::new(None),
        cancel: CancellationToken::new(),
    });

    let root = Arc::new(Node::new(".".to_string()));
    shared.queue.push([root.clone()]);

    let worker_count = 5 * num_cpus::get().max(1);
    let mut handles = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        handles.push(tokio::spawn(worker(shared.clone())));
    }

    loop {
        tokio::select! {
            Some(e) = err_rx.recv() => on_error(e),
            Some(n) = note_rx.recv() => on_notice(&n),
            _ = done_rx.recv() => break,
            _ = shared.cancel.cancelled() => break,
        }
    }

    shared.queue.close();
    for handle in handles {
        let _ = handle.await;
    }
    while let Ok(e) = err_rx.try_recv() {
        on_error(e);
    }
    while let Ok(n) = note_rx.try_recv() {
        on_notice(&n);
    }

    if let Some(e) = shared.fatal.lock().unwrap().take() {
        return Err(e);
    }
    Ok(Traversal { root, options })
}

/// The tree produced by a traversal, rooted at `.`. Pruned directories are
/// retained as nodes but contribute nothing below themselves.
#[derive(Debug)]
pub struct Traversal {
    root: Arc<Node>,
    options: TraverseOptions,
}

impl Traversal {
    /// Pre-order walk of included nodes. Children were sorted before they
    /// were enqueued, so this comes out in sorted-path order even though
    /// the producer was parallel.
    pub fn flatten(&self) -> Vec<FileRecord> {
        self.collect(false)
    }

    /// Every node that produced a record, included or not; pruned
    /// directories appear but their children never existed.
    #[allow(dead_code)] // Used in tests
    pub fn all_records(&self) -> Vec<FileRecord> {
        self.collect(true)
    }

    fn collect(&self, everything: bool) -> Vec<FileRecord> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(node) = stack.pop() {
            let state = node.state.lock().unwrap();
            if let Some(rec) = &state.record {
                let admitted = everything
                    || (state.included
                        && !(self.options.files_only && rec.file_type == FileType::Directory)
                        && !(self.options.no_special
                            && !matches!(
                                rec.file_type,
                                FileType::File | FileType::Directory
                            )));
                if admitted {
                    out.push(rec.clone());
                }
            }
            for child in state.children.iter().rev() {
                stack.push(child.clone());
            }
        }
        out
    }

    pub fn into_database(&self) -> Database {
        Database::from_records(self.flatten())
    }
}
