//! Parallel tree discovery over `PROPFIND`.
//!
//! A single coordinator owns the result map and an outstanding-task
//! counter; a bounded pool of workers performs the actual requests. This
//! keeps total parallelism fixed regardless of tree shape, and the
//! coordinator-side dedup stops aliased hrefs from being re-crawled.

use std::collections::BTreeMap;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{DavClient, DavEntry, DavError, Depth};
use crate::paths;

/// Snapshot of a remote subtree.
#[derive(Debug)]
pub struct CrawlTree {
    /// Ancestor directories of the base, keyed by backend-absolute path.
    pub parents: BTreeMap<String, DavEntry>,
    /// Every resource at or below the base, keyed by relative path.
    pub children: BTreeMap<String, DavEntry>,
}

pub struct TreeCrawler {
    client: DavClient,
    base_dir: String,
    worker_count: usize,
}

struct CrawlTask {
    rel_path: String,
}

struct CrawlReply {
    rel_path: String,
    result: Result<Option<Vec<DavEntry>>, DavError>,
}

impl TreeCrawler {
    pub fn new(client: DavClient, base_dir: &str, worker_count: usize) -> Self {
        Self {
            client,
            base_dir: paths::normalize_base(base_dir),
            worker_count: worker_count.max(1),
        }
    }

    pub async fn crawl(&self) -> Result<CrawlTree, DavError> {
        let parents = self.read_parents().await?;
        let children = self.read_children().await?;
        Ok(CrawlTree { parents, children })
    }

    /// Serial depth-0 walk down the base's ancestry. The walk ends at the
    /// first missing ancestor; a partially provisioned base is not an
    /// error, the sync may create it later.
    async fn read_parents(&self) -> Result<BTreeMap<String, DavEntry>, DavError> {
        let mut parents = BTreeMap::new();
        for abs in paths::parents(&self.base_dir) {
            let Some(entries) = self.client.propfind(&abs, Depth::Zero).await? else {
                break;
            };
            let Some(entry) = entries.into_iter().next() else {
                break;
            };
            parents.insert(entry.abs_path(), entry);
        }
        Ok(parents)
    }

    async fn read_children(&self) -> Result<BTreeMap<String, DavEntry>, DavError> {
        let cancel = CancellationToken::new();
        let (reply_tx, mut reply_rx) = mpsc::channel::<CrawlReply>(self.worker_count * 2);
        let mut task_txs = Vec::with_capacity(self.worker_count);
        let mut workers = JoinSet::new();
        for id in 0..self.worker_count {
            let (task_tx, task_rx) = mpsc::unbounded_channel::<CrawlTask>();
            task_txs.push(task_tx);
            workers.spawn(worker_loop(
                id,
                self.client.clone(),
                self.base_dir.clone(),
                task_rx,
                reply_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(reply_tx);

        let mut children: BTreeMap<String, DavEntry> = BTreeMap::new();
        let mut outstanding: usize = 0;
        let mut next_worker = 0usize;
        let mut first_error: Option<DavError> = None;

        dispatch(
            &task_txs,
            &mut next_worker,
            CrawlTask {
                rel_path: "/".to_string(),
            },
        );
        outstanding += 1;

        while outstanding > 0 {
            let Some(reply) = reply_rx.recv().await else {
                break;
            };
            outstanding -= 1;
            match reply.result {
                Err(err) => {
                    // first error wins; the pool drains and exits below
                    first_error = Some(err);
                    break;
                }
                // 404 yields no children and is not an error
                Ok(None) => {}
                Ok(Some(entries)) => {
                    for entry in entries {
                        let rel = paths::to_rel(&entry.abs_path(), &self.base_dir);
                        if children.contains_key(&rel) {
                            tracing::debug!(path = %rel, "duplicate href skipped");
                            continue;
                        }
                        let is_collection = entry.is_collection;
                        children.insert(rel.clone(), entry);
                        if is_collection && rel != reply.rel_path {
                            dispatch(&task_txs, &mut next_worker, CrawlTask { rel_path: rel });
                            outstanding += 1;
                        }
                    }
                }
            }
        }

        cancel.cancel();
        drop(task_txs);
        while workers.join_next().await.is_some() {}

        match first_error {
            Some(err) => Err(err),
            None => Ok(children),
        }
    }
}

fn dispatch(
    task_txs: &[mpsc::UnboundedSender<CrawlTask>],
    next_worker: &mut usize,
    task: CrawlTask,
) {
    let index = *next_worker % task_txs.len();
    *next_worker = next_worker.wrapping_add(1);
    // a closed channel means the pool is already shutting down
    let _ = task_txs[index].send(task);
}

async fn worker_loop(
    id: usize,
    client: DavClient,
    base_dir: String,
    mut tasks: mpsc::UnboundedReceiver<CrawlTask>,
    replies: mpsc::Sender<CrawlReply>,
    cancel: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = tasks.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };
        tracing::debug!(worker = id, path = %task.rel_path, "propfind");
        let abs = paths::to_abs(&task.rel_path, &base_dir);
        let result = client.propfind(&abs, Depth::Infinity).await;
        let errored = result.is_err();
        if replies
            .send(CrawlReply {
                rel_path: task.rel_path,
                result,
            })
            .await
            .is_err()
        {
            break;
        }
        if errored {
            break;
        }
    }
}
