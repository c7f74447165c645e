//! Serialized pipeline for every meta-table mutation and scan.
//!
//! All table-lifecycle, tablet-lifecycle, and user-management decisions pass
//! through here before the master mutates its own in-memory state: callers
//! await the pipeline result and apply the RAM change only on success.
//!
//! The pipeline runs one worker task, so meta operations execute strictly in
//! submission order. While the meta tablet is offline the pipeline is
//! suspended and tasks queue FIFO; resume dispatches them in enqueue order
//! against the new address.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::meta_codec::MetaRecord;
use crate::rpc::{
    KeyValue, MutationKind, MutationOp, RowMutation, RpcRouter, ScanTabletRequest, SequenceId,
    TabletNodeRpc, WriteTabletRequest, META_TABLE_NAME,
};
use crate::status::StatusCode;

#[derive(Debug, Clone, Copy)]
pub struct MetaPipelineConfig {
    pub max_retry: u32,
    pub retry_delay: Duration,
    pub scan_page: usize,
}

impl Default for MetaPipelineConfig {
    fn default() -> Self {
        Self {
            max_retry: 5,
            retry_delay: Duration::from_millis(100),
            scan_page: 512,
        }
    }
}

enum MetaTask {
    Write {
        records: Vec<MetaRecord>,
        done: oneshot::Sender<StatusCode>,
    },
    Scan {
        start: Vec<u8>,
        end: Vec<u8>,
        done: oneshot::Sender<Result<Vec<KeyValue>, StatusCode>>,
    },
    /// Rewrite one record whose on-meta state diverged (post-split repair).
    Repair {
        record: MetaRecord,
        done: oneshot::Sender<StatusCode>,
    },
}

enum Command {
    Task(MetaTask),
    Suspend,
    Resume { meta_addr: String },
}

/// Handle to the meta ops worker.
#[derive(Clone)]
pub struct MetaOpsPipeline {
    tx: mpsc::UnboundedSender<Command>,
}

impl MetaOpsPipeline {
    /// Spawn the worker. `meta_addr` is the address currently serving the
    /// meta tablet; an empty address starts the pipeline suspended.
    pub fn spawn(
        router: RpcRouter,
        sequence: Arc<SequenceId>,
        meta_addr: String,
        config: MetaPipelineConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            router,
            sequence,
            config,
            meta_addr: meta_addr.clone(),
            suspended: meta_addr.is_empty(),
            queue: VecDeque::new(),
        };
        tokio::spawn(worker.run(rx));
        Self { tx }
    }

    /// Commit a batch of meta records as one write. Returns the final status
    /// after the pipeline's own retries.
    pub async fn write(&self, records: Vec<MetaRecord>) -> StatusCode {
        let (done, wait) = oneshot::channel();
        if self
            .tx
            .send(Command::Task(MetaTask::Write { records, done }))
            .is_err()
        {
            return StatusCode::ServerShutdown;
        }
        wait.await.unwrap_or(StatusCode::ServerShutdown)
    }

    /// Scan meta rows in [start, end); pages internally until complete.
    pub async fn scan(&self, start: Vec<u8>, end: Vec<u8>) -> Result<Vec<KeyValue>, StatusCode> {
        let (done, wait) = oneshot::channel();
        if self
            .tx
            .send(Command::Task(MetaTask::Scan { start, end, done }))
            .is_err()
        {
            return Err(StatusCode::ServerShutdown);
        }
        wait.await.unwrap_or(Err(StatusCode::ServerShutdown))
    }

    /// Re-write a record that disagrees with the master's view.
    pub async fn repair(&self, record: MetaRecord) -> StatusCode {
        let (done, wait) = oneshot::channel();
        if self
            .tx
            .send(Command::Task(MetaTask::Repair { record, done }))
            .is_err()
        {
            return StatusCode::ServerShutdown;
        }
        wait.await.unwrap_or(StatusCode::ServerShutdown)
    }

    /// Stop executing: the meta tablet is offline. Tasks queue FIFO.
    pub fn suspend(&self) {
        let _ = self.tx.send(Command::Suspend);
    }

    /// Meta tablet is back at `meta_addr`: drain queued tasks in order.
    pub fn resume(&self, meta_addr: &str) {
        let _ = self.tx.send(Command::Resume {
            meta_addr: meta_addr.to_string(),
        });
    }
}

struct Worker {
    router: RpcRouter,
    sequence: Arc<SequenceId>,
    config: MetaPipelineConfig,
    meta_addr: String,
    suspended: bool,
    queue: VecDeque<MetaTask>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Suspend => {
                    tracing::info!("meta pipeline suspended");
                    self.suspended = true;
                }
                Command::Resume { meta_addr } => {
                    tracing::info!(meta_addr, queued = self.queue.len(), "meta pipeline resumed");
                    self.meta_addr = meta_addr;
                    self.suspended = false;
                    while let Some(task) = self.queue.pop_front() {
                        self.execute(task).await;
                    }
                }
                Command::Task(task) => {
                    if self.suspended {
                        self.queue.push_back(task);
                    } else {
                        self.execute(task).await;
                    }
                }
            }
        }
    }

    async fn execute(&mut self, task: MetaTask) {
        match task {
            MetaTask::Write { records, done } => {
                let status = self.execute_write(&records).await;
                let _ = done.send(status);
            }
            MetaTask::Repair { record, done } => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(&record.key),
                    "repairing meta record"
                );
                let status = self.execute_write(std::slice::from_ref(&record)).await;
                let _ = done.send(status);
            }
            MetaTask::Scan { start, end, done } => {
                let result = self.execute_scan(start, end).await;
                let _ = done.send(result);
            }
        }
    }

    async fn execute_write(&mut self, records: &[MetaRecord]) -> StatusCode {
        let rows: Vec<RowMutation> = records
            .iter()
            .map(|record| RowMutation {
                row: record.key.clone(),
                ops: vec![MutationOp {
                    kind: if record.is_delete {
                        MutationKind::DeleteRow
                    } else {
                        MutationKind::Put
                    },
                    family: String::new(),
                    qualifier: Vec::new(),
                    timestamp: None,
                    value: record.value.clone(),
                }],
            })
            .collect();

        let mut last = StatusCode::ConnectError;
        for attempt in 0..=self.config.max_retry {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay * attempt).await;
            }
            let Some(node) = self.router.node(&self.meta_addr) else {
                last = StatusCode::ConnectError;
                continue;
            };
            let response = node
                .write_tablet(WriteTabletRequest {
                    sequence_id: self.sequence.next(),
                    table_name: META_TABLE_NAME.to_string(),
                    rows: rows.clone(),
                })
                .await;
            last = response.status;
            match response.status {
                StatusCode::Ok => return StatusCode::Ok,
                StatusCode::KeyNotInRange => {
                    // Meta tablet moved underneath us; the master updates our
                    // address via resume, so just retry after the delay.
                    tracing::warn!(meta_addr = %self.meta_addr, "meta write hit KeyNotInRange");
                }
                status if status.is_retryable() => {}
                status => return status,
            }
        }
        tracing::error!(status = %last, "meta write exhausted retries");
        last
    }

    async fn execute_scan(
        &mut self,
        start: Vec<u8>,
        end: Vec<u8>,
    ) -> Result<Vec<KeyValue>, StatusCode> {
        let mut out = Vec::new();
        let mut cursor = start;
        let mut attempt = 0u32;
        loop {
            let Some(node) = self.router.node(&self.meta_addr) else {
                attempt += 1;
                if attempt > self.config.max_retry {
                    return Err(StatusCode::ConnectError);
                }
                tokio::time::sleep(self.config.retry_delay * attempt).await;
                continue;
            };
            let response = node
                .scan_tablet(ScanTabletRequest {
                    sequence_id: self.sequence.next(),
                    table_name: META_TABLE_NAME.to_string(),
                    start: cursor.clone(),
                    end: end.clone(),
                    max_entries: self.config.scan_page,
                    round_down: false,
                })
                .await;
            match response.status {
                StatusCode::Ok => {
                    attempt = 0;
                    let page_full = !response.complete;
                    let Some(last) = response.entries.last() else {
                        return Ok(out);
                    };
                    let mut next = last.key.clone();
                    next.push(0x00);
                    cursor = next;
                    out.extend(response.entries);
                    if !page_full {
                        return Ok(out);
                    }
                }
                status if status.is_retryable() => {
                    attempt += 1;
                    if attempt > self.config.max_retry {
                        return Err(status);
                    }
                    tokio::time::sleep(self.config.retry_delay * attempt).await;
                }
                status => return Err(status),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_node::FakeMetaNode;
    use std::sync::Arc;

    fn pipeline_with_fake() -> (MetaOpsPipeline, Arc<FakeMetaNode>) {
        let router = RpcRouter::new();
        let fake = Arc::new(FakeMetaNode::new());
        router.register("meta-ts:7777", fake.clone());
        let pipeline = MetaOpsPipeline::spawn(
            router,
            Arc::new(SequenceId::new()),
            "meta-ts:7777".to_string(),
            MetaPipelineConfig {
                max_retry: 2,
                retry_delay: Duration::from_millis(1),
                scan_page: 2,
            },
        );
        (pipeline, fake)
    }

    #[tokio::test]
    async fn batched_write_then_scan_round_trips() {
        let (pipeline, _fake) = pipeline_with_fake();
        let records = vec![
            MetaRecord::put(b"@a".to_vec(), b"1".to_vec()),
            MetaRecord::put(b"a\x00".to_vec(), b"2".to_vec()),
            MetaRecord::put(b"a\x00m".to_vec(), b"3".to_vec()),
        ];
        assert_eq!(pipeline.write(records).await, StatusCode::Ok);

        // Page size is 2, so this exercises continuation.
        let rows = pipeline.scan(Vec::new(), Vec::new()).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].key, b"@a".to_vec());
        assert_eq!(rows[2].key, b"a\x00m".to_vec());
    }

    #[tokio::test]
    async fn suspended_tasks_replay_in_fifo_order() {
        let (pipeline, fake) = pipeline_with_fake();
        pipeline.suspend();

        // Spawned so the writes enqueue while the pipeline is suspended.
        let spawn_write = |key: &[u8], value: &[u8]| {
            let pipeline = pipeline.clone();
            let records = vec![MetaRecord::put(key.to_vec(), value.to_vec())];
            tokio::spawn(async move { pipeline.write(records).await })
        };
        let first = spawn_write(b"k", b"v1");
        let second = spawn_write(b"k", b"v2");
        let deletes = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline.write(vec![MetaRecord::delete(b"gone".to_vec())]).await
            })
        };

        // Nothing executes while suspended.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fake.get(b"k").is_none());

        pipeline.resume("meta-ts:7777");
        let (first, second, third) = tokio::join!(first, second, deletes);
        assert_eq!(first.unwrap(), StatusCode::Ok);
        assert_eq!(second.unwrap(), StatusCode::Ok);
        assert_eq!(third.unwrap(), StatusCode::Ok);
        // Last write in queue order wins.
        assert_eq!(fake.get(b"k"), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn write_retries_until_node_registers() {
        let router = RpcRouter::new();
        let pipeline = MetaOpsPipeline::spawn(
            router.clone(),
            Arc::new(SequenceId::new()),
            "meta-ts:7777".to_string(),
            MetaPipelineConfig {
                max_retry: 5,
                retry_delay: Duration::from_millis(5),
                scan_page: 64,
            },
        );
        let fake = Arc::new(FakeMetaNode::new());
        let register = {
            let router = router.clone();
            let fake = fake.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                router.register("meta-ts:7777", fake);
            })
        };
        let status = pipeline
            .write(vec![MetaRecord::put(b"late".to_vec(), b"v".to_vec())])
            .await;
        register.await.unwrap();
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(fake.get(b"late"), Some(b"v".to_vec()));
    }
}
