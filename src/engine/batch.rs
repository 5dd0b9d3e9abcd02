//! 批量写入工作线程池
//!
//! 固定数量的命名工作线程消费 crossbeam 通道里的任务，
//! 提交方拿到 oneshot 句柄，`wait` 阻塞取回逐条结果

use anyhow::Result;
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use futures::channel::oneshot;
use log::{info, warn};
use std::thread;
use std::time::{Duration, Instant};

use crate::common::error_enum::StoreError;

/// 批量中单条记录的落盘结果，error 为 None 表示成功
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub id: i32,
    pub error: Option<String>,
}

/// 批量提交的等待句柄
pub struct BatchHandle {
    rx: oneshot::Receiver<Vec<BatchOutcome>>,
}

impl BatchHandle {
    /// 阻塞直到批量执行完毕
    pub fn wait(self) -> Result<Vec<BatchOutcome>> {
        futures::executor::block_on(self.rx)
            .map_err(|_| anyhow::anyhow!("batch worker dropped before completion"))
    }
}

type BatchJob = Box<dyn FnOnce() + Send + 'static>;

pub struct BatchPool {
    job_tx: Option<Sender<BatchJob>>,
    exit_rx: Receiver<()>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl BatchPool {
    pub fn new(worker_count: usize) -> Result<Self> {
        let count = worker_count.max(1);
        let (job_tx, job_rx) = unbounded::<BatchJob>();
        let (exit_tx, exit_rx) = unbounded::<()>();

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let rx = job_rx.clone();
            let exit = exit_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("batch_worker_{}", i))
                .spawn(move || {
                    // 通道关闭即退出
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                    let _ = exit.send(());
                })?;
            workers.push(handle);
        }
        info!("batch pool started with {} worker(s)", count);
        Ok(BatchPool {
            job_tx: Some(job_tx),
            exit_rx,
            workers,
        })
    }

    /// 提交一个批量任务，结果通过返回的句柄取回
    pub fn submit<F>(&self, job: F) -> Result<BatchHandle>
    where
        F: FnOnce() -> Vec<BatchOutcome> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let tx_job: BatchJob = Box::new(move || {
            // 提交方放弃等待不算错误
            let _ = tx.send(job());
        });
        self.job_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("batch pool already closed"))?
            .send(tx_job)
            .map_err(|_| anyhow::anyhow!("batch pool workers exited"))?;
        Ok(BatchHandle { rx })
    }

    /// 停止接收新任务并等待在途任务排空，超时返回
    /// [`StoreError::DeadlineExceeded`]
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        // 丢弃发送端让工作线程自然退出
        if self.job_tx.take().is_none() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        for _ in 0..self.workers.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.exit_rx.recv_timeout(remaining) {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    warn!("batch pool drain timed out after {:?}", timeout);
                    return Err(StoreError::DeadlineExceeded(timeout.as_secs()).into());
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for BatchPool {
    fn drop(&mut self) {
        let _ = self.close(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn submit_wait_test() -> Result<()> {
        let pool = BatchPool::new(2)?;
        let handle = pool.submit(|| {
            vec![
                BatchOutcome {
                    id: 1,
                    error: None,
                },
                BatchOutcome {
                    id: 2,
                    error: Some("duplicate id".to_string()),
                },
            ]
        })?;
        let outcomes = handle.wait()?;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].error.is_none());
        assert!(outcomes[1].error.is_some());
        Ok(())
    }

    #[test]
    fn close_drains_pending_test() -> Result<()> {
        let mut pool = BatchPool::new(1)?;
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let c = counter.clone();
            pool.submit(move || {
                thread::sleep(Duration::from_millis(5));
                c.fetch_add(1, Ordering::SeqCst);
                Vec::new()
            })?;
        }
        pool.close(Duration::from_secs(5))?;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
        Ok(())
    }

    #[test]
    fn close_timeout_test() -> Result<()> {
        let mut pool = BatchPool::new(1)?;
        pool.submit(|| {
            thread::sleep(Duration::from_millis(300));
            Vec::new()
        })?;
        let err = pool.close(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::DeadlineExceeded(_))
        ));
        Ok(())
    }
}
