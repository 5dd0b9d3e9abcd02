//! 预分配的定长字节缓冲池，有界阻塞借还

use std::sync::{Condvar, Mutex};

use crate::common::types::ByteVec;

#[derive(Debug)]
pub struct BufferPool {
    slots: Mutex<Vec<ByteVec>>,
    available: Condvar,
    buf_size: usize,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buf_size: usize) -> Self {
        assert!(capacity >= 1);
        let slots = (0..capacity).map(|_| vec![0_u8; buf_size]).collect();
        BufferPool {
            slots: Mutex::new(slots),
            available: Condvar::new(),
            buf_size,
            capacity,
        }
    }

    /// 借出一个缓冲；池空时阻塞等待
    pub fn acquire(&self) -> PooledBuf<'_> {
        let mut slots = self.slots.lock().unwrap();
        while slots.is_empty() {
            slots = self.available.wait(slots).unwrap();
        }
        let mut buf = slots.pop().unwrap();
        buf.clear();
        buf.resize(self.buf_size, 0);
        PooledBuf {
            pool: self,
            buf: Some(buf),
        }
    }

    fn release(&self, buf: ByteVec) {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() < self.capacity {
            slots.push(buf);
        }
        self.available.notify_one();
    }

    pub fn available(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// RAII 借据，drop 时归还缓冲
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Option<ByteVec>,
}

impl std::ops::Deref for PooledBuf<'_> {
    type Target = ByteVec;
    fn deref(&self) -> &ByteVec {
        self.buf.as_ref().unwrap()
    }
}

impl std::ops::DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut ByteVec {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
