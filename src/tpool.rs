// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bounded pool of worker threads fed from an unbounded job queue.
//!
//! `push` never blocks, so a queue pump can hand off every popped element
//! without stalling its poll loop. Shutdown drains the queue: jobs already
//! pushed still run, and `shutdown`/`Drop` joins every worker.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;

use log::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct ThreadPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `nthreads` workers named `{name}:{idx}`.
    pub fn new(nthreads: usize, name: &str) -> io::Result<ThreadPool> {
        assert!(nthreads > 0);

        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(nthreads);
        for idx in 0..nthreads {
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(format!("{}:{}", name, idx))
                .spawn(move || loop {
                    let job = match rx.lock().unwrap().recv() {
                        Ok(job) => job,
                        // Channel closed: queue fully drained, time to go.
                        Err(_) => break,
                    };
                    job();
                })?;
            workers.push(handle);
        }

        Ok(ThreadPool {
            tx: Some(tx),
            workers,
        })
    }

    /// Queues `job` for execution on some worker. Never blocks.
    pub fn push<F: FnOnce() + Send + 'static>(&self, job: F) {
        // The receiver outlives the sender, so this only fails if the pool
        // was already shut down, which would be a caller bug.
        self.tx
            .as_ref()
            .expect("push on a drained pool")
            .send(Box::new(job))
            .expect("worker threads exited early");
    }

    /// Waits for all queued jobs to finish and joins the workers.
    pub fn shutdown(&mut self) {
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                error!("worker thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
