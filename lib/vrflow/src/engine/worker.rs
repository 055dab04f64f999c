// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The worker pool.
//!
//! One packet worker runs per partition and only ever processes
//! packets whose key lives in its partition. Forwarding-plane events
//! are handled on their own thread, and aging and audit on another.

use super::classify::PktCtx;
use super::proto::FlowProto;
use crate::ddi::time::Moment;
use crate::provider::LogLevel;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;
use core::time::Duration;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use vrflow_api::FlowError;

/// How long the event and aging threads wait before checking for
/// shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

enum WorkItem {
    Packet(Box<PktCtx>),
    Shutdown,
}

pub struct FlowWorkers {
    proto: Arc<FlowProto>,
    queues: Vec<Sender<WorkItem>>,
    running: Arc<AtomicBool>,
    processed: Arc<AtomicU64>,
    threads: Vec<JoinHandle<()>>,
}

fn spawn<F>(name: String, f: F) -> Result<JoinHandle<()>, FlowError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name).spawn(f).map_err(|e| FlowError::System {
        errno: e.raw_os_error().unwrap_or(libc::EAGAIN),
        msg: format!("worker spawn: {e}"),
    })
}

fn packet_loop(proto: &FlowProto, rx: &Receiver<WorkItem>, processed: &AtomicU64) {
    while let Ok(item) = rx.recv() {
        match item {
            WorkItem::Packet(pkt) => {
                if let Err(e) = proto.process_packet(&pkt) {
                    proto.log.log(
                        LogLevel::Warn,
                        &format!("packet {}: {e}", pkt.key),
                    );
                }
                processed.fetch_add(1, Ordering::Relaxed);
            }

            WorkItem::Shutdown => break,
        }
    }
}

impl FlowWorkers {
    /// Start one packet worker per partition plus the event and aging
    /// threads.
    pub fn start(proto: Arc<FlowProto>) -> Result<Self, FlowError> {
        let mut workers = Self {
            proto: Arc::clone(&proto),
            queues: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            processed: Arc::new(AtomicU64::new(0)),
            threads: Vec::new(),
        };

        for part in 0..proto.num_partitions() {
            let (tx, rx) = crossbeam_channel::unbounded();
            let proto = Arc::clone(&proto);
            let processed = Arc::clone(&workers.processed);
            let handle = spawn(format!("vrflow-pkt-{part}"), move || {
                packet_loop(&proto, &rx, &processed)
            });

            match handle {
                Ok(h) => {
                    workers.queues.push(tx);
                    workers.threads.push(h);
                }
                Err(e) => {
                    workers.stop();
                    return Err(e);
                }
            }
        }

        let events = {
            let proto = Arc::clone(&proto);
            let running = Arc::clone(&workers.running);
            spawn("vrflow-events".to_string(), move || {
                while running.load(Ordering::Relaxed) {
                    if let Some(ev) = proto.next_fwd_event(POLL_INTERVAL) {
                        proto.handle_fwd_event(ev);
                    }
                }
                proto.process_fwd_events();
            })
        };

        let aging = {
            let proto = Arc::clone(&proto);
            let running = Arc::clone(&workers.running);
            spawn("vrflow-aging".to_string(), move || {
                while running.load(Ordering::Relaxed) {
                    let wait = proto.aging_tick(Moment::now());
                    thread::sleep(wait.min(POLL_INTERVAL));
                }
            })
        };

        for handle in [events, aging] {
            match handle {
                Ok(h) => workers.threads.push(h),
                Err(e) => {
                    workers.stop();
                    return Err(e);
                }
            }
        }

        proto.log.log(
            LogLevel::Note,
            &format!("started {} flow workers", proto.num_partitions()),
        );
        Ok(workers)
    }

    /// Hand a packet to the worker that owns its key.
    pub fn dispatch(&self, pkt: PktCtx) -> Result<(), FlowError> {
        let mut key = pkt.key;
        key.canonicalize();
        let part = usize::from(self.proto.owner_part(&key));
        let queue = self.queues.get(part).ok_or_else(|| {
            FlowError::BadState(format!("no worker for partition {part}"))
        })?;

        queue.send(WorkItem::Packet(Box::new(pkt))).map_err(|_| {
            FlowError::BadState(format!("worker {part} has stopped"))
        })
    }

    /// The number of packets the workers have finished with.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn proto(&self) -> &Arc<FlowProto> {
        &self.proto
    }

    /// Stop every thread. Packets already dispatched are processed
    /// first.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for q in self.queues.drain(..) {
            let _ = q.send(WorkItem::Shutdown);
        }
        self.running.store(false, Ordering::Relaxed);

        for h in self.threads.drain(..) {
            if h.join().is_err() {
                self.proto.log.log(LogLevel::Error, "flow worker panicked");
            }
        }
    }
}

impl Drop for FlowWorkers {
    fn drop(&mut self) {
        self.stop();
    }
}
