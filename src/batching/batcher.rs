// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::Result;
use crate::batching::flow_controller::{FlowController, Reservation};
use crate::batching::options::BatchingSettings;
use crate::batching::{BatchingDescriptor, PartitionKey};
use crate::callable::{CallContext, UnaryCallable};
use crate::error::Error;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

type Descriptor<Req, Resp> = Arc<dyn BatchingDescriptor<Req, Resp>>;

/// Creates [Batcher]s sharing one descriptor, one settings value, and one
/// flow controller.
pub struct BatcherFactory<Req, Resp> {
    descriptor: Descriptor<Req, Resp>,
    settings: BatchingSettings,
    flow: Option<Arc<FlowController>>,
}

impl<Req, Resp> BatcherFactory<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub fn new<D>(descriptor: D, settings: BatchingSettings) -> Self
    where
        D: BatchingDescriptor<Req, Resp>,
    {
        let flow = settings
            .flow_control()
            .cloned()
            .map(|s| Arc::new(FlowController::new(s)));
        Self {
            descriptor: Arc::new(descriptor),
            settings,
            flow,
        }
    }

    pub fn settings(&self) -> &BatchingSettings {
        &self.settings
    }

    /// The shared flow controller, when flow control is configured.
    pub fn flow_controller(&self) -> Option<Arc<FlowController>> {
        self.flow.clone()
    }

    /// Starts a batcher pushing merged requests through `inner`.
    pub fn batcher(&self, inner: UnaryCallable<Req, Resp>) -> Batcher<Req, Resp> {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router {
            rx,
            inner,
            descriptor: self.descriptor.clone(),
            settings: self.settings.clone(),
            workers: HashMap::new(),
        };
        tokio::spawn(router.run());
        Batcher {
            tx,
            descriptor: self.descriptor.clone(),
            flow: self.flow.clone(),
        }
    }
}

/// Accepts logical requests and resolves each with its share of a batched
/// physical response.
pub struct Batcher<Req, Resp> {
    tx: mpsc::UnboundedSender<Command<Req, Resp>>,
    descriptor: Descriptor<Req, Resp>,
    flow: Option<Arc<FlowController>>,
}

impl<Req, Resp> Clone for Batcher<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            descriptor: self.descriptor.clone(),
            flow: self.flow.clone(),
        }
    }
}

impl<Req, Resp> Batcher<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Enqueues one logical request and resolves when its batch completes.
    ///
    /// The flow-control reservation happens here, before the request is
    /// enqueued, so a [Block][crate::batching::LimitExceededBehavior::Block]
    /// policy suspends this future until capacity frees up. The reservation
    /// is released when the physical call carrying the batch completes.
    pub async fn add(&self, request: Req) -> Result<Resp> {
        let elements = self.descriptor.element_count(&request);
        let bytes = self.descriptor.byte_count(&request);
        let reservation = match &self.flow {
            Some(flow) => Some(flow.reserve(elements, bytes).await?),
            None => None,
        };
        let (tx, rx) = oneshot::channel();
        let bundle = Bundle {
            request,
            elements,
            bytes,
            reservation,
            tx,
        };
        self.tx
            .send(Command::Add(bundle))
            .map_err(|_| Error::cancelled("the batcher worker has shut down"))?;
        rx.await
            .map_err(|_| Error::cancelled("the batch was dropped before completing"))?
    }

    /// Sends every open batch now and waits for the results to be
    /// delivered. Keys with no open batch are unaffected.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Flush(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// This batcher as a callable, for further composition.
    pub fn callable(&self) -> UnaryCallable<Req, Resp> {
        let batcher = self.clone();
        UnaryCallable::new(move |request: Req, _context: CallContext| {
            let batcher = batcher.clone();
            async move { batcher.add(request).await }
        })
    }
}

enum Command<Req, Resp> {
    Add(Bundle<Req, Resp>),
    Flush(oneshot::Sender<()>),
}

struct Bundle<Req, Resp> {
    request: Req,
    elements: u64,
    bytes: u64,
    reservation: Option<Reservation>,
    tx: oneshot::Sender<Result<Resp>>,
}

/// Routes bundles to one worker per partition key, spawning workers
/// lazily.
struct Router<Req, Resp> {
    rx: mpsc::UnboundedReceiver<Command<Req, Resp>>,
    inner: UnaryCallable<Req, Resp>,
    descriptor: Descriptor<Req, Resp>,
    settings: BatchingSettings,
    workers: HashMap<PartitionKey, mpsc::UnboundedSender<Command<Req, Resp>>>,
}

impl<Req, Resp> Router<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Add(bundle) => {
                    let key = self.descriptor.partition_key(&bundle.request);
                    let tx = self.workers.entry(key.clone()).or_insert_with(|| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let worker = KeyWorker {
                            key,
                            rx,
                            inner: self.inner.clone(),
                            descriptor: self.descriptor.clone(),
                            settings: self.settings.clone(),
                            batch: Batch::new(),
                        };
                        tokio::spawn(worker.run());
                        tx
                    });
                    // The worker holds its receiver for as long as this
                    // sender exists.
                    let _ = tx.send(Command::Add(bundle));
                }
                Command::Flush(ack) => {
                    let mut pending = Vec::new();
                    for tx in self.workers.values() {
                        let (wtx, wrx) = oneshot::channel();
                        if tx.send(Command::Flush(wtx)).is_ok() {
                            pending.push(wrx);
                        }
                    }
                    // Acknowledge off-loop so new adds keep flowing while
                    // the flush drains.
                    tokio::spawn(async move {
                        for wrx in pending {
                            let _ = wrx.await;
                        }
                        let _ = ack.send(());
                    });
                }
            }
        }
        // The batcher handles are gone; workers drain and stop when their
        // senders drop here.
    }
}

/// Accumulates and sends the batches of a single partition key. At most one
/// physical call per key is in flight at any time.
struct KeyWorker<Req, Resp> {
    key: PartitionKey,
    rx: mpsc::UnboundedReceiver<Command<Req, Resp>>,
    inner: UnaryCallable<Req, Resp>,
    descriptor: Descriptor<Req, Resp>,
    settings: BatchingSettings,
    batch: Batch<Req, Resp>,
}

impl<Req, Resp> KeyWorker<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn run(mut self) {
        // The timer parks far in the future while no batch is open; it is
        // re-armed to the delay threshold when a batch opens.
        const IDLE: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);
        let timer = tokio::time::sleep(IDLE);
        tokio::pin!(timer);
        let mut inflight: JoinSet<()> = JoinSet::new();
        let mut flush_when_idle = false;
        loop {
            tokio::select! {
                Some(_) = inflight.join_next(), if !inflight.is_empty() => {
                    if flush_when_idle && inflight.is_empty() {
                        flush_when_idle = false;
                        self.start_flush(&mut inflight);
                    }
                }
                _ = timer.as_mut() => {
                    timer.as_mut().reset(tokio::time::Instant::now() + IDLE);
                    if !self.batch.is_empty() {
                        if inflight.is_empty() {
                            self.start_flush(&mut inflight);
                        } else {
                            flush_when_idle = true;
                        }
                    }
                }
                command = self.rx.recv() => match command {
                    Some(Command::Add(bundle)) => {
                        if self.batch.is_empty() {
                            timer.as_mut().reset(
                                tokio::time::Instant::now() + self.settings.delay_threshold(),
                            );
                        }
                        self.batch.push(bundle, self.descriptor.as_ref());
                        let over = self.batch.elements >= self.settings.element_count_threshold()
                            || self.batch.bytes >= self.settings.request_byte_threshold();
                        if over {
                            if inflight.is_empty() {
                                self.start_flush(&mut inflight);
                            } else {
                                flush_when_idle = true;
                            }
                        }
                    }
                    Some(Command::Flush(ack)) => {
                        while inflight.join_next().await.is_some() {}
                        if !self.batch.is_empty() {
                            self.start_flush(&mut inflight);
                            while inflight.join_next().await.is_some() {}
                        }
                        flush_when_idle = false;
                        let _ = ack.send(());
                    }
                    None => {
                        while inflight.join_next().await.is_some() {}
                        if !self.batch.is_empty() {
                            self.start_flush(&mut inflight);
                            while inflight.join_next().await.is_some() {}
                        }
                        return;
                    }
                }
            }
        }
    }

    fn start_flush(&mut self, inflight: &mut JoinSet<()>) {
        let batch = std::mem::replace(&mut self.batch, Batch::new());
        if batch.is_empty() {
            return;
        }
        tracing::debug!(
            key = %self.key,
            issuers = batch.issuers.len(),
            elements = batch.elements,
            bytes = batch.bytes,
            "flushing batch"
        );
        inflight.spawn(batch.send(self.inner.clone(), self.descriptor.clone()));
    }
}

/// One open batch: the merged request plus the issuers waiting on it.
struct Batch<Req, Resp> {
    merged: Option<Req>,
    issuers: Vec<Issuer<Resp>>,
    elements: u64,
    bytes: u64,
}

struct Issuer<Resp> {
    elements: u64,
    reservation: Option<Reservation>,
    tx: oneshot::Sender<Result<Resp>>,
}

impl<Req: 'static, Resp: 'static> Batch<Req, Resp> {
    fn new() -> Self {
        Self {
            merged: None,
            issuers: Vec::new(),
            elements: 0,
            bytes: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }

    fn push(&mut self, bundle: Bundle<Req, Resp>, descriptor: &dyn BatchingDescriptor<Req, Resp>) {
        descriptor.append(&mut self.merged, bundle.request);
        self.elements += bundle.elements;
        self.bytes += bundle.bytes;
        self.issuers.push(Issuer {
            elements: bundle.elements,
            reservation: bundle.reservation,
            tx: bundle.tx,
        });
    }

    /// Sends the merged request and distributes the outcome. Flow-control
    /// reservations are released here, after the physical call completed.
    async fn send(self, inner: UnaryCallable<Req, Resp>, descriptor: Descriptor<Req, Resp>)
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        let Some(request) = self.merged else {
            return;
        };
        let counts: Vec<u64> = self.issuers.iter().map(|i| i.elements).collect();
        match inner.call(request).await {
            Ok(response) => {
                let mut shards = descriptor.split_response(&response, &counts).into_iter();
                for issuer in self.issuers {
                    let outcome = shards.next().ok_or_else(|| {
                        Error::validation("the batch response split produced too few shards")
                    });
                    // The issuer may have dropped its handle; that is fine.
                    let _ = issuer.tx.send(outcome);
                    drop(issuer.reservation);
                }
            }
            Err(e) => {
                let e = Arc::new(e);
                for issuer in self.issuers {
                    let _ = issuer.tx.send(Err(Error::shared(e.clone())));
                    drop(issuer.reservation);
                }
            }
        }
    }
}
