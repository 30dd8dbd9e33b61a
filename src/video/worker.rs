//! Dedicated decode thread
//!
//! The socket reader only enqueues chunks; all parsing and decoding happens
//! on one OS thread in arrival order so decode latency never stalls reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle, ThreadId};

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{VideoError, VideoResult};
use crate::video::decoder::DecoderFactory;
use crate::video::pipeline::{PipelineEvent, VideoPipeline};
use crate::video::stats::PipelineStats;
use crate::video::types::Resolution;

const WORKER_THREAD_NAME: &str = "video-decoder";

/// Receives every pipeline event on the worker thread
pub type PipelineSink = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Called once on the worker thread when decoding fails after startup
pub type FatalErrorHandler = Arc<dyn Fn(VideoError) + Send + Sync>;

enum WorkerCommand {
    Chunk(Bytes),
    Quit,
}

/// Handle used by the reader to enqueue chunks
#[derive(Clone)]
pub struct ChunkSender {
    tx: UnboundedSender<WorkerCommand>,
}

impl ChunkSender {
    /// Enqueues a chunk; returns false once the worker has gone away
    pub fn send(&self, chunk: Bytes) -> bool {
        self.tx.send(WorkerCommand::Chunk(chunk)).is_ok()
    }
}

/// Owns the decode thread
pub struct DecodeWorker {
    tx: UnboundedSender<WorkerCommand>,
    quit: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl DecodeWorker {
    /// Starts the worker thread and waits until its decoder exists
    ///
    /// The decoder is created on the new thread. `on_fatal` only covers
    /// failures after that point.
    ///
    /// # Errors
    ///
    /// Returns the factory error if the decoder cannot be created, and
    /// `VideoError::WorkerPanicked` if the factory panics
    pub async fn spawn(
        factory: DecoderFactory,
        resolution: Option<Resolution>,
        stats: Arc<RwLock<PipelineStats>>,
        sink: PipelineSink,
        on_fatal: FatalErrorHandler,
    ) -> VideoResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let quit = Arc::new(AtomicBool::new(false));

        let worker_quit = quit.clone();
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let context = WorkerContext {
                    quit: worker_quit,
                    resolution,
                    stats,
                    sink,
                    on_fatal,
                };
                run(rx, factory, ready_tx, context);
            })?;
        let thread_id = handle.thread().id();

        // On error the thread has already returned
        ready_rx.await.map_err(|_| VideoError::WorkerPanicked)??;

        debug!("Decode worker started");
        Ok(Self {
            tx,
            quit,
            handle: Some(handle),
            thread_id,
        })
    }

    /// Returns a sender for the socket reader
    pub fn sender(&self) -> ChunkSender {
        ChunkSender {
            tx: self.tx.clone(),
        }
    }

    /// Whether the caller is running on the worker thread
    pub fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Signals the worker to quit and waits for it
    ///
    /// Safe to call from the worker itself, in which case it does not wait.
    /// Chunks still queued are discarded.
    pub fn shutdown(mut self) -> VideoResult<()> {
        self.signal_quit();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if self.is_current_thread() {
            debug!("Decode worker stopping itself");
            return Ok(());
        }

        handle.join().map_err(|_| VideoError::WorkerPanicked)?;
        debug!("Decode worker joined");
        Ok(())
    }

    fn signal_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        // Wakes the worker if it is blocked on an empty queue
        let _ = self.tx.send(WorkerCommand::Quit);
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.signal_quit();
        }
    }
}

struct WorkerContext {
    quit: Arc<AtomicBool>,
    resolution: Option<Resolution>,
    stats: Arc<RwLock<PipelineStats>>,
    sink: PipelineSink,
    on_fatal: FatalErrorHandler,
}

fn run(
    mut rx: UnboundedReceiver<WorkerCommand>,
    factory: DecoderFactory,
    ready: oneshot::Sender<VideoResult<()>>,
    context: WorkerContext,
) {
    let WorkerContext {
        quit,
        resolution,
        stats,
        sink,
        on_fatal,
    } = context;

    let decoder = match factory() {
        Ok(decoder) => decoder,
        Err(e) => {
            error!("Failed to create decoder: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };
    debug!("Decoding with {}", decoder.name());
    if ready.send(Ok(())).is_err() {
        debug!("Worker abandoned before start");
        return;
    }

    let mut pipeline = VideoPipeline::new(decoder, resolution).with_stats(stats);

    while let Some(command) = rx.blocking_recv() {
        if quit.load(Ordering::SeqCst) {
            break;
        }
        let WorkerCommand::Chunk(chunk) = command else {
            break;
        };

        match pipeline.feed(&chunk) {
            Ok(events) => {
                for event in events {
                    if quit.load(Ordering::SeqCst) {
                        break;
                    }
                    sink(event);
                }
            }
            Err(e) => {
                error!("Decoder failed: {}", e);
                on_fatal(e);
                break;
            }
        }
    }

    if !quit.load(Ordering::SeqCst) {
        warn!("Decode queue closed without quit signal");
    }
    debug!("Decode worker exiting");
}
