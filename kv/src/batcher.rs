//! Adapts the batch size and flush timeout it uses to drain proposals to the
//! Raft adapter based on recent load, the same load-adaptive batching
//! strategy TiKV's `raftstore` uses for its apply loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::codec::batch_codec::BatchCodec;

#[derive(Debug, Clone, Copy)]
pub struct BatcherConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
    pub load_threshold: f64,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1,
            max_batch_size: 256,
            min_timeout: Duration::from_millis(5),
            max_timeout: Duration::from_millis(20),
            load_threshold: 0.7,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct BatcherStats {
    pub total_proposals: u64,
    pub total_batches: u64,
    pub current_load: f64,
    pub current_batch_size: usize,
    pub current_timeout_ms: u64,
}

struct AdaptiveState {
    cfg: BatcherConfig,
    current_load: f64,
    current_batch_size: usize,
    current_timeout: Duration,
    total_proposals: u64,
    total_batches: u64,
}

impl AdaptiveState {
    fn new(cfg: BatcherConfig) -> Self {
        Self {
            current_load: 0.0,
            current_batch_size: cfg.min_batch_size,
            current_timeout: cfg.max_timeout,
            total_proposals: 0,
            total_batches: 0,
            cfg,
        }
    }

    fn lerp(lo: f64, hi: f64, t: f64) -> f64 {
        lo + (hi - lo) * t.clamp(0.0, 1.0)
    }

    /// Runs one adaptation step given the size of the buffer at the moment
    /// the flush timer fired.
    fn adapt(&mut self, buffered: usize) {
        let instant_load = buffered as f64 / self.cfg.max_batch_size as f64;
        let delta = (instant_load - self.current_load).abs();
        let alpha = if delta > 0.3 {
            0.7
        } else if delta > 0.15 {
            0.5
        } else {
            0.3
        };
        self.current_load = alpha * instant_load + (1.0 - alpha) * self.current_load;

        let effective_load = if instant_load > 0.8 {
            self.current_load.max(self.cfg.load_threshold + 0.1)
        } else {
            self.current_load
        };

        let max = self.cfg.max_batch_size as f64;
        let min = self.cfg.min_batch_size as f64;
        let max_t = self.cfg.max_timeout.as_secs_f64();
        let min_t = self.cfg.min_timeout.as_secs_f64();

        let (batch_size, timeout) = if effective_load > self.cfg.load_threshold {
            let t = (effective_load - self.cfg.load_threshold) / (1.0 - self.cfg.load_threshold);
            (Self::lerp(max / 2.0, max, t), Self::lerp(max_t / 2.0, max_t, t))
        } else {
            let t = effective_load / self.cfg.load_threshold;
            (Self::lerp(min, max / 2.0, t), Self::lerp(min_t, max_t / 2.0, t))
        };

        self.current_batch_size = batch_size.round().max(1.0) as usize;
        self.current_timeout = Duration::from_secs_f64(timeout.max(0.0001));
    }

    fn stats(&self) -> BatcherStats {
        BatcherStats {
            total_proposals: self.total_proposals,
            total_batches: self.total_batches,
            current_load: self.current_load,
            current_batch_size: self.current_batch_size,
            current_timeout_ms: self.current_timeout.as_millis() as u64,
        }
    }
}

/// A single task owning an input channel of opaque proposal bytes and an
/// output channel of framed batch payloads.
pub struct Batcher {
    input_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
}

impl Batcher {
    /// Spawns the batcher loop and returns a handle to feed it proposals,
    /// plus the output channel the Raft adapter reads framed batches from.
    pub fn spawn(cfg: BatcherConfig, input_capacity: usize, output_capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (input_tx, input_rx) = mpsc::channel(input_capacity);
        let (output_tx, output_rx) = mpsc::channel(output_capacity);
        let running = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_loop(cfg, input_rx, output_tx, running.clone()));

        (Self { input_tx, running }, output_rx)
    }

    pub async fn propose(&self, payload: Vec<u8>) -> Result<(), mpsc::error::SendError<Vec<u8>>> {
        self.input_tx.send(payload).await
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn run_loop(
    cfg: BatcherConfig,
    mut input_rx: mpsc::Receiver<Vec<u8>>,
    output_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
) {
    let codec = BatchCodec::new();
    let mut state = AdaptiveState::new(cfg);
    let mut buffer: Vec<Vec<u8>> = Vec::new();
    let mut timer = time::interval_at(Instant::now() + state.current_timeout, state.current_timeout);

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        tokio::select! {
            biased;

            proposal = input_rx.recv() => {
                match proposal {
                    Some(payload) => {
                        buffer.push(payload);
                        state.total_proposals += 1;
                        if buffer.len() >= state.current_batch_size {
                            flush(&codec, &output_tx, &mut buffer, &mut state).await;
                            timer = time::interval_at(Instant::now() + state.current_timeout, state.current_timeout);
                        }
                    }
                    None => break,
                }
            }

            _ = timer.tick() => {
                if !buffer.is_empty() {
                    flush(&codec, &output_tx, &mut buffer, &mut state).await;
                }
                state.adapt(buffer.len());
                log::debug!(
                    "batcher stats: total_proposals={} total_batches={} load={:.3} batch_size={} timeout_ms={}",
                    state.total_proposals, state.total_batches, state.current_load,
                    state.current_batch_size, state.current_timeout.as_millis()
                );
                timer = time::interval_at(Instant::now() + state.current_timeout, state.current_timeout);
            }
        }
    }

    if !buffer.is_empty() {
        flush(&codec, &output_tx, &mut buffer, &mut state).await;
    }
}

async fn flush(codec: &BatchCodec, output_tx: &mpsc::Sender<Vec<u8>>, buffer: &mut Vec<Vec<u8>>, state: &mut AdaptiveState) {
    let batch = std::mem::take(buffer);
    state.total_batches += 1;
    match codec.encode_flush(&batch) {
        Ok(frame) if !frame.is_empty() => {
            if output_tx.send(frame).await.is_err() {
                log::warn!("batcher output channel closed, dropping flushed batch");
            }
        }
        Ok(_) => {}
        Err(err) => log::error!("failed to encode proposal batch: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapt_increases_batch_size_under_sustained_load() {
        let mut state = AdaptiveState::new(BatcherConfig::default());
        for _ in 0..5 {
            state.adapt(200);
        }
        assert!(state.current_batch_size > 1);
        assert!(state.current_timeout >= state.cfg.min_timeout);
    }

    #[test]
    fn adapt_relaxes_back_down_when_idle() {
        let mut state = AdaptiveState::new(BatcherConfig::default());
        for _ in 0..5 {
            state.adapt(256);
        }
        let loaded_batch = state.current_batch_size;
        for _ in 0..10 {
            state.adapt(0);
        }
        assert!(state.current_batch_size <= loaded_batch);
    }

    #[tokio::test]
    async fn propose_then_receive_flushed_batch() {
        let cfg = BatcherConfig { min_batch_size: 2, ..BatcherConfig::default() };
        let (batcher, mut out) = Batcher::spawn(cfg, 16, 16);
        batcher.propose(b"one".to_vec()).await.unwrap();
        batcher.propose(b"two".to_vec()).await.unwrap();

        let frame = out.recv().await.expect("expected a flushed frame");
        let codec = BatchCodec::new();
        let decoded = codec.decode_frame(&frame).unwrap();
        assert_eq!(decoded, vec![b"one".to_vec(), b"two".to_vec()]);
        batcher.stop();
    }
}
