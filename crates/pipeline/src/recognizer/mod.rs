//! Recognizer pool
//!
//! A bounded set of inference engines shared by all concurrent callers.
//! Slot bookkeeping lives under one mutex + condvar; inference itself runs
//! outside the lock, so up to `pool_size` decodes proceed in parallel while
//! further callers wait in arrival order.

pub mod transducer;

use asr_config::Settings;
use parking_lot::{Condvar, Mutex};

use crate::error::PipelineError;
use self::transducer::TransducerEngine;

/// One recognition engine. Implementations must be callable from any thread;
/// the pool guarantees at most one in-flight call per engine.
pub trait RecognizerEngine: Send + Sync {
    fn transcribe(&self, audio: &[f32], sample_rate: u32) -> Result<String, PipelineError>;
}

/// Bounded pool of recognizer slots with fair blocking acquisition.
pub struct RecognizerPool {
    engines: Vec<Box<dyn RecognizerEngine>>,
    in_use: Mutex<Vec<bool>>,
    available: Condvar,
}

impl RecognizerPool {
    /// Build a pool over pre-constructed engines.
    pub fn new(engines: Vec<Box<dyn RecognizerEngine>>) -> Self {
        let slots = engines.len();
        Self {
            engines,
            in_use: Mutex::new(vec![false; slots]),
            available: Condvar::new(),
        }
    }

    /// Build a pool of ONNX transducer engines from settings.
    ///
    /// All-or-nothing: if any slot fails to initialize, the error aborts
    /// startup and previously-built slots are dropped. No partial pool ever
    /// exists.
    pub fn from_settings(settings: &Settings) -> Result<Self, PipelineError> {
        let pool_size = settings.model.recognizer_pool_size.max(1);
        let threads_per_slot = (settings.model.num_threads / pool_size).max(1);

        let mut engines: Vec<Box<dyn RecognizerEngine>> = Vec::with_capacity(pool_size);
        for slot in 0..pool_size {
            let engine = TransducerEngine::load(
                &settings.model,
                threads_per_slot,
                settings.audio.sample_rate,
            )
            .map_err(|e| {
                PipelineError::Model(format!(
                    "failed to create recognizer slot {slot} (model_dir={}): {e}",
                    settings.model.model_dir
                ))
            })?;
            engines.push(Box::new(engine));
        }

        tracing::info!(
            pool_size,
            threads_per_slot,
            provider = %settings.model.provider,
            "recognizer pool initialized"
        );
        Ok(Self::new(engines))
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.engines.len()
    }

    /// Recognize an utterance, blocking until a slot is free.
    ///
    /// Empty audio returns an empty string without touching the pool. A
    /// failure to set up the per-call inference stream also yields an empty
    /// string (observed as a silence segment upstream); every other engine
    /// error propagates.
    pub fn recognize(&self, audio: &[f32], sample_rate: u32) -> Result<String, PipelineError> {
        if audio.is_empty() {
            return Ok(String::new());
        }

        let slot = self.acquire();
        let result = self.engines[slot].transcribe(audio, sample_rate);
        self.release(slot);

        match result {
            Ok(mut text) => {
                trim_ascii_in_place(&mut text);
                Ok(text)
            }
            Err(PipelineError::StreamInit(msg)) => {
                tracing::error!(error = %msg, "failed to create inference stream");
                Ok(String::new())
            }
            Err(e) => Err(e),
        }
    }

    fn acquire(&self) -> usize {
        let mut in_use = self.in_use.lock();
        loop {
            if let Some(slot) = in_use.iter().position(|used| !used) {
                in_use[slot] = true;
                return slot;
            }
            self.available.wait(&mut in_use);
        }
    }

    fn release(&self, slot: usize) {
        {
            let mut in_use = self.in_use.lock();
            in_use[slot] = false;
        }
        self.available.notify_one();
    }
}

/// Trim ASCII whitespace from both ends without reallocating.
fn trim_ascii_in_place(text: &mut String) {
    let end = text.trim_end_matches(|c: char| c.is_ascii_whitespace()).len();
    text.truncate(end);
    let start = text.len() - text.trim_start_matches(|c: char| c.is_ascii_whitespace()).len();
    if start > 0 {
        text.drain(..start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeEngine {
        text: String,
        delay: Duration,
        calls: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl RecognizerEngine for FakeEngine {
        fn transcribe(&self, _audio: &[f32], _sample_rate: u32) -> Result<String, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.text.clone())
        }
    }

    struct Counters {
        calls: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    fn fake_pool(slots: usize, delay: Duration, text: &str) -> (Arc<RecognizerPool>, Counters) {
        let counters = Counters {
            calls: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        };
        let engines: Vec<Box<dyn RecognizerEngine>> = (0..slots)
            .map(|_| {
                Box::new(FakeEngine {
                    text: text.to_string(),
                    delay,
                    calls: counters.calls.clone(),
                    active: counters.active.clone(),
                    peak: counters.peak.clone(),
                }) as Box<dyn RecognizerEngine>
            })
            .collect();
        (Arc::new(RecognizerPool::new(engines)), counters)
    }

    #[test]
    fn empty_audio_skips_the_pool() {
        let (pool, counters) = fake_pool(1, Duration::ZERO, "text");
        assert_eq!(pool.recognize(&[], 16000).unwrap(), "");
        assert_eq!(counters.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn result_is_trimmed() {
        let (pool, _) = fake_pool(1, Duration::ZERO, "  hello world \t\n");
        assert_eq!(pool.recognize(&[0.0; 16], 16000).unwrap(), "hello world");
    }

    #[test]
    fn concurrency_is_bounded_by_pool_size() {
        let (pool, counters) = fake_pool(2, Duration::from_millis(50), "ok");

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.recognize(&[0.0; 16], 16000).unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), "ok");
        }
        assert_eq!(counters.calls.load(Ordering::SeqCst), 4);
        assert!(counters.peak.load(Ordering::SeqCst) <= 2, "more than two decodes in flight");
        assert_eq!(counters.active.load(Ordering::SeqCst), 0);
    }

    struct StreamInitEngine;
    impl RecognizerEngine for StreamInitEngine {
        fn transcribe(&self, _audio: &[f32], _sample_rate: u32) -> Result<String, PipelineError> {
            Err(PipelineError::StreamInit("no stream".to_string()))
        }
    }

    #[test]
    fn stream_init_failure_yields_empty_text() {
        let pool = RecognizerPool::new(vec![Box::new(StreamInitEngine)]);
        assert_eq!(pool.recognize(&[0.0; 16], 16000).unwrap(), "");
        // The slot must be free again afterwards.
        assert_eq!(pool.recognize(&[0.0; 16], 16000).unwrap(), "");
    }

    struct FailingEngine;
    impl RecognizerEngine for FailingEngine {
        fn transcribe(&self, _audio: &[f32], _sample_rate: u32) -> Result<String, PipelineError> {
            Err(PipelineError::Model("boom".to_string()))
        }
    }

    #[test]
    fn model_errors_propagate_and_release_the_slot() {
        let pool = RecognizerPool::new(vec![Box::new(FailingEngine)]);
        assert!(pool.recognize(&[0.0; 16], 16000).is_err());
        assert!(pool.recognize(&[0.0; 16], 16000).is_err());
    }

    #[test]
    fn trim_ascii_in_place_handles_all_whitespace() {
        let mut s = " \t\r\n ".to_string();
        trim_ascii_in_place(&mut s);
        assert_eq!(s, "");

        let mut s = "дом".to_string();
        trim_ascii_in_place(&mut s);
        assert_eq!(s, "дом");
    }
}
