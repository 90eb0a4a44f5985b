//! Background batch preparation.
//!
//! A single worker thread drives the source iterator and pushes items into a bounded
//! channel; the consumer sees the exact sequence the source would have produced inline.

use crate::error::MlError;
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;

pub struct Prefetcher<T> {
    rx: Option<Receiver<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Prefetcher<T> {
    /// Spawn a worker that keeps up to `depth` items ready.
    ///
    /// The source moves into the worker, so a failed spawn is an error rather than
    /// an empty stream.
    pub fn spawn<I>(source: I, depth: usize) -> Result<Self, MlError>
    where
        I: Iterator<Item = T> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let worker = std::thread::Builder::new()
            .name("segrun-prefetch".into())
            .spawn(move || {
                for item in source {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| MlError::training(format!("could not spawn prefetch worker: {e}")))?;
        tracing::debug!(depth = depth.max(1), "Prefetch worker started");
        Ok(Self {
            rx: Some(rx),
            worker: Some(worker),
        })
    }
}

impl<T> Iterator for Prefetcher<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl<T> Drop for Prefetcher<T> {
    fn drop(&mut self) {
        // Closing the receiver unblocks a worker waiting on a full channel.
        self.rx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::augment::{AugmentParams, AugmentationPipeline};
    use ndarray::Array4;
    use std::sync::Arc;

    #[test]
    fn test_prefetched_sequence_matches_inline() {
        let data = Arc::new(Array4::from_shape_fn((6, 4, 4, 1), |(i, y, x, _)| {
            (i * 16 + y * 4 + x) as f32
        }));
        let params = AugmentParams {
            rotation_range: 20.0,
            zoom_range: 0.1,
            vertical_flip: true,
        };
        let pipeline = AugmentationPipeline::new(params, 4, 77);

        let inline: Vec<_> = pipeline.flow(data.clone(), data.clone()).take(5).collect();
        let prefetched: Vec<_> = Prefetcher::spawn(pipeline.flow(data.clone(), data), 2)
            .unwrap()
            .take(5)
            .collect();
        assert_eq!(inline, prefetched);
    }

    #[test]
    fn test_drop_stops_infinite_source() {
        let mut prefetcher = Prefetcher::spawn(0u64.., 1).unwrap();
        assert_eq!(prefetcher.next(), Some(0));
        assert_eq!(prefetcher.next(), Some(1));
        drop(prefetcher);
    }
}
