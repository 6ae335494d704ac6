//! The detection model seam and the process-wide model cache. The model is
//! loaded once, on first access, and shared read-only by every request.

use crate::config::ModelSettings;
use crate::torch::TorchDetector;
use crate::upload::Image;
use anyhow::Result;
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// The model artifact could not be turned into a usable model. Fatal.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model artifact not found at {0:?}")]
    Missing(PathBuf),

    #[error("model artifact {path:?} could not be loaded: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("inference device unavailable: {0}")]
    Device(String),
}

/// Raw model output copied to host memory: three parallel sequences, one
/// entry per detection. Boxes are `[x_min, y_min, x_max, y_max]` in pixels of
/// the original image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predictions {
    pub classes: Vec<i64>,
    pub confidences: Vec<f32>,
    pub boxes: Vec<[f32; 4]>,
}

impl Predictions {
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty() && self.confidences.is_empty() && self.boxes.is_empty()
    }
}

/// A pretrained object detector
pub trait Detector: Send + Sync {
    /// Run a forward pass over `image` and return the detections above the
    /// model's own confidence threshold, materialized on the host
    fn predict(&self, image: &Image) -> Result<Predictions>;

    /// Label per class id
    fn class_names(&self) -> &[String];

    fn class_name(&self, class_id: i64) -> Option<&str> {
        usize::try_from(class_id)
            .ok()
            .and_then(|i| self.class_names().get(i))
            .map(String::as_str)
    }
}

/// Load-once cell for a model. Concurrent first callers block until the one
/// load finishes; later callers get the cached handle.
pub struct ModelLoader<M> {
    cell: OnceCell<Arc<M>>,
    loads: AtomicUsize,
}

impl<M> ModelLoader<M> {
    pub const fn new() -> Self {
        ModelLoader {
            cell: OnceCell::new(),
            loads: AtomicUsize::new(0),
        }
    }

    /// Return the cached model, running `load` if nothing is cached yet. A
    /// failed load leaves the cell empty.
    pub fn get_or_load<F>(&self, load: F) -> Result<Arc<M>, ModelLoadError>
    where
        F: FnOnce() -> Result<M, ModelLoadError>,
    {
        self.cell
            .get_or_try_init(|| {
                self.loads.fetch_add(1, Ordering::SeqCst);
                load().map(Arc::new)
            })
            .map(Arc::clone)
    }

    /// Number of times a load was attempted
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl<M> Default for ModelLoader<M> {
    fn default() -> Self {
        Self::new()
    }
}

static MODEL: ModelLoader<TorchDetector> = ModelLoader::new();

/// The process-wide detector. The first call loads it from `settings.path`;
/// later calls return the same instance and ignore `settings`.
pub fn get_model(settings: &ModelSettings) -> Result<Arc<TorchDetector>, ModelLoadError> {
    MODEL.get_or_load(|| {
        info!("loading detection model from {:?}", settings.path);
        TorchDetector::load(settings)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Debug)]
    struct Weights(u32);

    #[test]
    fn test_loads_once() {
        let loader: ModelLoader<Weights> = ModelLoader::new();
        let first = loader.get_or_load(|| Ok(Weights(7))).unwrap();
        for _ in 0..10 {
            let again = loader
                .get_or_load(|| panic!("model must not be reloaded"))
                .unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }
        assert_eq!(first.0, 7);
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_concurrent_first_access() {
        let loader: Arc<ModelLoader<Weights>> = Arc::new(ModelLoader::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let loader = loader.clone();
                thread::spawn(move || loader.get_or_load(|| Ok(Weights(i))).unwrap())
            })
            .collect();
        let models: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(loader.load_count(), 1);
        assert!(models.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_failed_load_is_reported() {
        let loader: ModelLoader<Weights> = ModelLoader::new();
        let err = loader
            .get_or_load(|| Err(ModelLoadError::Missing("best.torchscript".into())))
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::Missing(_)));
        assert!(!loader.is_loaded());
    }

    #[test]
    fn test_predictions_len() {
        let p = Predictions {
            classes: vec![3],
            confidences: vec![0.5],
            boxes: vec![[0.0, 0.0, 1.0, 1.0]],
        };
        assert_eq!(p.len(), 1);
        assert!(!p.is_empty());
        assert!(Predictions::default().is_empty());
    }
}
