//! The detection pipeline: run the model over a decoded upload, check what
//! came back, and render the annotated copy.

use crate::annotate::Annotator;
use crate::model::{Detector, Predictions};
use crate::upload::Image;
use image::RgbImage;
use std::borrow::Cow;
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::*;

/// Inference failed for this request. The model stays usable.
#[derive(Debug, Error)]
pub enum DetectionRuntimeError {
    #[error("inference failed: {0:#}")]
    Inference(#[from] anyhow::Error),

    #[error("model returned invalid predictions: {0}")]
    InvalidPredictions(String),

    #[error("inference aborted: {0}")]
    Panicked(String),
}

/// One detected region
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_id: i64,
    pub label: Option<String>,
    pub confidence: f32,
    /// `[x_min, y_min, x_max, y_max]` in pixels of the input image
    pub bbox: [f32; 4],
}

/// The detections of one inference call and the image they were drawn on
#[derive(Debug, Clone)]
pub struct DetectionResult {
    detections: Vec<Detection>,
    annotated: RgbImage,
}

impl DetectionResult {
    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn classes(&self) -> Vec<i64> {
        self.detections.iter().map(|d| d.class_id).collect()
    }

    pub fn confidences(&self) -> Vec<f32> {
        self.detections.iter().map(|d| d.confidence).collect()
    }

    pub fn boxes(&self) -> Vec<[f32; 4]> {
        self.detections.iter().map(|d| d.bbox).collect()
    }

    pub fn labels(&self) -> Vec<Option<String>> {
        self.detections.iter().map(|d| d.label.clone()).collect()
    }

    /// The input image with boxes and labels drawn on it
    pub fn annotated(&self) -> &RgbImage {
        &self.annotated
    }
}

/// What a detection request produced
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The model found nothing above its threshold
    Empty,
    Detected(DetectionResult),
}

/// Check the three sequences line up and every confidence is a probability
pub fn validate(predictions: &Predictions) -> Result<(), DetectionRuntimeError> {
    let (n_cls, n_conf, n_box) = (
        predictions.classes.len(),
        predictions.confidences.len(),
        predictions.boxes.len(),
    );
    if n_cls != n_conf || n_cls != n_box {
        return Err(DetectionRuntimeError::InvalidPredictions(format!(
            "{n_cls} classes, {n_conf} confidences and {n_box} boxes"
        )));
    }

    if let Some(bad) = predictions
        .confidences
        .iter()
        .find(|c| !(0.0..=1.0).contains(*c))
    {
        return Err(DetectionRuntimeError::InvalidPredictions(format!(
            "confidence {bad} is outside [0, 1]"
        )));
    }

    Ok(())
}

/// Run `model` over `image`. Zero detections is `Outcome::Empty`; anything
/// that goes wrong in the model, including a panic in the backend, is a
/// `DetectionRuntimeError`.
pub fn detect(
    model: &dyn Detector,
    annotator: &Annotator,
    image: &Image,
) -> Result<Outcome, DetectionRuntimeError> {
    let predictions = panic::catch_unwind(AssertUnwindSafe(|| model.predict(image)))
        .map_err(|payload| DetectionRuntimeError::Panicked(panic_message(payload.as_ref())))??;

    validate(&predictions)?;

    if predictions.is_empty() {
        info!("no detections");
        return Ok(Outcome::Empty);
    }

    let label = |class_id: i64| match model.class_name(class_id) {
        Some(name) => Cow::Borrowed(name),
        None => Cow::Owned(format!("class {class_id}")),
    };
    let annotated = annotator.plot(&image.to_rgb8(), &predictions, label);

    let Predictions {
        classes,
        confidences,
        boxes,
    } = predictions;
    let detections: Vec<Detection> = classes
        .into_iter()
        .zip(confidences)
        .zip(boxes)
        .map(|((class_id, confidence), bbox)| Detection {
            class_id,
            label: model.class_name(class_id).map(str::to_owned),
            confidence,
            bbox,
        })
        .collect();

    info!("{} detections", detections.len());
    Ok(Outcome::Detected(DetectionResult {
        detections,
        annotated,
    }))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "the inference backend panicked".into()
    }
}
