use crate::pipeline::{DetectionResult, Outcome};
use anyhow::Result;
use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::Cursor;

/// An uploaded file, encoded as base 64
#[derive(Serialize, Deserialize)]
pub struct Upload {
    /// Name of the file on the user's machine, used for the extension check
    pub filename: Option<String>,
    pub image: String,
}

impl Debug for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Upload {{ filename: {:?}, image: <{} base64 chars> }}",
            self.filename,
            self.image.len()
        )
    }
}

impl Upload {
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        general_purpose::STANDARD.decode(self.image.trim())
    }
}

/// A PNG image, encoded as base 64
#[derive(Debug, Serialize, Deserialize)]
pub struct B64Image {
    pub image: String,
    pub height: u32,
    pub width: u32,
}

impl B64Image {
    pub fn png(pixels: &DynamicImage) -> Result<Self> {
        let mut data: Vec<u8> = Vec::new();
        pixels.write_to(&mut Cursor::new(&mut data), ImageFormat::Png)?;
        Ok(B64Image {
            image: general_purpose::STANDARD.encode(data),
            height: pixels.height(),
            width: pixels.width(),
        })
    }
}

/// Response to a detection request
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DetectResponse {
    Empty {
        message: String,
    },
    Detected {
        classes: Vec<i64>,
        confidences: Vec<f32>,
        boxes: Vec<[f32; 4]>,
        labels: Vec<Option<String>>,
        annotated: B64Image,
    },
}

impl DetectResponse {
    pub fn from_outcome(outcome: Outcome, empty_message: &str) -> Result<Self> {
        match outcome {
            Outcome::Empty => Ok(DetectResponse::Empty {
                message: empty_message.to_string(),
            }),
            Outcome::Detected(result) => Self::detected(result),
        }
    }

    fn detected(result: DetectionResult) -> Result<Self> {
        let annotated = B64Image::png(&DynamicImage::ImageRgb8(result.annotated().clone()))?;
        Ok(DetectResponse::Detected {
            classes: result.classes(),
            confidences: result.confidences(),
            boxes: result.boxes(),
            labels: result.labels(),
            annotated,
        })
    }
}
