//! Code for loading and running a TorchScript export of a YOLO detector

use crate::config::{DeviceChoice, ModelSettings};
use crate::model::{Detector, ModelLoadError, Predictions};
use crate::postprocess::{self, Letterbox, LETTERBOX_FILL};
use crate::upload::Image;
use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::Serialize;
use std::path::PathBuf;
use tch::{no_grad, Cuda, Device, IValue, Kind, Tensor};
use tracing::*;

/// Static facts about the loaded model, reported by the web front end
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub device: String,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub class_names: Vec<String>,
}

/// Load and run a TorchScript detector
#[derive(Debug)]
pub struct TorchDetector {
    /// The loaded torch model
    model: tch::CModule,
    device: Device,
    settings: ModelSettings,
}

impl TorchDetector {
    /// Load the model artifact named in `settings` onto the configured device
    pub fn load(settings: &ModelSettings) -> Result<Self, ModelLoadError> {
        if !settings.path.is_file() {
            return Err(ModelLoadError::Missing(settings.path.clone()));
        }

        let device = select_device(settings.device)?;
        let mut model = tch::CModule::load_on_device(&settings.path, device).map_err(|e| {
            ModelLoadError::Corrupt {
                path: settings.path.clone(),
                reason: e.to_string(),
            }
        })?;
        model.set_eval();

        info!(
            "loaded {:?} on {:?} ({} classes configured)",
            settings.path,
            device,
            settings.class_names.len()
        );

        Ok(TorchDetector {
            model,
            device,
            settings: settings.clone(),
        })
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            path: self.settings.path.clone(),
            device: format!("{:?}", self.device),
            input_size: self.settings.input_size,
            confidence_threshold: self.settings.confidence_threshold,
            iou_threshold: self.settings.iou_threshold,
            max_detections: self.settings.max_detections,
            class_names: self.settings.class_names.clone(),
        }
    }

    /// Forward pass. YOLO exports return either a tensor or a tuple whose
    /// first tensor holds the predictions.
    fn forward(&self, input: Tensor) -> Result<Tensor> {
        let output = no_grad(|| self.model.forward_is(&[IValue::Tensor(input)]))?;
        match output {
            IValue::Tensor(t) => Ok(t),
            IValue::Tuple(items) | IValue::GenericList(items) => items
                .into_iter()
                .find_map(|v| match v {
                    IValue::Tensor(t) => Some(t),
                    _ => None,
                })
                .ok_or_else(|| anyhow!("model returned a tuple without tensors")),
            other => Err(anyhow!("model returned {other:?} instead of a tensor")),
        }
    }
}

impl Detector for TorchDetector {
    #[tracing::instrument(skip_all, fields(width = image.width(), height = image.height()))]
    fn predict(&self, image: &Image) -> Result<Predictions> {
        let letterbox = Letterbox::new(image.width(), image.height(), self.settings.input_size);
        let input = to_input_tensor(&letterbox_image(&image.to_rgb8(), &letterbox))?
            .to_device(self.device);

        let output = self.forward(input)?;

        // Copy to host before reading anything out of it
        let output = output.to_device(Device::Cpu).to_kind(Kind::Float);
        let shape = output.size();
        let data = Vec::<f32>::try_from(output.flatten(0, -1))?;
        debug!("model output shape {shape:?}");

        let class_names = &self.settings.class_names;
        let candidates = postprocess::decode_output(
            &data,
            &shape,
            self.settings.confidence_threshold,
            (!class_names.is_empty()).then_some(class_names.len()),
        )?;
        let kept = postprocess::non_max_suppression(
            candidates,
            self.settings.iou_threshold,
            self.settings.max_detections,
        );

        let mut predictions = Predictions::default();
        for c in kept {
            predictions.classes.push(c.class_id);
            predictions.confidences.push(c.confidence);
            predictions.boxes.push(letterbox.unmap(c.bbox));
        }
        Ok(predictions)
    }

    fn class_names(&self) -> &[String] {
        &self.settings.class_names
    }
}

fn select_device(choice: DeviceChoice) -> Result<Device, ModelLoadError> {
    match choice {
        DeviceChoice::Auto => Ok(Device::cuda_if_available()),
        DeviceChoice::Cpu => Ok(Device::Cpu),
        DeviceChoice::Cuda if Cuda::is_available() => Ok(Device::Cuda(0)),
        DeviceChoice::Cuda => Err(ModelLoadError::Device(
            "cuda was requested but no CUDA device is available".into(),
        )),
    }
}

/// Resize `image` into the square network input, keeping its aspect ratio and
/// padding the rest with gray
fn letterbox_image(image: &RgbImage, letterbox: &Letterbox) -> RgbImage {
    let (w, h) = letterbox.resized;
    let resized = imageops::resize(image, w, h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(
        letterbox.input_size,
        letterbox.input_size,
        Rgb([LETTERBOX_FILL; 3]),
    );
    imageops::replace(
        &mut canvas,
        &resized,
        letterbox.pad_left as i64,
        letterbox.pad_top as i64,
    );
    canvas
}

/// HWC u8 pixels to a `[1, 3, H, W]` float tensor in [0, 1]
fn to_input_tensor(image: &RgbImage) -> Result<Tensor> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let tensor = Tensor::f_from_slice(image.as_raw())?
        .f_view([h, w, 3])?
        .f_permute([2, 0, 1])?
        .f_to_kind(Kind::Float)?
        / 255.;
    Ok(tensor.unsqueeze(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings(path: PathBuf) -> ModelSettings {
        ModelSettings {
            path,
            device: DeviceChoice::Cpu,
            ..ModelSettings::default()
        }
    }

    #[test]
    fn test_missing_artifact() {
        let err = TorchDetector::load(&settings("models/does-not-exist.torchscript".into()))
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::Missing(_)));
    }

    #[test]
    fn test_corrupt_artifact() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not a torchscript archive").unwrap();

        let err = TorchDetector::load(&settings(file.path().to_path_buf())).unwrap_err();
        assert!(matches!(err, ModelLoadError::Corrupt { .. }));
    }

    #[test]
    fn test_letterbox_image_pads_with_gray() {
        let image = RgbImage::from_pixel(200, 100, Rgb([0, 255, 0]));
        let lb = Letterbox::new(200, 100, 64);
        let boxed = letterbox_image(&image, &lb);

        assert_eq!(boxed.dimensions(), (64, 64));
        assert_eq!(boxed.get_pixel(32, 0), &Rgb([LETTERBOX_FILL; 3]));
        assert_eq!(boxed.get_pixel(32, 32), &Rgb([0, 255, 0]));
    }

    #[test]
    fn test_input_tensor_layout() {
        let mut image = RgbImage::from_pixel(4, 2, Rgb([0, 0, 0]));
        image.put_pixel(3, 1, Rgb([255, 51, 0]));
        let t = to_input_tensor(&image).unwrap();

        assert_eq!(t.size(), vec![1, 3, 2, 4]);
        assert!((t.double_value(&[0, 0, 1, 3]) - 1.0).abs() < 1e-6);
        assert!((t.double_value(&[0, 1, 1, 3]) - 0.2).abs() < 1e-6);
        assert_eq!(t.double_value(&[0, 2, 1, 3]), 0.0);
    }
}
