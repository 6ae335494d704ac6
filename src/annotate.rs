//! Drawing detections onto a copy of the input image

use crate::config::AnnotateSettings;
use crate::model::Predictions;
use ab_glyph::{Font, FontArc, PxScale, ScaleFont};
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::info;

const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Box colours, indexed by class id
const PALETTE: [[u8; 3]; 20] = [
    [0xFF, 0x38, 0x38],
    [0xFF, 0x9D, 0x97],
    [0xFF, 0x70, 0x1F],
    [0xFF, 0xB2, 0x1D],
    [0xCF, 0xD2, 0x31],
    [0x48, 0xF9, 0x0A],
    [0x92, 0xCC, 0x17],
    [0x3D, 0xDB, 0x86],
    [0x1A, 0x93, 0x34],
    [0x00, 0xD4, 0xBB],
    [0x2C, 0x99, 0xA8],
    [0x00, 0xC2, 0xFF],
    [0x34, 0x45, 0x93],
    [0x64, 0x73, 0xFF],
    [0x00, 0x18, 0xEC],
    [0x84, 0x38, 0xFF],
    [0x52, 0x00, 0x85],
    [0xCB, 0x38, 0xFF],
    [0xFF, 0x95, 0xC8],
    [0xFF, 0x37, 0xC7],
];

pub fn class_color(class_id: i64) -> Rgb<u8> {
    Rgb(PALETTE[class_id.rem_euclid(PALETTE.len() as i64) as usize])
}

/// Embedded default label font (DejaVu Sans)
const DEFAULT_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Box outline width for an image, as Ultralytics plots it
pub fn auto_line_width(width: u32, height: u32) -> u32 {
    (((width + height) as f32 / 2.0 * 0.003).round() as u32).max(2)
}

/// Renders boxes and labels
pub struct Annotator {
    font: FontArc,
    /// Fixed outline width; scaled with the image when unset
    line_width: Option<u32>,
}

impl Annotator {
    pub fn new(settings: &AnnotateSettings) -> Result<Self> {
        let font = match &settings.font_path {
            Some(path) => {
                let data = std::fs::read(path)
                    .with_context(|| format!("reading label font {path:?}"))?;
                let font = FontArc::try_from_vec(data)
                    .with_context(|| format!("parsing label font {path:?}"))?;
                info!("loaded label font {path:?}");
                font
            }
            None => FontArc::try_from_slice(DEFAULT_FONT).context("parsing embedded label font")?,
        };

        Ok(Annotator {
            font,
            line_width: settings.line_width.map(|w| w.max(1)),
        })
    }

    /// A copy of `image` with every prediction drawn on it. `label` maps a
    /// class id to the text shown next to the confidence.
    pub fn plot<'a>(
        &self,
        image: &RgbImage,
        predictions: &Predictions,
        label: impl Fn(i64) -> std::borrow::Cow<'a, str>,
    ) -> RgbImage {
        let mut canvas = image.clone();
        let line_width = self
            .line_width
            .unwrap_or_else(|| auto_line_width(image.width(), image.height()));
        let detections = predictions
            .classes
            .iter()
            .zip(&predictions.confidences)
            .zip(&predictions.boxes);

        for ((class_id, confidence), bbox) in detections {
            let color = class_color(*class_id);
            let Some(rect) = draw_box(&mut canvas, bbox, color, line_width) else {
                continue;
            };
            let text = format!("{} {:.2}", label(*class_id), confidence);
            self.draw_label(&mut canvas, rect, &text, color);
        }

        canvas
    }

    /// Filled tag above the box (inside it when there is no room above)
    fn draw_label(&self, canvas: &mut RgbImage, rect: Rect, text: &str, color: Rgb<u8>) {
        let scale = PxScale::from(LABEL_FONT_SIZE);
        let (tw, _) = text_size(scale, &self.font, text);
        // a full line, so descenders stay on the tag
        let line = self.font.as_scaled(scale);
        let th = (line.ascent() - line.descent()).ceil() as u32;
        let (tag_w, tag_h) = (tw + 2 * LABEL_PADDING as u32, th + 2 * LABEL_PADDING as u32);

        let x = rect.left();
        let y = match rect.top() - tag_h as i32 >= 0 {
            true => rect.top() - tag_h as i32,
            false => rect.top(),
        };
        let tag_w = tag_w.min((canvas.width() as i32 - x).max(1) as u32);
        draw_filled_rect_mut(canvas, Rect::at(x, y).of_size(tag_w, tag_h), color);

        draw_text_mut(
            canvas,
            TEXT_COLOR,
            x + LABEL_PADDING,
            y + LABEL_PADDING,
            scale,
            &self.font,
            text,
        );
    }
}

/// Outline `bbox`, thickened inwards. Returns the outer rectangle, or
/// `None` when the box is empty after clamping to the canvas.
fn draw_box(
    canvas: &mut RgbImage,
    bbox: &[f32; 4],
    color: Rgb<u8>,
    line_width: u32,
) -> Option<Rect> {
    let (w, h) = (canvas.width() as i32, canvas.height() as i32);
    let x_min = (bbox[0].floor() as i32).clamp(0, w - 1);
    let y_min = (bbox[1].floor() as i32).clamp(0, h - 1);
    let x_max = (bbox[2].ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox[3].ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
        return None;
    }

    let outer = Rect::at(x_min, y_min)
        .of_size((x_max - x_min + 1) as u32, (y_max - y_min + 1) as u32);
    for t in 0..line_width as i32 {
        let (rw, rh) = (outer.width() as i32 - 2 * t, outer.height() as i32 - 2 * t);
        if rw <= 0 || rh <= 0 {
            break;
        }
        let rect = Rect::at(x_min + t, y_min + t).of_size(rw as u32, rh as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }
    Some(outer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn annotator() -> Annotator {
        Annotator::new(&AnnotateSettings::default()).unwrap()
    }

    #[test]
    fn test_plot_keeps_dimensions_and_draws() {
        let image = RgbImage::from_pixel(120, 90, Rgb([0, 0, 0]));
        let predictions = Predictions {
            classes: vec![2],
            confidences: vec![0.9],
            boxes: vec![[10.0, 40.0, 80.0, 80.0]],
        };
        let plotted =
            annotator().plot(&image, &predictions, |id| Cow::Owned(format!("class {id}")));

        assert_eq!(plotted.dimensions(), (120, 90));
        // left edge of the box
        assert_eq!(plotted.get_pixel(10, 60), &class_color(2));
        // inside the box is untouched
        assert_eq!(plotted.get_pixel(45, 60), &Rgb([0, 0, 0]));
        // the input is not modified
        assert_eq!(image.get_pixel(10, 60), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_label_text_is_drawn() {
        let image = RgbImage::from_pixel(200, 120, Rgb([0, 0, 0]));
        let predictions = Predictions {
            classes: vec![0],
            confidences: vec![0.91],
            boxes: vec![[20.0, 50.0, 180.0, 110.0]],
        };
        let annotator = annotator();
        let calcium = annotator.plot(&image, &predictions, |_| Cow::Borrowed("Calcium"));
        let potassium = annotator.plot(&image, &predictions, |_| Cow::Borrowed("Potassium"));

        // the tag sits above the box; white text lifts the green channel
        // well over the tag colour's
        let tag_color = class_color(0);
        let text_pixels = (20..180)
            .flat_map(|x| (0..50).map(move |y| (x, y)))
            .filter(|&(x, y)| calcium.get_pixel(x, y)[1] > tag_color[1].saturating_add(100))
            .count();
        assert!(text_pixels > 10, "only {text_pixels} text pixels");
        assert_ne!(calcium, potassium);
    }

    #[test]
    fn test_line_width_scales_with_image() {
        assert_eq!(auto_line_width(64, 48), 2);
        assert_eq!(auto_line_width(640, 640), 2);
        assert_eq!(auto_line_width(2000, 1500), 5);

        let image = RgbImage::from_pixel(2000, 1500, Rgb([0, 0, 0]));
        let predictions = Predictions {
            classes: vec![1],
            confidences: vec![0.8],
            boxes: vec![[100.0, 200.0, 900.0, 1000.0]],
        };
        let plotted = annotator().plot(&image, &predictions, |_| Cow::Borrowed("x"));
        // five pixels of outline on the left edge, then the interior
        assert_eq!(plotted.get_pixel(104, 600), &class_color(1));
        assert_eq!(plotted.get_pixel(105, 600), &Rgb([0, 0, 0]));

        let fixed = Annotator::new(&AnnotateSettings {
            font_path: None,
            line_width: Some(1),
        })
        .unwrap();
        let plotted = fixed.plot(&image, &predictions, |_| Cow::Borrowed("x"));
        assert_eq!(plotted.get_pixel(101, 600), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_degenerate_box_is_skipped() {
        let image = RgbImage::from_pixel(16, 16, Rgb([7, 7, 7]));
        let predictions = Predictions {
            classes: vec![0],
            confidences: vec![0.5],
            boxes: vec![[30.0, 30.0, 40.0, 40.0]],
        };
        let plotted = annotator().plot(&image, &predictions, |_| Cow::Borrowed("x"));
        assert_eq!(plotted, image);
    }

    #[test]
    fn test_missing_font_is_an_error() {
        let settings = AnnotateSettings {
            font_path: Some("/nonexistent/font.ttf".into()),
            line_width: None,
        };
        assert!(Annotator::new(&settings).is_err());
    }

    #[test]
    fn test_palette_wraps() {
        assert_eq!(class_color(0), class_color(20));
        assert_eq!(class_color(-1), class_color(19));
    }
}
