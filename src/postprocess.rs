//! Turning a raw YOLO output matrix into detections: candidate decoding,
//! class-aware non-maximum suppression and letterbox geometry.

use std::cmp::Ordering;
use thiserror::Error;

/// Gray used to pad letterboxed inputs
pub const LETTERBOX_FILL: u8 = 114;

#[derive(Debug, Error, PartialEq)]
pub enum OutputShapeError {
    #[error("expected a [1, channels, anchors] output, got shape {0:?}")]
    UnexpectedRank(Vec<i64>),

    #[error("output has {0} channels per anchor, need at least 5 (4 box + 1 class)")]
    TooFewChannels(i64),

    #[error("output shape {shape:?} holds {expected} values, buffer has {actual}")]
    LengthMismatch {
        shape: Vec<i64>,
        expected: usize,
        actual: usize,
    },

    #[error("output shape {shape:?} has no axis of {channels} channels (4 box + {classes} classes)")]
    ClassCountMismatch {
        shape: Vec<i64>,
        channels: i64,
        classes: usize,
    },
}

/// A box that survived the confidence threshold, in network input pixels
/// until mapped back by `Letterbox::unmap`
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub class_id: i64,
    pub confidence: f32,
    pub bbox: [f32; 4],
}

/// Decode a `[1, 4 + nc, N]` (or transposed `[1, N, 4 + nc]`) output. Each
/// anchor is `cx, cy, w, h` followed by one score per class; the best class
/// is kept when its score reaches `conf_threshold`.
///
/// With `num_classes` known, the axis of length `4 + num_classes` is the
/// channel axis. Otherwise the shorter axis is taken as channels.
pub fn decode_output(
    data: &[f32],
    shape: &[i64],
    conf_threshold: f32,
    num_classes: Option<usize>,
) -> Result<Vec<Candidate>, OutputShapeError> {
    let (rows, cols) = match shape {
        [1, a, b] | [a, b] => (*a, *b),
        _ => return Err(OutputShapeError::UnexpectedRank(shape.to_vec())),
    };

    let expected = (rows.max(0) * cols.max(0)) as usize;
    if expected != data.len() {
        return Err(OutputShapeError::LengthMismatch {
            shape: shape.to_vec(),
            expected,
            actual: data.len(),
        });
    }

    let channels_first = match num_classes {
        Some(classes) => {
            let channels = 4 + classes as i64;
            match (rows == channels, cols == channels) {
                (true, _) => true,
                (false, true) => false,
                (false, false) => {
                    return Err(OutputShapeError::ClassCountMismatch {
                        shape: shape.to_vec(),
                        channels,
                        classes,
                    })
                }
            }
        }
        // 4 + nc is usually far below the anchor count
        None => rows <= cols,
    };
    let (channels, anchors) = match channels_first {
        true => (rows as usize, cols as usize),
        false => (cols as usize, rows as usize),
    };
    if channels < 5 {
        return Err(OutputShapeError::TooFewChannels(channels as i64));
    }

    let at = |anchor: usize, channel: usize| match channels_first {
        true => data[channel * anchors + anchor],
        false => data[anchor * channels + channel],
    };

    let mut candidates = vec![];
    for anchor in 0..anchors {
        let (class_id, confidence) = (4..channels)
            .map(|c| (c - 4, at(anchor, c)))
            .fold((0, f32::MIN), |best, cur| match cur.1 > best.1 {
                true => cur,
                false => best,
            });

        if !(confidence >= conf_threshold) {
            continue;
        }

        let (cx, cy, w, h) = (at(anchor, 0), at(anchor, 1), at(anchor, 2), at(anchor, 3));
        candidates.push(Candidate {
            class_id: class_id as i64,
            confidence,
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
        });
    }

    Ok(candidates)
}

/// Intersection over union of two `[x1, y1, x2, y2]` boxes
pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let inter_h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let inter = inter_w * inter_h;
    if inter <= 0.0 {
        return 0.0;
    }
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    inter / (area(a) + area(b) - inter + f32::EPSILON)
}

/// Class-aware NMS. Returns at most `max_det` boxes by descending confidence.
pub fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_det: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
    });

    let mut kept: Vec<Candidate> = vec![];
    for candidate in candidates {
        if kept.len() >= max_det {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_id == candidate.class_id && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

/// How an image was fitted into the square network input: scaled by `scale`
/// and offset by the padding on the left and top.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub input_size: u32,
    pub scale: f32,
    /// Size of the image after scaling, before padding
    pub resized: (u32, u32),
    pub pad_left: u32,
    pub pad_top: u32,
    source: (u32, u32),
}

impl Letterbox {
    pub fn new(width: u32, height: u32, input_size: u32) -> Self {
        let scale = f32::min(
            input_size as f32 / width.max(1) as f32,
            input_size as f32 / height.max(1) as f32,
        );
        let resized_w = ((width as f32 * scale).round() as u32).clamp(1, input_size);
        let resized_h = ((height as f32 * scale).round() as u32).clamp(1, input_size);

        Letterbox {
            input_size,
            scale,
            resized: (resized_w, resized_h),
            pad_left: (input_size - resized_w) / 2,
            pad_top: (input_size - resized_h) / 2,
            source: (width, height),
        }
    }

    /// Map a box from network input pixels back onto the source image,
    /// clamped to its bounds
    pub fn unmap(&self, bbox: [f32; 4]) -> [f32; 4] {
        let (w, h) = (self.source.0 as f32, self.source.1 as f32);
        let x = |v: f32| ((v - self.pad_left as f32) / self.scale).clamp(0.0, w);
        let y = |v: f32| ((v - self.pad_top as f32) / self.scale).clamp(0.0, h);
        [x(bbox[0]), y(bbox[1]), x(bbox[2]), y(bbox[3])]
    }
}
