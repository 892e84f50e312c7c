//! # Frames and Windows
//!
//! A [`Frame`] is one time step of hand-pose features (two hands × 21 landmarks × xyz = 126
//! values). A [`Window`] is the fixed run of consecutive frames the classifier scores as a
//! unit. Both types can only be built through validating constructors, so any `Frame` or
//! `Window` in the pipeline already satisfies its shape invariant.

use std::fmt;

/// Values per frame.
pub const FRAME_LEN: usize = 126;

/// Frames per classification window.
pub const WINDOW_FRAMES: usize = 10;

/// Values in a flattened window (a pre-batched submission).
pub const WINDOW_LEN: usize = FRAME_LEN * WINDOW_FRAMES;

/// Reasons a sequence of values cannot become a [`Frame`] or [`Window`].
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeError {
    /// Wrong number of values.
    Length { expected: usize, actual: usize },
    /// NaN or infinity at the given position.
    NonFinite { index: usize },
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::Length { expected, actual } => {
                write!(f, "expected {} values, got {}", expected, actual)
            }
            ShapeError::NonFinite { index } => {
                write!(f, "value at index {} is not a finite number", index)
            }
        }
    }
}

impl std::error::Error for ShapeError {}

/// One validated 126-value feature vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame(Vec<f32>);

impl Frame {
    pub fn from_vec(values: Vec<f32>) -> Result<Self, ShapeError> {
        if values.len() != FRAME_LEN {
            return Err(ShapeError::Length {
                expected: FRAME_LEN,
                actual: values.len(),
            });
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(ShapeError::NonFinite { index });
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }

    pub fn non_zero_count(&self) -> usize {
        count_non_zero(&self.0)
    }
}

/// Exactly [`WINDOW_FRAMES`] frames, oldest first.
#[derive(Debug, Clone, PartialEq)]
pub struct Window(Vec<Frame>);

impl Window {
    pub fn from_frames(frames: Vec<Frame>) -> Result<Self, ShapeError> {
        if frames.len() != WINDOW_FRAMES {
            return Err(ShapeError::Length {
                expected: WINDOW_FRAMES,
                actual: frames.len(),
            });
        }
        Ok(Self(frames))
    }

    /// Reshape a flat `[WINDOW_LEN]` slice into `[WINDOW_FRAMES][FRAME_LEN]`.
    pub fn from_flat(values: &[f32]) -> Result<Self, ShapeError> {
        if values.len() != WINDOW_LEN {
            return Err(ShapeError::Length {
                expected: WINDOW_LEN,
                actual: values.len(),
            });
        }
        let frames = values
            .chunks_exact(FRAME_LEN)
            .enumerate()
            .map(|(i, chunk)| {
                Frame::from_vec(chunk.to_vec()).map_err(|err| match err {
                    ShapeError::NonFinite { index } => ShapeError::NonFinite {
                        index: i * FRAME_LEN + index,
                    },
                    other => other,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_frames(frames)
    }

    pub fn frames(&self) -> &[Frame] {
        &self.0
    }

    /// Row-major copy of all values, `WINDOW_LEN` long.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(WINDOW_LEN);
        for frame in &self.0 {
            flat.extend_from_slice(frame.values());
        }
        flat
    }

    pub fn non_zero_count(&self) -> usize {
        self.0.iter().map(Frame::non_zero_count).sum()
    }

    pub fn non_zero_percent(&self) -> f32 {
        self.non_zero_count() as f32 / WINDOW_LEN as f32 * 100.0
    }

    /// Mean absolute element-wise difference between consecutive frames,
    /// averaged over all frame pairs. Near zero means the client sent the same
    /// frame repeatedly.
    pub fn mean_frame_difference(&self) -> f32 {
        let pairs = self.0.windows(2);
        let count = pairs.len();
        if count == 0 {
            return 0.0;
        }
        let total: f32 = self
            .0
            .windows(2)
            .map(|pair| {
                let diff: f32 = pair[0]
                    .values()
                    .iter()
                    .zip(pair[1].values())
                    .map(|(a, b)| (a - b).abs())
                    .sum();
                diff / FRAME_LEN as f32
            })
            .sum();
        total / count as f32
    }
}

pub fn count_non_zero(values: &[f32]) -> usize {
    values.iter().filter(|v| **v != 0.0).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(non_zero: usize, value: f32) -> Frame {
        let mut values = vec![0.0; FRAME_LEN];
        for v in values.iter_mut().take(non_zero) {
            *v = value;
        }
        Frame::from_vec(values).unwrap()
    }

    #[test]
    fn test_frame_length_is_enforced() {
        assert!(Frame::from_vec(vec![0.5; FRAME_LEN]).is_ok());
        assert_eq!(
            Frame::from_vec(vec![0.5; 125]),
            Err(ShapeError::Length { expected: FRAME_LEN, actual: 125 })
        );
    }

    #[test]
    fn test_frame_rejects_non_finite() {
        let mut values = vec![0.1; FRAME_LEN];
        values[7] = f32::NAN;
        assert_eq!(Frame::from_vec(values), Err(ShapeError::NonFinite { index: 7 }));
    }

    #[test]
    fn test_window_from_flat_keeps_frame_order() {
        let values: Vec<f32> = (0..WINDOW_LEN).map(|i| (i / FRAME_LEN) as f32).collect();
        let window = Window::from_flat(&values).unwrap();
        assert_eq!(window.frames().len(), WINDOW_FRAMES);
        assert_eq!(window.frames()[0].values()[0], 0.0);
        assert_eq!(window.frames()[9].values()[FRAME_LEN - 1], 9.0);
        assert_eq!(window.flatten(), values);
    }

    #[test]
    fn test_window_non_finite_index_is_global() {
        let mut values = vec![0.0; WINDOW_LEN];
        values[FRAME_LEN * 3 + 2] = f32::INFINITY;
        assert_eq!(
            Window::from_flat(&values),
            Err(ShapeError::NonFinite { index: FRAME_LEN * 3 + 2 })
        );
    }

    #[test]
    fn test_non_zero_counts() {
        let frames: Vec<Frame> = (0..WINDOW_FRAMES).map(|_| frame_with(3, 1.0)).collect();
        let window = Window::from_frames(frames).unwrap();
        assert_eq!(window.non_zero_count(), 30);
        assert!((window.non_zero_percent() - 30.0 / 12.6).abs() < 1e-4);
    }

    #[test]
    fn test_duplicate_frames_have_zero_difference() {
        let frames: Vec<Frame> = (0..WINDOW_FRAMES).map(|_| frame_with(20, 0.3)).collect();
        let window = Window::from_frames(frames).unwrap();
        assert_eq!(window.mean_frame_difference(), 0.0);

        let frames: Vec<Frame> = (0..WINDOW_FRAMES)
            .map(|i| frame_with(FRAME_LEN, i as f32))
            .collect();
        let window = Window::from_frames(frames).unwrap();
        assert!((window.mean_frame_difference() - 1.0).abs() < 1e-6);
    }
}
