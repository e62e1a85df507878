use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::inference::{INPUT_DIM, TARGET_FRAMES};

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    /// Nested landmark array, expected shape (100, 225). Validated by
    /// `parse_sequence`, not by the deserializer.
    pub sequence: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        ErrorBody {
            error: message.into(),
        }
    }
}

/// Converts the `sequence` JSON value into a flat row-major (100 * 225)
/// buffer, rejecting anything that is not exactly a 100x225 numeric matrix.
pub fn parse_sequence(value: &Value) -> Result<Vec<f32>, String> {
    let frames = value
        .as_array()
        .ok_or_else(|| "`sequence` must be a nested array of frames".to_string())?;

    let mut flat = Vec::with_capacity(TARGET_FRAMES * INPUT_DIM);
    let mut width = None;
    for (i, frame) in frames.iter().enumerate() {
        let row = match frame.as_array() {
            Some(row) => row,
            // a flat numeric list parsed as a 1-D sequence, not one frame short
            None if frame.is_number() => return Err(shape_mismatch(&[frames.len()])),
            None => return Err(format!("frame {} is not an array of numbers", i)),
        };
        match width {
            None => width = Some(row.len()),
            Some(w) if w != row.len() => {
                return Err(format!(
                    "frame {} has {} values but frame 0 has {}",
                    i,
                    row.len(),
                    w
                ));
            }
            _ => {}
        }
        for (j, cell) in row.iter().enumerate() {
            let x = cell
                .as_f64()
                .ok_or_else(|| format!("frame {} value {} is not numeric", i, j))?;
            flat.push(x as f32);
        }
    }

    let width = width.unwrap_or(0);
    if frames.len() != TARGET_FRAMES || width != INPUT_DIM {
        return Err(shape_mismatch(&[frames.len(), width]));
    }
    Ok(flat)
}

fn shape_mismatch(got: &[usize]) -> String {
    let dims = got
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "input sequence shape mismatch: got ({}), expected ({}, {})",
        dims, TARGET_FRAMES, INPUT_DIM
    )
}
