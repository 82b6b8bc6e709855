//! Moisture scoring: turns a raw reading and a plot's ideal moisture into a
//! percentage score and a Dry / Optimal / Oversaturated classification.

use serde::Serialize;

/// Scores below this are Dry.
pub const DRY_BELOW: i64 = 80;
/// Scores above this are Oversaturated.
pub const OVERSATURATED_ABOVE: i64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Dry,
    Optimal,
    Oversaturated,
}

impl Status {
    /// Whether this status should raise an alert.
    pub fn needs_attention(self) -> bool {
        !matches!(self, Status::Optimal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Green,
    Blue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub score: i64,
    pub status: Status,
    pub color: Color,
}

/// Score a reading against the plot's ideal moisture.
///
/// `score = floor(moisture * 100 / ideal)`, computed in integers so that
/// ratios such as 29/100 land on 29 rather than 28.999…
/// An ideal of zero is degenerate and always classifies as Dry with score 0.
pub fn evaluate(moisture: i64, ideal: i64) -> Evaluation {
    if ideal == 0 {
        return Evaluation {
            score: 0,
            status: Status::Dry,
            color: Color::Red,
        };
    }

    let score = floor_div(moisture.saturating_mul(100), ideal);

    let (status, color) = if score < DRY_BELOW {
        (Status::Dry, Color::Red)
    } else if score > OVERSATURATED_ABOVE {
        (Status::Oversaturated, Color::Blue)
    } else {
        (Status::Optimal, Color::Green)
    };

    Evaluation {
        score,
        status,
        color,
    }
}

fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

// ===========================================================================
// Tests
// ===========================================================================
