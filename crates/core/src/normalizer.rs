use crate::types::{NormalizedWorkout, WorkoutGuess, UNKNOWN_ACTIVITY};

pub const MAX_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_CALORIES: u32 = 100_000;
pub const MIN_HEART_RATE: u32 = 20;
pub const MAX_HEART_RATE: u32 = 250;

/// Deterministic normalizer turning loosely typed [`WorkoutGuess`] values into
/// bounded [`NormalizedWorkout`] records.
///
/// Out-of-range values are clamped rather than rejected. Missing duration and
/// calories become `0`; missing heart rate and distance stay `None`.
pub struct Normalizer;

impl Normalizer {
    pub fn normalize(guess: &WorkoutGuess) -> NormalizedWorkout {
        let activity_type = guess
            .activity_type
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(UNKNOWN_ACTIVITY)
            .to_string();

        NormalizedWorkout {
            activity_type,
            duration_minutes: round_clamped(guess.duration_minutes, 0, MAX_DURATION_MINUTES)
                .unwrap_or(0),
            calories_burned: round_clamped(guess.calories_burned, 0, MAX_CALORIES).unwrap_or(0),
            heart_rate_avg: round_clamped(guess.heart_rate_avg, MIN_HEART_RATE, MAX_HEART_RATE),
            distance_km: distance(guess.distance_km),
        }
    }
}

fn round_clamped(value: Option<f64>, min: u32, max: u32) -> Option<u32> {
    let value = value.filter(|v| v.is_finite())?;
    let clamped = value.round().clamp(f64::from(min), f64::from(max));
    Some(clamped as u32)
}

fn distance(value: Option<f64>) -> Option<f64> {
    let value = value.filter(|v| v.is_finite())?.max(0.0);
    let rounded = (value * 100.0).round() / 100.0;
    // Scaling overflows near f64::MAX; such values carry no fractional part anyway.
    Some(if rounded.is_finite() { rounded } else { value })
}
