/// Linearly map `value` from `[in_min, in_max]` onto `[out_min, out_max]`.
///
/// No clamping: values outside the input range extrapolate.
pub fn range_map(value: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> f64 {
    (value - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
}

/// [`range_map`] truncated toward zero.
pub fn range_map_int(value: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> i64 {
    range_map(value, in_min, in_max, out_min, out_max).trunc() as i64
}
