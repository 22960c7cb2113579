//! Pure volume arithmetic. No I/O.

/// Clamp to [0, 1]. NaN maps to silence.
pub fn clamp_unit(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Volume applied to hardware: `clamp(global * individual, 0, 1)`.
///
/// Always recomputed from both factors.
pub fn effective_volume(global: f32, individual: f32) -> f32 {
    clamp_unit(global * individual)
}

/// Individual volume for a device becoming a Target, chosen so that
/// `global * individual` reproduces its current native volume.
///
/// The result is not clamped and may exceed 1.0 (native 0.8 under global 0.5
/// gives 1.6): a device louder than the global volume keeps its level until
/// the user sets an explicit volume, which is clamped. Such a value shows up
/// in `DeviceInfo::individual_volume` and as a percentage above 100. With a
/// global volume of 0 there is no factor that preserves the level, so the
/// native volume is used as-is.
pub fn initial_individual_volume(native: f32, global: f32) -> f32 {
    let native = clamp_unit(native);
    if global > 0.0 {
        native / global
    } else {
        native
    }
}
