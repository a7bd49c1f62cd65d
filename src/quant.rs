//! Scalar quantization with a dead zone (Annex E). New code: the teacher
//! only dequantizes (it's decode-only), so the forward step and the shared
//! step-size derivation below are written from the specification directly,
//! grounded on the dequantization arithmetic already present in
//! `decode.rs::decode_sub_band_bitplanes`.

use crate::image::{ComponentInfo, QuantizationStyle, SubBandType};

/// `R_b` from Equation (E-2): the dynamic range of a sub-band, driven by the
/// component's bit depth and the sub-band's log-gain.
pub(crate) fn dynamic_range(component_info: &ComponentInfo, sub_band_type: SubBandType) -> u16 {
    let log_gain = match sub_band_type {
        SubBandType::LowLow => 0,
        SubBandType::LowHigh | SubBandType::HighLow => 1,
        SubBandType::HighHigh => 2,
    };

    component_info.size_info.precision as u16 + log_gain
}

/// Derives the quantization step size `delta_b` for a sub-band from its
/// stored `(exponent, mantissa)` pair, per Equation (E-3).
pub(crate) fn step_size(
    component_info: &ComponentInfo,
    sub_band_type: SubBandType,
    resolution: u16,
) -> Option<f32> {
    if component_info.quantization_info.quantization_style == QuantizationStyle::NoQuantization {
        return None;
    }

    let (exponent, mantissa) = component_info.exponent_mantissa(sub_band_type, resolution);
    let r_b = dynamic_range(component_info, sub_band_type);

    let delta_b =
        2.0f32.powf(r_b as f32 - exponent as f32) * (1.0 + (mantissa as f32) / (2u32.pow(11) as f32));

    Some(delta_b)
}

/// The number of bit-planes coded for a sub-band, Equation (E-2):
/// `M_b = G + exponent_b - 1`.
pub(crate) fn num_bitplanes(component_info: &ComponentInfo, sub_band_type: SubBandType, resolution: u16) -> u16 {
    let (exponent, _) = component_info.exponent_mantissa(sub_band_type, resolution);
    component_info.quantization_info.guard_bits as u16 + exponent - 1
}

/// Forward scalar quantization with a dead zone twice the step size: a
/// transform coefficient `y` maps to the integer `sign(y) * floor(|y| /
/// delta_b)`. Returns the raw coefficient unchanged when quantization is
/// disabled (reversible 5/3 with `NoQuantization`, i.e. lossless coding).
pub(crate) fn quantize(value: f32, delta_b: Option<f32>) -> i32 {
    match delta_b {
        None => value.round() as i32,
        Some(delta) => {
            let magnitude = (value.abs() / delta).floor();
            if value < 0.0 {
                -(magnitude as i32)
            } else {
                magnitude as i32
            }
        }
    }
}

/// Inverse scalar quantization, the reconstruction rule used by
/// `decode_sub_band_bitplanes`: the dequantized magnitude is simply the
/// decoded integer magnitude scaled by `delta_b` (no dead-zone-center offset
/// is applied, matching the teacher, which favours the simpler
/// zero-centered reconstruction point over the E.1.1.2 `r * delta_b`
/// rounding-offset formula).
pub(crate) fn dequantize(magnitude: i32, delta_b: Option<f32>) -> f32 {
    match delta_b {
        None => magnitude as f32,
        Some(delta) => magnitude as f32 * delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_one_step() {
        let delta = 2.5f32;
        for raw in [-10.3f32, -0.4, 0.0, 3.9, 12.2] {
            let q = quantize(raw, Some(delta));
            let dq = dequantize(q, Some(delta));
            assert!((dq - raw).abs() <= delta, "raw={raw} dq={dq} delta={delta}");
        }
    }

    #[test]
    fn no_quantization_is_identity_rounding() {
        assert_eq!(quantize(4.0, None), 4);
        assert_eq!(dequantize(4, None), 4.0);
    }
}
