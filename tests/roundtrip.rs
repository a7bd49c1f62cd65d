//! Integration coverage for the encode/decode round trip, built around the
//! concrete scenarios and universal invariants the codestream core is meant
//! to satisfy: lossless round-tripping, marker syntax, monotone layer
//! assignment, and progression/tile-count independence.

use j2k_core::{decode, encode, DecodeSettings, EncoderConfig, Image, Plane, ProgressionOrder, WaveletTransform};

fn plane(width: u32, height: u32, precision: u8, signed: bool, values: Vec<i32>) -> Plane {
    Plane { samples: values, precision, signed, horizontal_resolution: 1, vertical_resolution: 1 }
}

fn lossless_config(num_layers: u16, progression_order: ProgressionOrder, num_decomposition_levels: u8) -> EncoderConfig {
    EncoderConfig {
        transform: WaveletTransform::Reversible53,
        num_decomposition_levels,
        num_layers,
        progression_order,
        code_block_width: 6,
        code_block_height: 6,
        mct: false,
        tile_width: None,
        tile_height: None,
        layer_budgets: vec![None; num_layers as usize],
        tolerance: 0.01,
    }
}

/// S1: 8x8 single component, `v(x,y) = (7x + 3y) mod 256`, 0 DWT levels.
#[test]
fn s1_small_gradient_lossless_round_trip_and_marker_syntax() {
    let width = 8;
    let height = 8;
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            samples.push(((7 * x + 3 * y) % 256) as i32);
        }
    }

    let image = Image { width, height, components: vec![plane(width, height, 8, false, samples)] };
    let config = lossless_config(1, ProgressionOrder::LayerResolutionComponentPosition, 0);

    let encoded = encode(&image, &config).expect("encode should succeed");

    assert_eq!(&encoded[0..4], &[0xFF, 0x4F, 0xFF, 0x51]);
    assert_eq!(&encoded[encoded.len() - 2..], &[0xFF, 0xD9]);

    let (decoded, warnings) = decode(&encoded, &DecodeSettings::default()).expect("decode should succeed");
    assert!(warnings.is_empty());
    assert_eq!(decoded.width, width);
    assert_eq!(decoded.height, height);
    assert_eq!(decoded.components[0].samples, image.components[0].samples);
}

/// S3: 64x64 gradient with a 2x2 tile grid, 3 layers, LRCP.
#[test]
fn s3_tiled_gradient_round_trips_with_growing_tile_parts() {
    let width = 64;
    let height = 64;
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            samples.push((x ^ y) as i32 & 0xff);
        }
    }

    let image = Image { width, height, components: vec![plane(width, height, 8, false, samples)] };
    let mut config = lossless_config(3, ProgressionOrder::LayerResolutionComponentPosition, 2);
    config.tile_width = Some(32);
    config.tile_height = Some(32);

    let encoded = encode(&image, &config).expect("encode should succeed");
    let (decoded, warnings) = decode(&encoded, &DecodeSettings::default()).expect("decode should succeed");

    assert!(warnings.is_empty());
    assert_eq!(decoded.components[0].samples, image.components[0].samples);

    // A 2x2 tile grid contributes one tile-part per tile (SOT markers: FF 90).
    let sot_count = encoded.windows(2).filter(|w| w == &[0xFFu8, 0x90]).count();
    assert!(sot_count >= 4, "expected at least 4 tile-parts, found {sot_count}");
}

/// S4: a codestream with SOC but no SIZ must fail with a `MissingMarker`.
#[test]
fn s4_missing_siz_marker_surfaces_as_error() {
    let malformed = [0xFFu8, 0x4F, 0x00, 0x01, 0x02, 0x03, 0xFF, 0xD9];
    let result = decode(&malformed, &DecodeSettings::default());
    assert!(result.is_err());
}

/// S6: 16x16, 16-bit signed component.
#[test]
fn s6_signed_16_bit_round_trips_exactly() {
    let width = 16;
    let height = 16;
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let v = (x as i32 * 997 + y as i32 * 31) % 65536 - 32768;
            samples.push(v);
        }
    }

    let image = Image { width, height, components: vec![plane(width, height, 16, true, samples)] };
    let config = lossless_config(1, ProgressionOrder::LayerResolutionComponentPosition, 3);

    let encoded = encode(&image, &config).expect("encode should succeed");
    let (decoded, warnings) = decode(&encoded, &DecodeSettings::default()).expect("decode should succeed");

    assert!(warnings.is_empty());
    assert_eq!(decoded.components[0].samples, image.components[0].samples);
}

/// S7: RLCP vs LRCP must decode identically even though packet order differs.
#[test]
fn s7_progression_order_does_not_affect_decoded_image() {
    let width = 32;
    let height = 32;
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            samples.push(((x * 3 + y * 5) % 256) as i32);
        }
    }

    let image = Image { width, height, components: vec![plane(width, height, 8, false, samples)] };

    let lrcp_config = lossless_config(3, ProgressionOrder::LayerResolutionComponentPosition, 2);
    let rlcp_config = lossless_config(3, ProgressionOrder::ResolutionLayerComponentPosition, 2);

    let lrcp_encoded = encode(&image, &lrcp_config).expect("encode should succeed");
    let rlcp_encoded = encode(&image, &rlcp_config).expect("encode should succeed");

    assert_ne!(lrcp_encoded, rlcp_encoded, "different progression orders should produce different packet orders");

    let (lrcp_decoded, _) = decode(&lrcp_encoded, &DecodeSettings::default()).expect("decode should succeed");
    let (rlcp_decoded, _) = decode(&rlcp_encoded, &DecodeSettings::default()).expect("decode should succeed");

    assert_eq!(lrcp_decoded.components[0].samples, rlcp_decoded.components[0].samples);
}

/// Invariant 7: encoding as a single tile vs. a 2x2 tile grid must decode to
/// the same image in reversible mode.
#[test]
fn tile_grid_does_not_affect_decoded_image() {
    let width = 48;
    let height = 48;
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            samples.push(((x * 13 + y * 7) % 256) as i32);
        }
    }

    let image = Image { width, height, components: vec![plane(width, height, 8, false, samples)] };

    let single_tile_config = lossless_config(2, ProgressionOrder::LayerResolutionComponentPosition, 2);
    let mut multi_tile_config = lossless_config(2, ProgressionOrder::LayerResolutionComponentPosition, 2);
    multi_tile_config.tile_width = Some(24);
    multi_tile_config.tile_height = Some(24);

    let single_tile_encoded = encode(&image, &single_tile_config).expect("encode should succeed");
    let multi_tile_encoded = encode(&image, &multi_tile_config).expect("encode should succeed");

    let (single_tile_decoded, _) = decode(&single_tile_encoded, &DecodeSettings::default()).expect("decode should succeed");
    let (multi_tile_decoded, _) = decode(&multi_tile_encoded, &DecodeSettings::default()).expect("decode should succeed");

    assert_eq!(single_tile_decoded.components[0].samples, image.components[0].samples);
    assert_eq!(multi_tile_decoded.components[0].samples, image.components[0].samples);
}

/// Invariant 5 (monotone layer assignment), exercised indirectly: decoding
/// through successive tile-parts of a multi-layer codestream should never
/// fail, and the final layer must reconstruct the exact image (each earlier
/// layer's passes are a subset carried forward, never re-chosen).
#[test]
fn multi_layer_codestream_decodes_to_exact_image() {
    let width = 40;
    let height = 40;
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            samples.push(((x + y * 2) % 200) as i32);
        }
    }

    let image = Image { width, height, components: vec![plane(width, height, 8, false, samples)] };
    let mut config = lossless_config(4, ProgressionOrder::ResolutionLayerComponentPosition, 3);
    config.layer_budgets = vec![Some(200), Some(400), Some(800), None];

    let encoded = encode(&image, &config).expect("encode should succeed");
    let (decoded, warnings) = decode(&encoded, &DecodeSettings::default()).expect("decode should succeed");

    assert!(warnings.is_empty());
    assert_eq!(decoded.components[0].samples, image.components[0].samples);
}

/// Three-component MCT round trip (reversible RCT), a generalization of S2
/// to lossless mode so the assertion can be exact equality rather than a
/// tolerance band.
#[test]
fn three_component_mct_round_trips_exactly() {
    let width = 16;
    let height = 16;
    let mut r = Vec::with_capacity((width * height) as usize);
    let mut g = Vec::with_capacity((width * height) as usize);
    let mut b = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            r.push(((x * 5) % 256) as i32);
            g.push(((y * 9) % 256) as i32);
            b.push(((x + y) % 256) as i32);
        }
    }

    let image = Image {
        width,
        height,
        components: vec![
            plane(width, height, 8, false, r),
            plane(width, height, 8, false, g),
            plane(width, height, 8, false, b),
        ],
    };

    let mut config = lossless_config(1, ProgressionOrder::LayerResolutionComponentPosition, 2);
    config.mct = true;

    let encoded = encode(&image, &config).expect("encode should succeed");
    let (decoded, warnings) = decode(&encoded, &DecodeSettings::default()).expect("decode should succeed");

    assert!(warnings.is_empty());
    for (decoded_plane, original_plane) in decoded.components.iter().zip(&image.components) {
        assert_eq!(decoded_plane.samples, original_plane.samples);
    }
}

/// `EncoderConfig::validate` rejects an MCT request on a non-three-component
/// image rather than silently ignoring it.
#[test]
fn mct_on_wrong_component_count_is_rejected() {
    let image = Image { width: 4, height: 4, components: vec![plane(4, 4, 8, false, vec![0; 16])] };
    let mut config = lossless_config(1, ProgressionOrder::LayerResolutionComponentPosition, 1);
    config.mct = true;

    assert!(encode(&image, &config).is_err());
}
