//! Randomised coverage layered on top of the fixed scenarios in
//! `roundtrip.rs`: each case draws its own geometry, component count, bit
//! depth, tile grid, decomposition depth, code-block size, layer count and
//! progression order from a deterministic PRNG, then checks invariants 1
//! (lossless round trip), 4 (packet/Psot accounting), 6 (progression
//! independence) and 7 (tile independence). Invariant 5 (monotone layer
//! assignment) is exercised directly against `pcrd::allocate_layers` in its
//! own module, since that invariant is about internal pass bookkeeping that
//! never reaches this crate's public surface.
//!
//! Cases run through `rayon`, mirroring the teacher's own
//! `hayro-jpeg2000` conformance-asset harness, which farms its test list
//! out with `par_iter` over a fixed-capacity thread pool rather than
//! spawning threads by hand.

use j2k_core::{decode, encode, DecodeSettings, EncoderConfig, Image, Plane, ProgressionOrder, WaveletTransform};
use rayon::prelude::*;

const NUM_CASES: u64 = 48;

const PROGRESSIONS: [ProgressionOrder; 5] = [
    ProgressionOrder::LayerResolutionComponentPosition,
    ProgressionOrder::ResolutionLayerComponentPosition,
    ProgressionOrder::ResolutionPositionComponentLayer,
    ProgressionOrder::PositionComponentResolutionLayer,
    ProgressionOrder::ComponentPositionResolutionLayer,
];

/// splitmix64, seeded per case so a failure reproduces from the case index
/// alone without pulling in a randomness crate the rest of the crate
/// doesn't depend on.
struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Rng(seed)
    }

    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    fn range(&mut self, lo: u32, hi_inclusive: u32) -> u32 {
        lo + (self.next_u64() % (hi_inclusive - lo + 1) as u64) as u32
    }

    fn bool(&mut self) -> bool {
        self.next_u64() & 1 == 0
    }
}

fn floor_log2(mut v: u32) -> u32 {
    let mut n = 0;
    while v > 1 {
        v /= 2;
        n += 1;
    }
    n
}

struct Case {
    width: u32,
    height: u32,
    component_count: u32,
    bit_depth: u8,
    signed: bool,
    tile_width: u32,
    tile_height: u32,
    levels: u8,
    code_block_exp: u8,
    num_layers: u16,
    progression_a: ProgressionOrder,
    progression_b: ProgressionOrder,
}

fn draw_case(seed: u64) -> Case {
    let mut rng = Rng::new(seed);

    let width = rng.range(1, 255);
    let height = rng.range(1, 255);
    let component_count = rng.range(1, 3);
    let bit_depth = rng.range(1, 15) as u8;
    let signed = rng.bool();

    let grid_x = rng.range(1, 3);
    let grid_y = rng.range(1, 3);
    let tile_width = (width / grid_x).max(1);
    let tile_height = (height / grid_y).max(1);

    let max_levels = floor_log2(tile_width.min(tile_height)).min(4);
    let levels = rng.range(0, max_levels) as u8;

    // Exponents 2..=4 keep the code block at 16/32/64 px a side, the range
    // SPEC_FULL.md's property-test clause asks for, while staying inside
    // `EncoderConfig::validate`'s `2..=10`, `width + height <= 12` limits.
    let code_block_exp = rng.range(2, 4) as u8;

    let num_layers = rng.range(1, 9) as u16;

    let p1 = rng.range(0, (PROGRESSIONS.len() - 1) as u32) as usize;
    let p2 = (p1 + 1) % PROGRESSIONS.len();

    Case {
        width,
        height,
        component_count,
        bit_depth,
        signed,
        tile_width,
        tile_height,
        levels,
        code_block_exp,
        num_layers,
        progression_a: PROGRESSIONS[p1],
        progression_b: PROGRESSIONS[p2],
    }
}

fn synth_image(case: &Case) -> Image {
    let plane_len = (case.width * case.height) as usize;
    let span: i64 = 1i64 << case.bit_depth;
    let (lo, hi) = if case.signed { (-(span / 2), span / 2 - 1) } else { (0, span - 1) };

    let components = (0..case.component_count)
        .map(|c| {
            let mut samples = Vec::with_capacity(plane_len);
            for y in 0..case.height as i64 {
                for x in 0..case.width as i64 {
                    let raw = (x * 1_103_515_245 + y * 12_345 + c as i64 * 97 + 7).rem_euclid(span);
                    let v = lo + raw;
                    samples.push(v.clamp(lo, hi) as i32);
                }
            }
            Plane { samples, precision: case.bit_depth, signed: case.signed, horizontal_resolution: 1, vertical_resolution: 1 }
        })
        .collect();

    Image { width: case.width, height: case.height, components }
}

fn config_for(case: &Case, single_tile: bool, progression_order: ProgressionOrder) -> EncoderConfig {
    EncoderConfig {
        transform: WaveletTransform::Reversible53,
        num_decomposition_levels: case.levels,
        num_layers: case.num_layers,
        progression_order,
        code_block_width: case.code_block_exp,
        code_block_height: case.code_block_exp,
        mct: false,
        tile_width: if single_tile { None } else { Some(case.tile_width) },
        tile_height: if single_tile { None } else { Some(case.tile_height) },
        layer_budgets: vec![None; case.num_layers as usize],
        tolerance: 0.01,
    }
}

fn assert_images_equal(a: &Image, b: &Image, context: &str) {
    assert_eq!(a.width, b.width, "{context}: width mismatch");
    assert_eq!(a.height, b.height, "{context}: height mismatch");
    assert_eq!(a.components.len(), b.components.len(), "{context}: component count mismatch");
    for (idx, (pa, pb)) in a.components.iter().zip(b.components.iter()).enumerate() {
        assert_eq!(pa.samples, pb.samples, "{context}: component {idx} samples differ");
    }
}

/// Invariant 4: for every SOT tile-part, `Psot` (the 4-byte field 6 bytes
/// after the marker) equals the byte span from the marker's start through
/// the end of that tile-part, i.e. the position of the next marker.
fn assert_psot_accounting(encoded: &[u8]) {
    let mut pos = 0usize;
    while pos + 1 < encoded.len() {
        if encoded[pos] == 0xFF && encoded[pos + 1] == 0x90 {
            let psot_at = pos + 6;
            assert!(psot_at + 4 <= encoded.len(), "Psot field runs past end of codestream");
            let psot = u32::from_be_bytes(encoded[psot_at..psot_at + 4].try_into().unwrap()) as usize;
            let next_marker = pos + psot;
            assert!(next_marker + 1 < encoded.len(), "Psot points past end of codestream");
            assert_eq!(
                encoded[next_marker], 0xFF,
                "Psot at tile-part starting {pos} does not land on a marker byte"
            );
            pos = next_marker;
        } else {
            pos += 1;
        }
    }
}

fn run_case(seed: u64) {
    let case = draw_case(seed);
    let image = synth_image(&case);

    let tiled_config = config_for(&case, false, case.progression_a);
    let tiled_encoded = encode(&image, &tiled_config).unwrap_or_else(|e| panic!("seed {seed}: tiled encode failed: {e:?}"));
    assert_psot_accounting(&tiled_encoded);

    let (tiled_decoded, warnings) =
        decode(&tiled_encoded, &DecodeSettings::default()).unwrap_or_else(|e| panic!("seed {seed}: tiled decode failed: {e:?}"));
    assert!(warnings.is_empty(), "seed {seed}: unexpected tile warnings: {warnings:?}");
    assert_images_equal(&image, &tiled_decoded, &format!("seed {seed}: invariant 1 (lossless round trip)"));

    // Invariant 6: a second progression order, same everything else, must
    // decode to the same image.
    let reordered_config = config_for(&case, false, case.progression_b);
    let reordered_encoded = encode(&image, &reordered_config).unwrap_or_else(|e| panic!("seed {seed}: reordered encode failed: {e:?}"));
    let (reordered_decoded, _) =
        decode(&reordered_encoded, &DecodeSettings::default()).unwrap_or_else(|e| panic!("seed {seed}: reordered decode failed: {e:?}"));
    assert_images_equal(&tiled_decoded, &reordered_decoded, &format!("seed {seed}: invariant 6 (progression equivalence)"));

    // Invariant 7: one tile vs the randomly drawn tile grid must decode to
    // the same image.
    let single_config = config_for(&case, true, case.progression_a);
    let single_encoded = encode(&image, &single_config).unwrap_or_else(|e| panic!("seed {seed}: single-tile encode failed: {e:?}"));
    let (single_decoded, _) =
        decode(&single_encoded, &DecodeSettings::default()).unwrap_or_else(|e| panic!("seed {seed}: single-tile decode failed: {e:?}"));
    assert_images_equal(&tiled_decoded, &single_decoded, &format!("seed {seed}: invariant 7 (tile independence)"));
}

#[test]
fn random_cases_satisfy_lossless_packet_progression_and_tile_invariants() {
    (0..NUM_CASES).into_par_iter().for_each(|i| run_case(0xC0FFEE_u64 ^ i));
}

#[test]
fn dwt_levels_zero_at_minimum_geometry_round_trips() {
    let case = Case {
        width: 1,
        height: 1,
        component_count: 1,
        bit_depth: 8,
        signed: false,
        tile_width: 1,
        tile_height: 1,
        levels: 0,
        code_block_exp: 2,
        num_layers: 1,
        progression_a: ProgressionOrder::LayerResolutionComponentPosition,
        progression_b: ProgressionOrder::ResolutionLayerComponentPosition,
    };
    let image = synth_image(&case);
    let config = config_for(&case, true, case.progression_a);
    let encoded = encode(&image, &config).expect("encode should succeed at 1x1");
    assert_psot_accounting(&encoded);
    let (decoded, warnings) = decode(&encoded, &DecodeSettings::default()).expect("decode should succeed at 1x1");
    assert!(warnings.is_empty());
    assert_images_equal(&image, &decoded, "1x1 minimum geometry");
}
