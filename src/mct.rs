//! Multiple component transform, Annex G: the reversible component
//! transform (RCT, G.2) paired with the 5/3 filter, and the irreversible
//! colour transform (ICT, G.3) paired with the 9/7 filter. Applies only to
//! the first three components of a tile whose COD `Scod` bit signals MCT
//! use; Annex G restricts this to exactly three components of matching
//! dimensions and wavelet transform.
//!
//! The teacher only ever decodes, so only the inverse direction
//! (`inverse`) has a direct counterpart; `forward` is the textbook inverse
//! of it, algebraically solved from the same G.2/G.3 equations.

use crate::image::WaveletTransform;

/// Forward transform, applied to sample planes before the forward DWT.
/// `components` must hold exactly the R, G, B planes in that order,
/// same length each; anything else is a caller bug and is a no-op here
/// rather than a panic, since an encoder can always fall back to
/// transmitting untransformed components.
pub(crate) fn forward(transform: WaveletTransform, components: &mut [&mut [f32]]) -> bool {
    let [r, g, b] = components else {
        return false;
    };

    if r.len() != g.len() || g.len() != b.len() {
        return false;
    }

    match transform {
        WaveletTransform::Reversible53 => {
            for ((r, g), b) in r.iter_mut().zip(g.iter_mut()).zip(b.iter_mut()) {
                let (rr, gg, bb) = (*r, *g, *b);
                *r = ((rr + 2.0 * gg + bb) / 4.0).floor();
                *g = bb - gg;
                *b = rr - gg;
            }
        }
        WaveletTransform::Irreversible97 => {
            for ((r, g), b) in r.iter_mut().zip(g.iter_mut()).zip(b.iter_mut()) {
                let (rr, gg, bb) = (*r, *g, *b);
                *r = 0.299 * rr + 0.587 * gg + 0.114 * bb;
                *g = -0.16875 * rr - 0.33126 * gg + 0.5 * bb;
                *b = 0.5 * rr - 0.41869 * gg - 0.08131 * bb;
            }
        }
    }

    true
}

/// Inverse transform, applied to the planes the inverse DWT produced,
/// mirroring `decode.rs`'s `apply_mct`.
pub(crate) fn inverse(transform: WaveletTransform, components: &mut [&mut [f32]]) -> bool {
    let [y0, y1, y2] = components else {
        return false;
    };

    if y0.len() != y1.len() || y1.len() != y2.len() {
        return false;
    }

    match transform {
        WaveletTransform::Irreversible97 => {
            for ((y0, y1), y2) in y0.iter_mut().zip(y1.iter_mut()).zip(y2.iter_mut()) {
                let i0 = *y0 + 1.402 * *y2;
                let i1 = *y0 - 0.34413 * *y1 - 0.71414 * *y2;
                let i2 = *y0 + 1.772 * *y1;

                *y0 = i0;
                *y1 = i1;
                *y2 = i2;
            }
        }
        WaveletTransform::Reversible53 => {
            for ((y0, y1), y2) in y0.iter_mut().zip(y1.iter_mut()).zip(y2.iter_mut()) {
                let i1 = *y0 - ((*y2 + *y1) / 4.0).floor();
                let i0 = *y2 + i1;
                let i2 = *y1 + i1;

                *y0 = i0;
                *y1 = i1;
                *y2 = i2;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversible_round_trip_is_exact_on_integers() {
        let mut r = [10.0f32, -4.0, 200.0, 0.0];
        let mut g = [20.0f32, 30.0, 128.0, 255.0];
        let mut b = [30.0f32, 60.0, 64.0, 0.0];

        let (orig_r, orig_g, orig_b) = (r, g, b);

        assert!(forward(WaveletTransform::Reversible53, &mut [&mut r, &mut g, &mut b]));
        assert!(inverse(WaveletTransform::Reversible53, &mut [&mut r, &mut g, &mut b]));

        assert_eq!(r, orig_r);
        assert_eq!(g, orig_g);
        assert_eq!(b, orig_b);
    }

    #[test]
    fn irreversible_round_trip_is_within_rounding_error() {
        let mut r = [12.0f32, 250.0, 0.0];
        let mut g = [200.0f32, 10.0, 128.0];
        let mut b = [64.0f32, 128.0, 255.0];

        let (orig_r, orig_g, orig_b) = (r, g, b);

        assert!(forward(WaveletTransform::Irreversible97, &mut [&mut r, &mut g, &mut b]));
        assert!(inverse(WaveletTransform::Irreversible97, &mut [&mut r, &mut g, &mut b]));

        for (got, want) in [(r[0], orig_r[0]), (g[1], orig_g[1]), (b[2], orig_b[2])] {
            assert!((got - want).abs() < 0.01, "got={got} want={want}");
        }
    }

    #[test]
    fn wrong_component_count_is_rejected() {
        let mut r = [1.0f32];
        let mut g = [2.0f32];
        assert!(!forward(WaveletTransform::Reversible53, &mut [&mut r, &mut g]));
    }
}
