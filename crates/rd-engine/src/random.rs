//! Random helpers for humanize and probability.

use rand::rngs::SmallRng;
use rand::Rng;

/// Gaussian random value with standard deviation `z`, via the polar
/// Box-Muller transform.
pub(crate) fn gaussian(rng: &mut SmallRng, z: f32) -> f32 {
    loop {
        let x1: f32 = rng.gen_range(-1.0..1.0);
        let x2: f32 = rng.gen_range(-1.0..1.0);
        let w = x1 * x1 + x2 * x2;
        if w > 0.0 && w < 1.0 {
            let w = ((-2.0 * w.ln()) / w).sqrt();
            return x1 * w * z;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn gaussian_scales_with_z() {
        let mut rng = SmallRng::seed_from_u64(7);
        let spread: f32 = (0..1000).map(|_| gaussian(&mut rng, 0.3).abs()).sum::<f32>() / 1000.0;
        // Mean absolute deviation of N(0, 0.3) is about 0.24.
        assert!(spread > 0.1 && spread < 0.4, "spread {}", spread);
    }

    #[test]
    fn gaussian_zero_z_is_zero() {
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..100 {
            assert_eq!(gaussian(&mut rng, 0.0), 0.0);
        }
    }
}
