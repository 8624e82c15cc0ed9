//! Beta sampling for Thompson selection.
//!
//! Beta(a, b) = X / (X + Y) with X ~ Gamma(a), Y ~ Gamma(b). Gamma draws use
//! Marsaglia-Tsang; the shape < 1 case boosts through Gamma(a + 1).

use rand::Rng;

fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // Box-Muller; 1 - u keeps the log argument in (0, 1].
    let u1: f64 = 1.0 - rng.random::<f64>();
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

pub fn sample_gamma<R: Rng + ?Sized>(rng: &mut R, shape: f64) -> f64 {
    if shape < 1.0 {
        let u: f64 = 1.0 - rng.random::<f64>();
        return sample_gamma(rng, shape + 1.0) * u.powf(1.0 / shape);
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();
    loop {
        let x = standard_normal(rng);
        let v = 1.0 + c * x;
        if v <= 0.0 {
            continue;
        }
        let v = v * v * v;
        let u: f64 = 1.0 - rng.random::<f64>();
        if u < 1.0 - 0.0331 * x.powi(4) || u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

pub fn sample_beta<R: Rng + ?Sized>(rng: &mut R, alpha: f64, beta: f64) -> f64 {
    let x = sample_gamma(rng, alpha.max(f64::MIN_POSITIVE));
    let y = sample_gamma(rng, beta.max(f64::MIN_POSITIVE));
    if x + y <= 0.0 {
        0.5
    } else {
        x / (x + y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_beta_samples_in_unit_interval_with_expected_mean() {
        let mut rng = StdRng::seed_from_u64(7);
        let n = 20_000;
        let mut total = 0.0;
        for _ in 0..n {
            let s = sample_beta(&mut rng, 9.0, 3.0);
            assert!((0.0..=1.0).contains(&s));
            total += s;
        }
        let mean = total / n as f64;
        assert!((mean - 0.75).abs() < 0.01, "mean was {mean}");
    }

    #[test]
    fn test_gamma_small_shape_is_positive() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1000 {
            assert!(sample_gamma(&mut rng, 0.3) >= 0.0);
        }
    }
}
