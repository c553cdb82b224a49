//! Known-answer control sequences for calibrating the calibrator.
//!
//! Exact-count controls contain exactly `round(p·n)` ones in a seeded random
//! order, so their point estimate is known in advance and any drift comes
//! from the pipeline, not from sampling noise.

use chrono::{DateTime, Duration, FixedOffset};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::{CalibError, Result};

/// Start of the synthetic timeline used by [`control_csv`] by default.
pub const CONTROL_EPOCH: &str = "2026-01-01T00:00:00+00:00";

fn check_p(p: f64) -> Result<()> {
    if (0.0..=1.0).contains(&p) {
        Ok(())
    } else {
        Err(CalibError::Configuration(format!(
            "control probability must be in [0, 1], got {p}"
        )))
    }
}

/// `n` bits with exactly `round(p·n)` ones, shuffled with `seed`.
pub fn biased_control(n: usize, p: f64, seed: u64) -> Result<Vec<u8>> {
    check_p(p)?;
    let k = ((p * n as f64).round() as usize).min(n);
    let mut bits = vec![0u8; n];
    bits[..k].fill(1);
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    bits.shuffle(&mut rng);
    Ok(bits)
}

/// Exact-count control with p = 0.5.
pub fn fair_control(n: usize, seed: u64) -> Vec<u8> {
    let mut bits = vec![0u8; n];
    bits[..n / 2].fill(1);
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    bits.shuffle(&mut rng);
    bits
}

/// Independent Bernoulli(p) draws; the count of ones is random.
pub fn bernoulli_sequence(n: usize, p: f64, seed: u64) -> Result<Vec<u8>> {
    check_p(p)?;
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    Ok((0..n).map(|_| u8::from(rng.random_bool(p))).collect())
}

/// Render `bits` as a contract-conformant CSV, one row per bit, with
/// timestamps one millisecond apart starting at `start`.
pub fn control_csv(bits: &[u8], source_id: &str, start: DateTime<FixedOffset>) -> String {
    let mut out = String::with_capacity(bits.len() * 40 + 32);
    out.push_str("timestamp,bit,source_id\n");
    for (i, &b) in bits.iter().enumerate() {
        let ts = start + Duration::milliseconds(i as i64);
        out.push_str(&ts.to_rfc3339());
        out.push(',');
        out.push(if b == 0 { '0' } else { '1' });
        out.push(',');
        out.push_str(source_id);
        out.push('\n');
    }
    out
}

/// [`CONTROL_EPOCH`] as a timestamp.
pub fn control_epoch() -> Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(CONTROL_EPOCH)
        .map_err(|e| CalibError::Configuration(format!("bad control epoch: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biased_control_has_exact_count() {
        let bits = biased_control(200_000, 0.505, 42).unwrap();
        assert_eq!(bits.len(), 200_000);
        assert_eq!(bits.iter().filter(|&&b| b == 1).count(), 101_000);
    }

    #[test]
    fn controls_are_seeded() {
        assert_eq!(fair_control(1000, 7), fair_control(1000, 7));
        assert_ne!(fair_control(1000, 7), fair_control(1000, 8));
        assert_eq!(fair_control(1001, 1).iter().filter(|&&b| b == 1).count(), 500);
    }

    #[test]
    fn shuffle_mixes_positions() {
        let bits = fair_control(1000, 3);
        let first_half_ones = bits[..500].iter().filter(|&&b| b == 1).count();
        // 500 ones shuffled over 1000 slots put about 250 in the first half.
        assert!((200..300).contains(&first_half_ones));
    }

    #[test]
    fn bad_probability_rejected() {
        assert!(biased_control(10, 1.5, 0).is_err());
        assert!(bernoulli_sequence(10, -0.1, 0).is_err());
    }

    #[test]
    fn bernoulli_is_roughly_fair() {
        let bits = bernoulli_sequence(20_000, 0.5, 42).unwrap();
        let ones = bits.iter().filter(|&&b| b == 1).count();
        assert!(ones > 9_500 && ones < 10_500);
        assert_eq!(bits, bernoulli_sequence(20_000, 0.5, 42).unwrap());
    }

    #[test]
    fn csv_passes_the_validator() {
        let bits = biased_control(50, 0.6, 1).unwrap();
        let csv = control_csv(&bits, "control_biased", control_epoch().unwrap());
        let (ds, prov) = crate::ingest::validate("control.csv", csv.as_bytes()).unwrap();
        assert_eq!(ds.bits(), bits);
        assert_eq!(prov.rows_rejected, 0);
        let tr = prov.time_range.unwrap();
        assert_eq!(tr.start, "2026-01-01T00:00:00+00:00");
        assert_eq!(tr.end, "2026-01-01T00:00:00.049+00:00");
    }
}
