//! Compact storage for delivery latency distributions.
//!
//! Monitoring buckets keep raw latency samples in memory; when a bucket is
//! persisted the samples are folded into a t-digest and written as varints.

use tdigests::{Centroid, TDigest};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

/// Build a digest from latency samples in milliseconds.
pub fn digest_latencies(samples: &[f64]) -> Option<TDigest> {
    if samples.is_empty() {
        return None;
    }
    Some(TDigest::from_values(samples.to_vec()))
}

/// Encode a digest as `[count][mean bits][weight bits]...`, all varints.
pub fn encode_digest(td: &TDigest) -> Vec<u8> {
    let centroids = td.centroids();
    let mut out = Vec::with_capacity(centroids.len() * 16 + 4);
    let mut buf = varint_encode::u64_buffer();

    out.extend_from_slice(varint_encode::u64(centroids.len() as u64, &mut buf));
    for c in centroids {
        out.extend_from_slice(varint_encode::u64(c.mean.to_bits(), &mut buf));
        out.extend_from_slice(varint_encode::u64(c.weight.to_bits(), &mut buf));
    }
    out
}

/// Decode a digest written by [`encode_digest`]. Empty or truncated input yields `None`.
pub fn decode_digest(data: &[u8]) -> Option<TDigest> {
    let (count, mut rest) = varint_decode::u64(data).ok()?;
    if count == 0 {
        return None;
    }

    // Each centroid takes at least two bytes; the header count is not trusted.
    let mut centroids = Vec::with_capacity((count as usize).min(rest.len() / 2));
    for _ in 0..count {
        let (mean_bits, r) = varint_decode::u64(rest).ok()?;
        let (weight_bits, r) = varint_decode::u64(r).ok()?;
        rest = r;
        centroids.push(Centroid::new(f64::from_bits(mean_bits), f64::from_bits(weight_bits)));
    }

    Some(TDigest::from_centroids(centroids))
}

/// Latency at quantile `q`, with NaN/infinite estimates reported as zero.
pub fn latency_quantile(td: &TDigest, q: f64) -> f64 {
    let v = td.estimate_quantile(q);
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_digest_keeps_median() {
        let td = digest_latencies(&[120.0, 80.0, 95.0, 300.0, 101.0]).unwrap();
        let decoded = decode_digest(&encode_digest(&td)).unwrap();
        assert!((latency_quantile(&td, 0.5) - latency_quantile(&decoded, 0.5)).abs() < 0.01);
    }

    #[test]
    fn test_no_samples() {
        assert!(digest_latencies(&[]).is_none());
        assert!(decode_digest(&[]).is_none());
        assert!(decode_digest(&[3, 1]).is_none());
    }

    #[test]
    fn test_oversized_count_is_rejected() {
        let mut buf = varint_encode::u64_buffer();
        let mut data = varint_encode::u64(u64::MAX, &mut buf).to_vec();
        data.extend_from_slice(&[1, 2, 3]);
        assert!(decode_digest(&data).is_none());
    }
}
