use rand::Rng;

/// Index of the largest logit; the first one wins on ties.
pub(crate) fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0u32;
    let mut max_val = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > max_val {
            max_val = v;
            best = i as u32;
        }
    }
    best
}

/// HuggingFace convention: positive logits are divided by `penalty`,
/// negative ones multiplied. Each distinct past token is penalized once.
pub(crate) fn apply_repetition_penalty(logits: &mut [f32], past_tokens: &[u32], penalty: f32) {
    let mut seen = std::collections::HashSet::new();
    for &tok in past_tokens {
        let idx = tok as usize;
        if idx < logits.len() && seen.insert(idx) {
            if logits[idx] > 0.0 {
                logits[idx] /= penalty;
            } else {
                logits[idx] *= penalty;
            }
        }
    }
}

/// Keep the top-k logits (and ties with the k-th); mask the rest.
pub(crate) fn apply_top_k(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut vals: Vec<f32> = logits.to_vec();
    let pivot = vals.len() - k;
    vals.select_nth_unstable_by(pivot, |a: &f32, b: &f32| a.total_cmp(b));
    let threshold = vals[pivot];

    for v in logits.iter_mut() {
        if *v < threshold {
            *v = f32::NEG_INFINITY;
        }
    }
}

/// Nucleus filtering: keep the smallest set of tokens whose cumulative
/// probability reaches `p`.
pub(crate) fn apply_top_p(logits: &mut [f32], p: f32) {
    if p >= 1.0 {
        return;
    }
    let probs = softmax(logits);

    let mut indices: Vec<usize> = (0..probs.len()).collect();
    indices.sort_unstable_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    let mut cumsum = 0.0f32;
    let mut keep = vec![false; logits.len()];
    for &idx in &indices {
        cumsum += probs[idx];
        keep[idx] = true;
        if cumsum >= p {
            break;
        }
    }

    for (v, k) in logits.iter_mut().zip(keep) {
        if !k {
            *v = f32::NEG_INFINITY;
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max_val).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// log(softmax(x))
pub(crate) fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let log_sum_exp = logits.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
    logits.iter().map(|&v| v - log_sum_exp).collect()
}

/// Draw from the categorical distribution defined by `logits`.
pub(crate) fn sample_categorical<R: Rng>(logits: &[f32], rng: &mut R) -> u32 {
    let probs = softmax(logits);
    let r: f32 = rng.gen();
    let mut cumsum = 0.0;
    for (i, &p) in probs.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    // Rounding can leave cumsum just under 1.0; fall back to the last token with mass.
    probs.iter().rposition(|&p| p > 0.0).unwrap_or(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_argmax() {
        assert_eq!(argmax(&[1.0, 3.0, 2.0]), 1);
        assert_eq!(argmax(&[5.0]), 0);
        assert_eq!(argmax(&[2.0, 2.0]), 0);
    }

    #[test]
    fn test_repetition_penalty_once_per_token() {
        let mut logits = vec![4.0, -2.0, 1.0];
        apply_repetition_penalty(&mut logits, &[0, 0, 1], 2.0);
        assert_eq!(logits, vec![2.0, -4.0, 1.0]);
    }

    #[test]
    fn test_top_k_masks_rest() {
        let mut logits = vec![1.0, 5.0, 3.0, 2.0, 4.0];
        apply_top_k(&mut logits, 2);
        let kept: Vec<usize> = (0..5).filter(|&i| logits[i].is_finite()).collect();
        assert_eq!(kept, vec![1, 4]);
    }

    #[test]
    fn test_top_p_dominant_token() {
        let mut logits = vec![10.0, -10.0, -10.0, -10.0];
        apply_top_p(&mut logits, 0.9);
        assert!(logits[0].is_finite());
        assert!(logits[1..].iter().all(|v| *v == f32::NEG_INFINITY));
    }

    #[test]
    fn test_log_softmax_normalizes() {
        let lp = log_softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = lp.iter().map(|v| v.exp()).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(lp[2] > lp[1]);
    }

    #[test]
    fn test_sample_categorical_never_picks_masked() {
        let mut rng = StdRng::seed_from_u64(7);
        let logits = vec![f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY, 0.0];
        for _ in 0..100 {
            let t = sample_categorical(&logits, &mut rng);
            assert!(t == 1 || t == 3);
        }
    }
}
