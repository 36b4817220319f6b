use crate::attention::KVCache;
use crate::error::Result;
use super::generator::Generator;
use super::sampling::log_softmax;

struct Beam {
    tokens: Vec<u32>,
    log_prob: f32,
    cache: KVCache,
}

struct Candidate {
    parent: usize,
    token: u32,
    log_prob: f32,
}

/// Return indices of the top-n values in descending order.
fn top_n_indices(values: &[f32], n: usize) -> Vec<usize> {
    let mut indexed: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    indexed.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
    indexed.into_iter().take(n).map(|(i, _)| i).collect()
}

impl<'a> Generator<'a> {
    fn length_normalized(&self, log_prob: f32, generated: usize) -> f32 {
        log_prob / (generated.max(1) as f32).powf(self.config.length_penalty)
    }

    /// Beam search keeping `num_beams` live hypotheses ranked by summed
    /// log-probability. Each step considers the top `2 * num_beams`
    /// continuations; those ending in EOS become finished hypotheses.
    /// Stops when `num_beams` hypotheses are finished and no live beam can
    /// still beat the worst of them, or when the budget runs out.
    pub(crate) fn beam_search(&self, prompt_ids: &[u32], new_tokens: usize, capacity: usize) -> Result<Vec<u32>> {
        let num_beams = self.config.num_beams;
        let eos = self.eos_id();

        let mut root = self.make_cache(capacity);
        let first_logits = self.prefill(prompt_ids, &mut root)?;

        let mut beams = vec![Beam { tokens: prompt_ids.to_vec(), log_prob: 0.0, cache: root }];
        let mut step_logits = vec![first_logits];
        // (tokens, normalized score)
        let mut finished: Vec<(Vec<u32>, f32)> = Vec::new();

        for step in 0..new_tokens {
            let generated = step + 1;

            let mut candidates: Vec<Candidate> = Vec::new();
            for (parent, (beam, logits)) in beams.iter().zip(&step_logits).enumerate() {
                let lp = log_softmax(logits);
                for tok in top_n_indices(&lp, 2 * num_beams) {
                    candidates.push(Candidate { parent, token: tok as u32, log_prob: beam.log_prob + lp[tok] });
                }
            }
            candidates.sort_unstable_by(|a, b| b.log_prob.total_cmp(&a.log_prob));

            let mut chosen: Vec<Candidate> = Vec::with_capacity(num_beams);
            for (rank, cand) in candidates.into_iter().enumerate() {
                if cand.token == eos {
                    // Only EOS candidates ranked within the beam width finish a hypothesis.
                    if rank < num_beams {
                        let mut tokens = beams[cand.parent].tokens.clone();
                        tokens.push(eos);
                        finished.push((tokens, self.length_normalized(cand.log_prob, generated)));
                    }
                } else {
                    chosen.push(cand);
                }
                if chosen.len() == num_beams {
                    break;
                }
            }

            finished.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));
            finished.truncate(num_beams);

            let last_step = generated == new_tokens;
            let done = finished.len() == num_beams
                && chosen.first().map_or(true, |best| {
                    let worst = finished[finished.len() - 1].1;
                    self.length_normalized(best.log_prob, generated) <= worst
                });
            if done || chosen.is_empty() {
                // Stopped early: live beams hold one token fewer and never compete.
                break;
            }

            // Fork caches: the last child of a parent takes its cache, earlier children copy it.
            let mut children = vec![0usize; beams.len()];
            for cand in &chosen {
                children[cand.parent] += 1;
            }
            let mut parents: Vec<Option<Beam>> = beams.into_iter().map(Some).collect();
            let mut next_beams = Vec::with_capacity(chosen.len());
            for cand in &chosen {
                children[cand.parent] -= 1;
                let forked = if children[cand.parent] == 0 {
                    parents[cand.parent].take().map(|p| (p.tokens, p.cache))
                } else {
                    match parents[cand.parent].as_ref() {
                        Some(p) => Some((p.tokens.clone(), p.cache.deep_clone()?)),
                        None => None,
                    }
                };
                let Some((mut tokens, cache)) = forked else { continue };
                tokens.push(cand.token);
                next_beams.push(Beam { tokens, log_prob: cand.log_prob, cache });
            }

            if last_step {
                // Budget ran out: surviving beams compete with the EOS-finished ones.
                for beam in next_beams {
                    let score = self.length_normalized(beam.log_prob, generated);
                    finished.push((beam.tokens, score));
                }
                break;
            }

            step_logits = Vec::with_capacity(next_beams.len());
            for beam in next_beams.iter_mut() {
                let last = beam.tokens[beam.tokens.len() - 1];
                step_logits.push(self.decode_step(last, &mut beam.cache)?);
            }
            beams = next_beams;
        }

        finished.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(finished.into_iter().next().map(|(tokens, _)| tokens).unwrap_or_else(|| prompt_ids.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_n_indices() {
        assert_eq!(top_n_indices(&[0.1, 0.5, 0.3, 0.9], 2), vec![3, 1]);
        assert_eq!(top_n_indices(&[0.1], 4), vec![0]);
    }
}
