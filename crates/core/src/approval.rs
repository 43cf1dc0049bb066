use crate::activity::{Tag, TagStatus};
use crate::settings::{ThresholdType, VotingSettings};

/// Recompute every tag's status from its current votes. The result depends
/// only on vote state and settings, never on the previous statuses.
pub fn apply_tag_approval(tags: &mut [Tag], voting: &VotingSettings) {
    match (voting.enabled, voting.threshold_type) {
        (false, _) | (true, ThresholdType::Off) => {
            for tag in tags.iter_mut() {
                if tag.status == TagStatus::Pending {
                    tag.status = TagStatus::Approved;
                }
            }
        }
        (true, ThresholdType::Minimum) => {
            let minimum = voting.effective_minimum() as usize;
            for tag in tags.iter_mut() {
                tag.status = if tag.vote_count() >= minimum {
                    TagStatus::Approved
                } else {
                    TagStatus::Pending
                };
            }
        }
        (true, ThresholdType::TopN) => {
            for tag in tags.iter_mut() {
                tag.status = TagStatus::Pending;
            }

            let n = voting.effective_top_n() as usize;
            let mut ranked: Vec<(usize, usize)> = tags
                .iter()
                .enumerate()
                .filter(|(_, t)| t.vote_count() > 0)
                .map(|(idx, t)| (idx, t.vote_count()))
                .collect();
            if ranked.is_empty() || n == 0 {
                return;
            }
            // Stable order: votes descending, then original position.
            ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

            let cutoff = ranked[n.min(ranked.len()) - 1].1;
            for (idx, votes) in ranked {
                if votes >= cutoff {
                    tags[idx].status = TagStatus::Approved;
                }
            }
        }
    }
}
