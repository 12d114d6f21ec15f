use std::cmp::Ordering;
use std::collections::HashMap;

use serde::Serialize;

use crate::models::SearchTarget;

/// RRF smoothing constant.
pub const DEFAULT_RRF_K: f64 = 60.0;

/// One row of the ranking statement. Ranks are 1-based; `None` means the
/// row did not make that branch's candidate list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct RankEntry {
    pub id: i64,
    pub vector_rank: Option<i64>,
    pub text_rank: Option<i64>,
}

/// A ranked row after fusion, before materialization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedHit {
    pub id: i64,
    pub score: f64,
    pub vector_rank: Option<i64>,
    pub text_rank: Option<i64>,
}

impl FusedHit {
    fn best_rank(&self) -> i64 {
        match (self.vector_rank, self.text_rank) {
            (Some(v), Some(t)) => v.min(t),
            (Some(r), None) | (None, Some(r)) => r,
            (None, None) => i64::MAX,
        }
    }
}

/// `1 / (k + rank)`, or 0 when the row is absent from the branch.
pub fn rrf_term(k: f64, rank: Option<i64>) -> f64 {
    rank.map_or(0.0, |r| 1.0 / (k + r as f64))
}

/// Reciprocal Rank Fusion over the union of both branches.
///
/// A row found by only one branch still scores that branch's term. Output is
/// sorted by descending score, ties going to the better single rank and
/// then the lower id, and truncated to `top`.
pub fn fuse(entries: &[RankEntry], k: f64, top: usize) -> Vec<FusedHit> {
    let mut by_id: HashMap<i64, FusedHit> = HashMap::with_capacity(entries.len());

    for entry in entries {
        let hit = by_id.entry(entry.id).or_insert_with(|| FusedHit {
            id: entry.id,
            score: 0.0,
            vector_rank: None,
            text_rank: None,
        });
        hit.vector_rank = min_rank(hit.vector_rank, entry.vector_rank);
        hit.text_rank = min_rank(hit.text_rank, entry.text_rank);
    }

    let mut hits: Vec<FusedHit> = by_id
        .into_values()
        .map(|mut hit| {
            hit.score = rrf_term(k, hit.vector_rank) + rrf_term(k, hit.text_rank);
            hit
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.best_rank().cmp(&b.best_rank()))
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(top);
    hits
}

fn min_rank(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (x, None) => x,
        (None, y) => y,
    }
}

/// Arrange fetched rows in fused order. Ids with no fetched row (deleted
/// since ranking) are skipped.
pub fn order_by_hits<T: SearchTarget>(hits: &[FusedHit], records: Vec<T>) -> Vec<T> {
    let mut by_id: HashMap<i64, T> = records.into_iter().map(|r| (r.id(), r)).collect();

    hits.iter()
        .filter_map(|hit| {
            let record = by_id.remove(&hit.id);
            if record.is_none() {
                tracing::debug!(id = hit.id, "ranked row no longer present, skipping");
            }
            record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Vehicle;

    const K: f64 = DEFAULT_RRF_K;

    fn entry(id: i64, vector_rank: Option<i64>, text_rank: Option<i64>) -> RankEntry {
        RankEntry {
            id,
            vector_rank,
            text_rank,
        }
    }

    fn vehicle(id: i64) -> Vehicle {
        Vehicle {
            id,
            id_veiculo: format!("V-{id}"),
            garagem: None,
            placa: None,
            ano: Some(2020),
            tipo_onibus: Some("Urbano".into()),
            fabricante: None,
            modelo_chassi: None,
        }
    }

    #[test]
    fn test_empty_input() {
        assert!(fuse(&[], K, 10).is_empty());
    }

    #[test]
    fn test_vector_only_row_survives_fusion() {
        let entries = vec![
            entry(1, Some(1), Some(1)),
            entry(2, Some(2), None),
            entry(3, Some(3), None),
        ];
        let hits = fuse(&entries, K, 10);
        let row = hits.iter().find(|h| h.id == 3).unwrap();
        assert!((row.score - 1.0 / (K + 3.0)).abs() < 1e-12);
        assert_eq!(row.text_rank, None);
    }

    #[test]
    fn test_text_only_rank_one_score() {
        let hits = fuse(&[entry(42, None, Some(1))], K, 5);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].score - 0.016_393).abs() < 1e-6);
    }

    #[test]
    fn test_better_ranks_in_both_branches_score_higher() {
        let entries = vec![entry(1, Some(4), Some(6)), entry(2, Some(2), Some(3))];
        let hits = fuse(&entries, K, 10);
        assert_eq!(hits[0].id, 2);
        assert!(hits[0].score >= hits[1].score);
    }

    #[test]
    fn test_presence_in_both_branches_beats_single_top_rank() {
        let entries = vec![entry(1, Some(1), None), entry(2, Some(2), Some(2))];
        let hits = fuse(&entries, K, 10);
        assert_eq!(hits[0].id, 2);
    }

    #[test]
    fn test_vector_only_mode_keeps_distance_order() {
        let entries: Vec<_> = [(30, 1), (10, 2), (20, 3)]
            .into_iter()
            .map(|(id, r)| entry(id, Some(r), None))
            .collect();
        let ids: Vec<i64> = fuse(&entries, K, 10).iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![30, 10, 20]);
    }

    #[test]
    fn test_top_truncation_keeps_highest_scores() {
        let entries: Vec<_> = (1..=20).map(|r| entry(100 + r, None, Some(r))).collect();
        let hits = fuse(&entries, K, 3);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![101, 102, 103]);
        assert!(hits.windows(2).all(|w| w[0].score > w[1].score));
    }

    #[test]
    fn test_ties_break_on_best_rank_then_id() {
        // 1/(k+1) + 1/(k+5) vs the mirror image: equal scores
        let entries = vec![
            entry(9, Some(5), Some(1)),
            entry(4, Some(1), Some(5)),
            entry(7, Some(3), Some(3)),
        ];
        let ids: Vec<i64> = fuse(&entries, K, 10).iter().map(|h| h.id).collect();
        assert_eq!(ids, vec![4, 9, 7]);
    }

    #[test]
    fn test_duplicate_ids_are_merged() {
        let entries = vec![entry(5, Some(2), None), entry(5, None, Some(4))];
        let hits = fuse(&entries, K, 10);
        assert_eq!(hits.len(), 1);
        let expected = 1.0 / (K + 2.0) + 1.0 / (K + 4.0);
        assert!((hits[0].score - expected).abs() < 1e-12);
    }

    #[test]
    fn test_scores_are_non_negative() {
        let entries = vec![entry(1, None, None), entry(2, Some(1), None)];
        assert!(fuse(&entries, K, 10).iter().all(|h| h.score >= 0.0));
    }

    #[test]
    fn test_order_by_hits_follows_fused_order() {
        let hits = fuse(
            &[entry(3, Some(1), None), entry(1, Some(2), None), entry(2, Some(3), None)],
            K,
            10,
        );
        let records = vec![vehicle(1), vehicle(2), vehicle(3)];
        let ordered = order_by_hits(&hits, records);
        assert_eq!(ordered.iter().map(|v| v.id).collect::<Vec<_>>(), vec![3, 1, 2]);
    }

    #[test]
    fn test_order_by_hits_skips_vanished_rows() {
        let hits = fuse(&[entry(1, Some(1), None), entry(2, Some(2), None)], K, 10);
        let ordered = order_by_hits(&hits, vec![vehicle(2)]);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].id, 2);
    }
}
