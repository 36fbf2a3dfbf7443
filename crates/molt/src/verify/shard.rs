//! Shard planning: PK-range partitions of a table for parallel scans.

use tracing::warn;

use crate::dbconn::Conn;
use crate::dbtable::VerifiedTable;
use crate::error::Result;
use crate::sqlbuild::{qualify_table, quote_ident};
use crate::typeconv::DatumKind;

/// A `[lo, hi)` slice of a table's primary key domain. `None` bounds are
/// unbounded, so a single shard spans the whole domain. Shards for a table
/// are disjoint and jointly exhaustive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub index: usize,
    pub lo: Option<i64>,
    pub hi: Option<i64>,
}

impl Shard {
    pub fn full_domain() -> Shard {
        Shard {
            index: 0,
            lo: None,
            hi: None,
        }
    }
}

/// Split `[min, max]` into `n` contiguous ranges. The first shard is
/// unbounded below and the last unbounded above, so rows outside the
/// sampled min/max (inserted mid-run) still land in a shard.
pub fn split_int_range(min: i64, max: i64, n: usize) -> Vec<Shard> {
    if n <= 1 || max <= min {
        return vec![Shard::full_domain()];
    }
    let range = max - min;
    let step = range / n as i64;
    if step < 1 {
        return vec![Shard::full_domain()];
    }
    (0..n)
        .map(|i| Shard {
            index: i,
            lo: if i == 0 {
                None
            } else {
                Some(min + i as i64 * step)
            },
            hi: if i == n - 1 {
                None
            } else {
                Some(min + (i + 1) as i64 * step)
            },
        })
        .collect()
}

/// Plan shards for a table. Only single-column integer primary keys have a
/// splittable domain; everything else runs as one shard.
pub async fn plan_shards(source: &Conn, table: &VerifiedTable, splits: usize) -> Result<Vec<Shard>> {
    if splits <= 1 {
        return Ok(vec![Shard::full_domain()]);
    }
    if table.pk_len() != 1 || table.pk_types[0].0.kind() != DatumKind::Int {
        warn!(
            table = %table.name,
            "table splits require a single integer primary key; using one shard"
        );
        return Ok(vec![Shard::full_domain()]);
    }

    let dialect = source.dialect();
    let pk = quote_ident(dialect, &table.pk_columns[0]);
    let rows = source
        .query(&format!(
            "SELECT min({}), max({}) FROM {}",
            pk,
            pk,
            qualify_table(dialect, &table.name)
        ))
        .await?;
    let bounds = rows.first();
    let min = bounds
        .and_then(|row| row.first().cloned().flatten())
        .and_then(|v| v.parse::<i64>().ok());
    let max = bounds
        .and_then(|row| row.get(1).cloned().flatten())
        .and_then(|v| v.parse::<i64>().ok());
    match (min, max) {
        (Some(min), Some(max)) => Ok(split_int_range(min, max, splits)),
        // Empty table; one shard suffices.
        _ => Ok(vec![Shard::full_domain()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_shard_spans_everything() {
        assert_eq!(split_int_range(0, 1000, 1), vec![Shard::full_domain()]);
    }

    #[test]
    fn test_split_is_disjoint_and_exhaustive() {
        let shards = split_int_range(0, 4000, 4);
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0].lo, None);
        assert_eq!(shards[0].hi, Some(1000));
        assert_eq!(shards[1].lo, Some(1000));
        assert_eq!(shards[1].hi, Some(2000));
        assert_eq!(shards[2].lo, Some(2000));
        assert_eq!(shards[2].hi, Some(3000));
        assert_eq!(shards[3].lo, Some(3000));
        assert_eq!(shards[3].hi, None);
        // Adjacent bounds line up exactly.
        for pair in shards.windows(2) {
            assert_eq!(pair[0].hi, pair[1].lo);
        }
    }

    #[test]
    fn test_range_smaller_than_splits_collapses() {
        assert_eq!(split_int_range(0, 2, 4), vec![Shard::full_domain()]);
    }

    #[test]
    fn test_inverted_range_collapses() {
        assert_eq!(split_int_range(10, 5, 4), vec![Shard::full_domain()]);
    }

    #[test]
    fn test_negative_domain() {
        let shards = split_int_range(-2000, 2000, 2);
        assert_eq!(shards[0].hi, Some(0));
        assert_eq!(shards[1].lo, Some(0));
    }
}
