use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::context::WorkerContext;
use crate::db::Db;
use crate::error::{BatchFailure, DbError, DbResult};

/// Field/value pairs of one record on the batch path.
pub type FieldMap = BTreeMap<String, Vec<u8>>;

/// Multi-record variants of the data operations.
///
/// Keys and values are index-aligned. Implementations must call
/// [`validate_batch`] before touching storage and must never silently drop
/// an element: either every element succeeds or the call fails with
/// [`DbError::Batch`].
#[async_trait]
pub trait BatchDb: Db {
    /// Insert one record per key.
    async fn batch_insert(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        values: &[FieldMap],
    ) -> DbResult<()>;

    /// Read records, index-aligned with `keys`; a missing key yields `None`.
    ///
    /// `fields` of `None` or an empty slice selects every field.
    async fn batch_read(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        fields: Option<&[String]>,
    ) -> DbResult<Vec<Option<FieldMap>>>;

    /// Merge field/value pairs into existing records.
    async fn batch_update(
        &self,
        ctx: &mut WorkerContext,
        table: &str,
        keys: &[String],
        values: &[FieldMap],
    ) -> DbResult<()>;

    /// Delete one record per key.
    async fn batch_delete(&self, ctx: &mut WorkerContext, table: &str, keys: &[String])
        -> DbResult<()>;
}

/// Reject mismatched key/value sequences before any I/O.
pub fn validate_batch(keys: &[String], values: Option<&[FieldMap]>) -> DbResult<()> {
    if let Some(values) = values {
        if keys.len() != values.len() {
            return Err(DbError::Validation(format!(
                "batch has {} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
    }
    Ok(())
}

/// Keep only the selected fields; an empty selection keeps everything.
pub fn project(mut record: FieldMap, fields: Option<&[String]>) -> FieldMap {
    match fields {
        Some(fields) if !fields.is_empty() => {
            record.retain(|name, _| fields.iter().any(|f| f == name));
            record
        }
        _ => record,
    }
}

/// Collects per-element failures of an all-or-nothing batch.
#[derive(Debug)]
pub(crate) struct BatchOutcome {
    total: usize,
    failures: Vec<(usize, DbError)>,
}

impl BatchOutcome {
    pub(crate) fn new(total: usize) -> Self {
        Self {
            total,
            failures: Vec::new(),
        }
    }

    pub(crate) fn fail(&mut self, index: usize, err: DbError) {
        self.failures.push((index, err));
    }

    /// `Ok` if nothing failed, otherwise the failure report with nothing applied.
    pub(crate) fn into_result(self) -> DbResult<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(DbError::Batch(BatchFailure {
                total: self.total,
                applied: 0,
                failures: self.failures,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let keys = vec!["k1".to_string(), "k2".to_string()];
        let values = vec![fields(&[("f", "v")])];
        assert!(matches!(
            validate_batch(&keys, Some(values.as_slice())),
            Err(DbError::Validation(_))
        ));
        assert!(validate_batch(&keys, None).is_ok());
        assert!(validate_batch(&[], Some(&[][..])).is_ok());
    }

    #[test]
    fn empty_selection_keeps_all_fields() {
        let record = fields(&[("a", "1"), ("b", "2"), ("c", "3")]);
        assert_eq!(project(record.clone(), None), record);
        assert_eq!(project(record.clone(), Some(&[][..])), record);

        let picked = project(record, Some(&["c".to_string(), "zz".to_string()][..]));
        assert_eq!(picked, fields(&[("c", "3")]));
    }

    #[test]
    fn outcome_reports_every_failure() {
        let mut outcome = BatchOutcome::new(3);
        outcome.fail(0, DbError::not_found("t", "a"));
        outcome.fail(2, DbError::duplicate("t", "c"));
        match outcome.into_result() {
            Err(DbError::Batch(failure)) => {
                assert_eq!(failure.total, 3);
                assert_eq!(failure.applied, 0);
                let indexes: Vec<_> = failure.failures.iter().map(|(i, _)| *i).collect();
                assert_eq!(indexes, vec![0, 2]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(BatchOutcome::new(2).into_result().is_ok());
    }
}
