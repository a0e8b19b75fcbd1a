use crate::error::{Error, Result};
use crate::fits::BinTable;

// ---------------------------------------------------------------------------
// Row selection in a fibermap
// ---------------------------------------------------------------------------

/// Which fibermap rows belong to the requested object.
///
/// A row matches when:
/// * `TARGETID == targetid` if a target id is given, otherwise
///   `FIBER == fiber`;
/// * and, when `expid` is given, `EXPID == expid`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RowSelector {
    pub targetid: Option<i64>,
    pub fiber: Option<i64>,
    pub expid: Option<i64>,
}

impl RowSelector {
    pub fn target(targetid: i64) -> Self {
        Self {
            targetid: Some(targetid),
            ..Default::default()
        }
    }

    pub fn fiber(fiber: i64) -> Self {
        Self {
            fiber: Some(fiber),
            ..Default::default()
        }
    }

    pub fn with_expid(mut self, expid: Option<i64>) -> Self {
        self.expid = expid;
        self
    }

    /// Indices of the matching rows, in table order.
    pub fn matching_rows(&self, fibermap: &BinTable) -> Result<Vec<usize>> {
        let (column, wanted) = match (self.targetid, self.fiber) {
            (Some(t), _) => ("TARGETID", t),
            (None, Some(f)) => ("FIBER", f),
            (None, None) => {
                return Err(Error::InvalidQuery(
                    "either a target id or a fiber is needed to pick a spectrum".into(),
                ))
            }
        };
        let keys = fibermap.column_i64(column)?;
        let expids = match self.expid {
            Some(_) => Some(fibermap.column_i64("EXPID")?),
            None => None,
        };

        Ok(keys
            .iter()
            .enumerate()
            .filter(|&(row, &key)| {
                key == wanted
                    && match (&expids, self.expid) {
                        (Some(e), Some(expid)) => e[row] == expid,
                        _ => true,
                    }
            })
            .map(|(row, _)| row)
            .collect())
    }
}
