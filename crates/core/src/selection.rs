use std::collections::BTreeSet;

use crate::config::JobDefinition;
use crate::{Error, Result};

/// Resolves a selection such as `"1,3-5,photos"` against the configured jobs.
///
/// Items are 1-based positions, inclusive `a-b` ranges (either order), or job
/// names. The result is ascending and free of duplicates. Any item that does
/// not resolve fails the whole selection.
pub fn resolve_selection(selection: &str, jobs: &[JobDefinition]) -> Result<Vec<usize>> {
    let mut picked = BTreeSet::new();

    for raw in selection.split(',') {
        let item = raw.trim();
        if item.is_empty() {
            continue;
        }

        if let Some(index) = jobs.iter().position(|j| j.name == item) {
            picked.insert(index);
            continue;
        }

        if let Some((a, b)) = item.split_once('-')
            && let (Ok(a), Ok(b)) = (a.trim().parse::<usize>(), b.trim().parse::<usize>())
        {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            for n in lo..=hi {
                picked.insert(position(n, item, jobs.len())?);
            }
            continue;
        }

        match item.parse::<usize>() {
            Ok(n) => {
                picked.insert(position(n, item, jobs.len())?);
            }
            Err(_) => {
                return Err(Error::JobNotFound {
                    selector: item.to_string(),
                });
            }
        }
    }

    if picked.is_empty() {
        return Err(Error::JobNotFound {
            selector: selection.to_string(),
        });
    }
    Ok(picked.into_iter().collect())
}

fn position(n: usize, item: &str, len: usize) -> Result<usize> {
    if n == 0 || n > len {
        return Err(Error::JobNotFound {
            selector: item.to_string(),
        });
    }
    Ok(n - 1)
}
