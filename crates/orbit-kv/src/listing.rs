//! Paged hierarchical listing over an ordered store.
//!
//! Implements the listing contract the pointer service exposes: an optional
//! prefix (stripped from results), exclusive `start_after` / `end_before`
//! bounds relative to that prefix, and non-recursive collapsing of runs that
//! share the next delimiter-bounded component into single prefix entries.

use crate::{KeyValueStore, KvError, DELIMITER, LOOKUP_LIMIT};

/// Options for [`list_v2`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Key prefix selecting the listed subtree; stripped from results.
    pub prefix: Vec<u8>,
    /// Exclusive lower bound, relative to `prefix`.
    pub start_after: Vec<u8>,
    /// Exclusive upper bound, relative to `prefix`. Empty means unbounded.
    pub end_before: Vec<u8>,
    /// When false, collapse runs sharing the next `/`-bounded component.
    pub recursive: bool,
    /// Maximum items to return; 0 means [`LOOKUP_LIMIT`].
    pub limit: usize,
    /// Attach stored values to non-prefix items.
    pub include_values: bool,
}

/// A single listing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListItem {
    /// Key relative to the requested prefix.
    pub key: Vec<u8>,
    /// Stored value, when requested and the item is not a prefix.
    pub value: Option<Vec<u8>>,
    /// True when this entry stands for a collapsed run of keys.
    pub is_prefix: bool,
}

impl ListItem {
    fn plain(key: Vec<u8>, value: Option<Vec<u8>>) -> Self {
        Self {
            key,
            value,
            is_prefix: false,
        }
    }

    fn prefix(key: Vec<u8>) -> Self {
        Self {
            key,
            value: None,
            is_prefix: true,
        }
    }
}

/// Lists items under `opts.prefix` in ascending byte order.
///
/// Returns the page and `more = true` when the scan was truncated by the
/// limit with at least one further item remaining.
pub fn list_v2(
    store: &dyn KeyValueStore,
    opts: ListOptions,
) -> Result<(Vec<ListItem>, bool), KvError> {
    let limit = if opts.limit == 0 || opts.limit > LOOKUP_LIMIT {
        LOOKUP_LIMIT
    } else {
        opts.limit
    };

    let mut begin = opts.prefix.clone();
    begin.extend_from_slice(&opts.start_after);

    // A start_after naming a collapsed prefix means its whole run is behind
    // the bound, not just the single key.
    let mut last_prefix: Option<Vec<u8>> = if opts.start_after.last() == Some(&DELIMITER) {
        Some(opts.start_after.clone())
    } else {
        None
    };

    let mut items: Vec<ListItem> = Vec::new();
    let mut more = false;

    store.iterate(&begin, &mut |key, value| {
        if !key.starts_with(&opts.prefix) {
            return false;
        }
        let relative = &key[opts.prefix.len()..];

        if !opts.start_after.is_empty() && relative <= opts.start_after.as_slice() {
            return true;
        }
        if !opts.end_before.is_empty() && relative >= opts.end_before.as_slice() {
            return false;
        }

        let item = if opts.recursive {
            let value = opts.include_values.then(|| value.to_vec());
            ListItem::plain(relative.to_vec(), value)
        } else if let Some(idx) = relative.iter().position(|&b| b == DELIMITER) {
            let collapsed = relative[..=idx].to_vec();
            if last_prefix.as_deref() == Some(collapsed.as_slice()) {
                return true;
            }
            last_prefix = Some(collapsed.clone());
            ListItem::prefix(collapsed)
        } else {
            let value = opts.include_values.then(|| value.to_vec());
            ListItem::plain(relative.to_vec(), value)
        };

        if items.len() == limit {
            more = true;
            return false;
        }
        items.push(item);
        true
    })?;

    Ok((items, more))
}
