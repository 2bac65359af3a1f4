use std::collections::{BTreeMap, HashMap, HashSet};

use crate::storage::{ItemChange, ItemDelta, ParsedItem, StoredItem};

/// Compute the delta that brings a feed's stored items in line with a fresh
/// parse.
///
/// `active` and `archived` are the feed's stored items by status. The join key
/// is the GUID and the content hash is the only change detector:
///
/// | fresh | stored          | hash    | result      |
/// |-------|-----------------|---------|-------------|
/// | yes   | active          | differs | update      |
/// | yes   | active          | same    | touch       |
/// | yes   | archived        | any     | resurrection|
/// | yes   | -               | -       | insert      |
/// | no    | active          | -       | archival    |
///
/// When the fresh list repeats a GUID the entry with the largest
/// `(published, content_hash)` wins, so the result does not depend on
/// document order. Every list in the returned delta is ordered by GUID.
pub fn reconcile(
    fresh: &[ParsedItem],
    active: &[StoredItem],
    archived: &[StoredItem],
    observed_at: i64,
) -> ItemDelta {
    let mut latest: BTreeMap<&str, &ParsedItem> = BTreeMap::new();
    for item in fresh {
        latest
            .entry(item.guid.as_str())
            .and_modify(|current| {
                if precedence(item) > precedence(current) {
                    *current = item;
                }
            })
            .or_insert(item);
    }

    let active_by_guid: HashMap<&str, &StoredItem> =
        active.iter().map(|i| (i.guid.as_str(), i)).collect();
    let archived_by_guid: HashMap<&str, &StoredItem> =
        archived.iter().map(|i| (i.guid.as_str(), i)).collect();

    let mut delta = ItemDelta {
        observed_at,
        ..Default::default()
    };

    for (guid, item) in &latest {
        if let Some(stored) = active_by_guid.get(guid) {
            if stored.content_hash == item.content_hash {
                delta.touches.push(stored.id);
            } else {
                delta.updates.push(ItemChange {
                    item_id: stored.id,
                    item: (*item).clone(),
                });
            }
        } else if let Some(stored) = archived_by_guid.get(guid) {
            delta.resurrections.push(ItemChange {
                item_id: stored.id,
                item: (*item).clone(),
            });
        } else {
            delta.inserts.push((*item).clone());
        }
    }

    let present: HashSet<&str> = latest.keys().copied().collect();
    let mut gone: Vec<&StoredItem> = active
        .iter()
        .filter(|i| !present.contains(i.guid.as_str()))
        .collect();
    gone.sort_by(|a, b| a.guid.cmp(&b.guid));
    delta.archivals = gone.into_iter().map(|i| i.id).collect();

    delta
}

fn precedence(item: &ParsedItem) -> (Option<i64>, &str) {
    (item.published, item.content_hash.as_str())
}
