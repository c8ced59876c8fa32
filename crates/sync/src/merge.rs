//! Last-write-wins merging of remote records into local ones.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::{DateTime, Utc};

/// True when `incoming` is strictly newer than `local`. A stamped record beats
/// an unstamped one; two unstamped records never replace each other.
pub fn is_newer(incoming: Option<DateTime<Utc>>, local: Option<DateTime<Utc>>) -> bool {
    match (incoming, local) {
        (Some(incoming), Some(local)) => incoming > local,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Merge `incoming` over `local` by key, keeping a record only when it is
/// absent locally or strictly newer. Within `incoming` the newest record per
/// key wins. The winners, in incoming order, are handed to `setter` once if
/// there are any. Returns how many records won.
pub fn merge_records<T, K>(
    incoming: impl IntoIterator<Item = T>,
    local: &[T],
    key_of: impl Fn(&T) -> K,
    updated_at_of: impl Fn(&T) -> Option<DateTime<Utc>>,
    setter: impl FnOnce(Vec<T>),
) -> usize
where
    K: Eq + Hash,
{
    merge_with(incoming, local, key_of, updated_at_of, setter, |incoming, local| match local {
        None => true,
        Some(local) => is_newer(incoming, local),
    })
}

/// Merge acknowledgements of our own pushes. An ack replaces the local record
/// unless the local one was edited again after the push (strictly newer), so
/// remote ids and server-side winners are picked up.
pub fn merge_acks<T, K>(
    acks: impl IntoIterator<Item = T>,
    local: &[T],
    key_of: impl Fn(&T) -> K,
    updated_at_of: impl Fn(&T) -> Option<DateTime<Utc>>,
    setter: impl FnOnce(Vec<T>),
) -> usize
where
    K: Eq + Hash,
{
    merge_with(acks, local, key_of, updated_at_of, setter, |ack, local| match local {
        None => true,
        Some(local) => !is_newer(local, ack),
    })
}

type Stamp = Option<DateTime<Utc>>;

fn merge_with<T, K>(
    incoming: impl IntoIterator<Item = T>,
    local: &[T],
    key_of: impl Fn(&T) -> K,
    updated_at_of: impl Fn(&T) -> Option<DateTime<Utc>>,
    setter: impl FnOnce(Vec<T>),
    accept: impl Fn(Stamp, Option<Stamp>) -> bool,
) -> usize
where
    K: Eq + Hash,
{
    let local_stamps: HashMap<K, Stamp> = local
        .iter()
        .map(|record| (key_of(record), updated_at_of(record)))
        .collect();

    let mut winners: Vec<T> = Vec::new();
    let mut slot_of: HashMap<K, usize> = HashMap::new();
    for record in incoming {
        let key = key_of(&record);
        let stamp = updated_at_of(&record);
        if !accept(stamp, local_stamps.get(&key).copied()) {
            continue;
        }
        match slot_of.get(&key).and_then(|&i| winners.get_mut(i)) {
            Some(existing) => {
                if is_newer(stamp, updated_at_of(existing)) {
                    *existing = record;
                }
            }
            None => {
                slot_of.insert(key, winners.len());
                winners.push(record);
            }
        }
    }

    let count = winners.len();
    if count > 0 {
        setter(winners);
    }
    count
}
