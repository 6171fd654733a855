//! Using the store as a consensus-style log: indices are keys, `term`
//! tracks the leadership epoch each record was written under, and a
//! follower resolves conflicts by truncating its tail before appending the
//! leader's records in one atomic batch.
//!
//! Run with: cargo run --example replicated_log

use kvidxkit::{EngineType, Entry, Store, StoreError};

fn main() -> Result<(), StoreError> {
    let log = Store::new("", EngineType::InMemory)?;

    // A follower that accepted entries 1..=5 under term 1
    for index in 1..=5u64 {
        log.insert(index, 1, 0, format!("op-{index}").as_bytes())?;
    }

    // The new leader (term 2) ships entries 4..=7; its entry 4 disagrees
    // with ours, so everything from the conflict point on is discarded
    let leader_tail: Vec<Entry> = (4..=7u64)
        .map(|index| Entry::new(index, 2, 0, format!("op-{index}' (term 2)").into_bytes()))
        .collect();

    let conflict = leader_tail
        .iter()
        .find_map(|entry| {
            match log.exists_with_term(entry.key, entry.term) {
                Ok(true) => None,              // already consistent
                Ok(false) if log.exists(entry.key).ok()? => Some(entry.key),
                _ => None,                     // past our tail, nothing to cut
            }
        });

    log.begin()?;
    if let Some(index) = conflict {
        let dropped = log.truncate_from(index)?;
        println!("truncated {dropped} conflicting entries from index {index}");
    }
    for entry in &leader_tail {
        if !log.exists(entry.key)? {
            log.insert(entry.key, entry.term, entry.cmd, &entry.data)?;
        }
    }
    log.commit()?;

    println!("log after reconciliation:");
    for entry in log.iter()? {
        let entry = entry?;
        println!(
            "  [{}] term {}: {}",
            entry.key,
            entry.term,
            String::from_utf8_lossy(&entry.data)
        );
    }
    assert_eq!(log.max_key()?, Some(7));
    log.close()
}
