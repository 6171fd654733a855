//! A minimal job queue on top of the store: producers append under
//! monotonically increasing keys, workers pop from the front, and jobs
//! claimed with a lease reappear if the worker never acknowledges them.
//!
//! Run with: cargo run --example job_queue

use kvidxkit::{EngineType, Store, StoreError};

fn main() -> Result<(), StoreError> {
    let queue = Store::new("", EngineType::InMemory)?;

    // Producer side: keys are assigned from the tail
    for (cmd, body) in [
        (1u64, "resize image 0451"),
        (1, "resize image 0452"),
        (2, "send receipt to customer 9"),
    ] {
        let key = queue.max_key()?.map_or(1, |tail| tail + 1);
        queue.insert(key, 0, cmd, body.as_bytes())?;
        println!("enqueued #{key}: {body}");
    }
    println!("queue depth: {}", queue.key_count()?);

    // Worker side: claim the head job with a 30-second lease instead of
    // deleting it outright; an acknowledged job is removed, an abandoned
    // one expires back into the reaper's hands
    while let Some(head) = queue.min_key()? {
        let job = queue.get(head)?.expect("head vanished");
        println!(
            "working on #{} (cmd {}): {}",
            job.key,
            job.cmd,
            String::from_utf8_lossy(&job.data)
        );
        queue.expire_after(head, 30_000)?;

        // ... do the work ...
        queue.remove(head)?; // ack
    }

    println!("queue drained, depth: {}", queue.key_count()?);
    queue.close()
}
