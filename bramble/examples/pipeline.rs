use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bramble::{
    ExecutorRef, Failure, Future, HashAffinity, ShutdownMode, SharedQueueKind, ThreadPool,
    ThreadPoolConfig,
};
use tracing::{info, warn};

const WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct Record {
    id: u32,
    payload: String,
}

fn fetch(exec: &ExecutorRef, id: u32) -> Future<Record> {
    Future::spawn(exec, move || {
        thread::sleep(Duration::from_millis(u64::from(id % 5)));
        if id % 13 == 0 {
            panic!("record {} is corrupt", id);
        }
        Record {
            id,
            payload: format!("record-{:04}", id),
        }
    })
}

fn main() -> anyhow::Result<()> {
    bramble::logging::init_development();

    let pool = ThreadPool::new(ThreadPoolConfig {
        worker_count: 4,
        shared_queue_count: 2,
        shared_queue_kind: SharedQueueKind::LockFree,
        affinity: Arc::new(HashAffinity),
        ..Default::default()
    })?;
    let exec = pool.executor();

    // corrupt records are replaced instead of failing the whole batch
    let lengths = Future::traverse(1..=100u32, &exec, |id| {
        fetch(&exec, id)
            .recover(&exec, move |failure| match failure {
                Failure::Panicked(_) => Some(Record {
                    id,
                    payload: String::new(),
                }),
                _ => None,
            })
            .map(&exec, |record| (record.id, record.payload.len()))
    });

    let total = Future::fold(vec![lengths.clone()], &exec, 0usize, |acc, batch| {
        acc + batch.iter().map(|(_, len)| len).sum::<usize>()
    });

    let empty = lengths.map(&exec, |batch| {
        batch
            .iter()
            .filter(|(_, len)| *len == 0)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>()
    });

    let first_long = Future::find(
        (1..=10u32).map(|id| fetch(&exec, id * 7)).collect(),
        &exec,
        |record: &Record| record.id > 20,
    );

    info!("total payload bytes: {}", total.get(WAIT)?);
    warn!("recovered records: {:?}", empty.get(WAIT)?);
    match first_long.get(WAIT)? {
        Some(record) => info!("first long-id record: {:?}", record),
        None => info!("no record with id > 20"),
    }

    for termination in pool.shutdown(ShutdownMode::ExecuteSubmitted) {
        termination.get(WAIT)?;
    }
    println!("{}", pool.statistics());
    Ok(())
}
