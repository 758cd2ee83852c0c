// Integration tests for awaiting bramble futures from async code


use bramble::Failure;
use test_helpers::{drain, pool};

#[tokio::test]
async fn test_await_submitted_task() -> anyhow::Result<()> {
    let pool = pool(2, 64)?;
    let exec = pool.executor();

    let value = pool.submit(|| 6 * 7)?.map(&exec, |x| x + 1).await?;
    assert_eq!(value, 43);

    drain(&pool)?;
    Ok(())
}

#[tokio::test]
async fn test_await_failure() -> anyhow::Result<()> {
    let pool = pool(1, 64)?;
    let result = pool.submit(|| -> u8 { panic!("async boom") })?.await;
    assert!(matches!(result, Err(Failure::Panicked(_))));
    drain(&pool)?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_join_many_futures() -> anyhow::Result<()> {
    let pool = pool(4, 64)?;
    let mut handles = Vec::new();
    for i in 0..16u64 {
        handles.push(pool.submit(move || i * i)?);
    }
    let mut sum = 0;
    for handle in handles {
        sum += handle.await?;
    }
    assert_eq!(sum, (0..16u64).map(|i| i * i).sum::<u64>());
    drain(&pool)?;
    Ok(())
}
