use std::time::{Duration, Instant};

use bramble::{ExecutorRef, Future, ShutdownMode, ThreadPool, ThreadPoolConfig};
use tracing::info;

// Below this the recursion runs sequentially on one worker
const SEQUENTIAL_CUTOFF: u64 = 20;

fn fib_sequential(n: u64) -> u64 {
    if n < 2 {
        n
    } else {
        fib_sequential(n - 1) + fib_sequential(n - 2)
    }
}

// Each branch is scheduled through flat_map, so the tree unfolds on the pool
// and idle workers steal subtrees from busy ones.
fn fib(exec: ExecutorRef, n: u64) -> Future<u64> {
    if n <= SEQUENTIAL_CUTOFF {
        return Future::spawn(&exec, move || fib_sequential(n));
    }

    let e = exec.clone();
    let left = Future::successful(n - 1).flat_map(&exec, move |m| fib(e, m));
    let e = exec.clone();
    let right = Future::successful(n - 2).flat_map(&exec, move |m| fib(e, m));

    left.zip(&exec, &right).map(&exec, |(a, b)| a + b)
}

fn main() -> anyhow::Result<()> {
    bramble::logging::init_default();

    let n: u64 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse())
        .transpose()?
        .unwrap_or(32);

    let pool = ThreadPool::new(ThreadPoolConfig::default())?;
    let exec = pool.executor();

    let start = Instant::now();
    let result = fib(exec, n).get(Duration::from_secs(300))?;
    info!("fib({}) = {} in {:?}", n, result, start.elapsed());

    for termination in pool.shutdown(ShutdownMode::ExecuteSubmitted) {
        termination.get(Duration::from_secs(10))?;
    }
    println!("{}", pool.statistics());
    Ok(())
}
