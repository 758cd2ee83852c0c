//! The outcome of a computation: a value or a [`Failure`].

use std::panic::{self, AssertUnwindSafe};

use crate::errors::Failure;

/// Success or failure of a completed computation.
pub type Try<T> = Result<T, Failure>;

/// Runs `f`, turning a panic into [`Failure::Panicked`].
pub fn catch<T, F>(f: F) -> Try<T>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(Failure::from_panic)
}

/// Runs a fallible `f`, turning both its error and a panic into a [`Failure`].
pub fn catch_fallible<T, E, F>(f: F) -> Try<T>
where
    F: FnOnce() -> Result<T, E>,
    E: std::error::Error + Send + Sync + 'static,
{
    catch(f).and_then(|result| result.map_err(Failure::error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catch_success() {
        assert_eq!(catch(|| 40 + 2).unwrap(), 42);
    }

    #[test]
    fn test_catch_panic_keeps_message() {
        let result: Try<()> = catch(|| panic!("boom"));
        match result {
            Err(Failure::Panicked(msg)) => assert_eq!(&*msg, "boom"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_catch_fallible_error() {
        let result: Try<u8> = catch_fallible(|| "x".parse::<u8>());
        assert!(matches!(result, Err(Failure::Error(_))));
    }
}
