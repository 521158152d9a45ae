//! Inline or Isolated Execution
//!
//! Storage operations are blocking `std::fs` calls. An [`Executor`] decides
//! where they run: directly on the task that awaits them, or on tokio's
//! blocking thread pool. The result contract is the same either way; a crash
//! in the isolated context comes back as [`StorageError::Isolated`] instead of
//! leaving the caller waiting.

use crate::error::StorageError;
use std::any::Any;
use tracing::warn;

/// Where a storage operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Executor {
    /// On the awaiting task. Blocks its tokio worker until the operation,
    /// lock wait included, is done.
    #[default]
    Inline,
    /// On a separate blocking thread, result delivered back over the join handle
    Isolated,
}

impl Executor {
    /// Maps the `execute_inline` configuration flag to an executor.
    pub fn from_inline_flag(inline: bool) -> Self {
        if inline {
            Self::Inline
        } else {
            Self::Isolated
        }
    }

    /// Runs `operation` and returns its result.
    pub async fn run<T, F>(self, operation: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            Self::Inline => operation(),
            Self::Isolated => match tokio::task::spawn_blocking(operation).await {
                Ok(result) => result,
                Err(e) => {
                    let reason = if e.is_panic() {
                        panic_message(e.into_panic())
                    } else {
                        "isolated task was cancelled".to_string()
                    };
                    warn!(reason = %reason, "Isolated storage operation crashed");
                    Err(StorageError::Isolated(reason))
                }
            },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "isolated task panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_inline_flag() {
        assert_eq!(Executor::from_inline_flag(true), Executor::Inline);
        assert_eq!(Executor::from_inline_flag(false), Executor::Isolated);
    }

    #[tokio::test]
    async fn test_inline_returns_result() {
        let value = Executor::Inline.run(|| Ok(7)).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_isolated_returns_result() {
        let value = Executor::Isolated.run(|| Ok("done")).await.unwrap();
        assert_eq!(value, "done");
    }

    #[tokio::test]
    async fn test_isolated_propagates_operation_error() {
        let result: Result<(), _> = Executor::Isolated
            .run(|| Err(StorageError::Isolated("inner".into())))
            .await;
        assert!(matches!(result, Err(StorageError::Isolated(msg)) if msg == "inner"));
    }

    #[tokio::test]
    async fn test_isolated_panic_becomes_error() {
        let result: Result<(), _> = Executor::Isolated
            .run(|| panic!("disk on fire"))
            .await;
        assert!(matches!(result, Err(StorageError::Isolated(msg)) if msg.contains("disk on fire")));
    }
}
