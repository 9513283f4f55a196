//! Driving the async SQLite driver from synchronous entry points

use std::{fmt, future::Future, sync::Arc};

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};

use crate::error::{QueryError, Result};

/// Where blocking calls run their futures
#[derive(Clone)]
pub(crate) enum BlockingBridge {
    /// The caller's multi-thread runtime, entered through `block_in_place`
    Ambient(Handle),
    /// A private current-thread runtime for callers outside any runtime
    Owned(Arc<Runtime>),
}

impl BlockingBridge {
    /// Bridge suited to the calling thread
    ///
    /// A current-thread runtime cannot block without deadlocking its own
    /// driver, so it is rejected.
    pub(crate) fn current() -> Result<Self> {
        match Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::MultiThread => Ok(Self::Ambient(handle)),
                flavor => Err(QueryError::configuration(format!(
                    "synchronous queries need a multi-thread tokio runtime or none at all, found {flavor:?}"
                ))),
            },
            Err(_) => {
                let runtime = Builder::new_current_thread().enable_all().build()?;
                Ok(Self::Owned(Arc::new(runtime)))
            }
        }
    }

    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            Self::Ambient(handle) => match Handle::try_current() {
                Ok(_) => tokio::task::block_in_place(|| handle.block_on(future)),
                Err(_) => handle.block_on(future),
            },
            Self::Owned(runtime) => runtime.block_on(future),
        }
    }
}

impl fmt::Debug for BlockingBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambient(_) => f.write_str("BlockingBridge::Ambient"),
            Self::Owned(_) => f.write_str("BlockingBridge::Owned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_runtime_uses_private_runtime() {
        let bridge = BlockingBridge::current().unwrap();
        assert!(matches!(bridge, BlockingBridge::Owned(_)));
        assert_eq!(bridge.block_on(async { 2 + 2 }), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multi_thread_runtime_blocks_in_place() {
        let bridge = BlockingBridge::current().unwrap();
        assert!(matches!(bridge, BlockingBridge::Ambient(_)));
        assert_eq!(bridge.block_on(async { 6 * 7 }), 42);
    }

    #[tokio::test]
    async fn test_current_thread_runtime_is_rejected() {
        let err = BlockingBridge::current().unwrap_err();
        assert!(matches!(err, QueryError::ConfigurationError(_)));
    }
}
