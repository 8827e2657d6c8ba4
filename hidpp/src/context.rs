//! The state shared by every session created by the same owner.

use std::{io, sync::Arc};

use crate::{options::Options, workqueue::WorkerPool};

/// Bundles the options and the worker pool sessions are created with.
///
/// There are no process-wide singletons; a context is created once and handed
/// to every session explicitly.
pub struct Context {
    options: Options,
    pool: WorkerPool,
}

impl Context {
    pub fn new(options: Options) -> io::Result<Arc<Self>> {
        let pool = WorkerPool::new(options.worker_threads)?;
        Ok(Arc::new(Self { options, pool }))
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
