//! Processing many independent archives with a bounded number of workers.
//!
//! Each archive is still read or written strictly sequentially; only whole
//! archives run side by side. With the `parallel` feature the work runs on a
//! dedicated Rayon pool of `jobs` threads, otherwise serially.

use tracing::debug;

use crate::error::Result;

/// Apply `task` to every input. Results come back in input order, one per
/// input; a failure in one archive does not stop the others.
pub fn run<T, R, F>(inputs: &[T], jobs: usize, task: F) -> Vec<Result<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Result<R> + Sync + Send,
{
    let jobs = jobs.max(1);
    if jobs == 1 || inputs.len() < 2 {
        return inputs.iter().map(&task).collect();
    }

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
            Ok(pool) => {
                debug!(jobs, archives = inputs.len(), "running batch on thread pool");
                return pool.install(|| inputs.par_iter().map(&task).collect());
            }
            Err(e) => debug!(error = %e, "thread pool unavailable, running serially"),
        }
    }

    #[cfg(not(feature = "parallel"))]
    {
        debug!(jobs, "built without the parallel feature, running serially");
    }

    inputs.iter().map(&task).collect()
}
