//! Unit-of-work batches for composed atomic writes.
//!
//! Every state-mutating registry and queue operation comes in two forms: a
//! standalone method that opens its own batch and commits before returning,
//! and a `stage_*` method that appends its writes to a caller-supplied
//! [`Batch`]. Compound transitions (finish a task = clear the running slot
//! + update the task record + index it in a registry) stage into one batch
//! and commit once, so no observer ever sees a partial move.

/// A batch of writes applied as a single atomic unit (Redis MULTI/EXEC).
pub struct Batch {
    pipe: redis::Pipeline,
}

impl Batch {
    /// Creates an empty atomic batch.
    pub fn new() -> Self {
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self { pipe }
    }

    /// Returns the underlying pipeline for staging writes.
    pub fn pipeline(&mut self) -> &mut redis::Pipeline {
        &mut self.pipe
    }

    pub(crate) fn into_pipeline(self) -> redis::Pipeline {
        self.pipe
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_stages_commands() {
        let mut batch = Batch::new();
        batch.pipeline().sadd("k", "v").ignore();
        batch.pipeline().del("k2").ignore();

        assert_eq!(batch.into_pipeline().cmd_iter().count(), 2);
    }
}
