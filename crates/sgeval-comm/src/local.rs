use crate::{CommError, Collective, Gatherable};

/// Single-process group: rank 0 of 1. Barriers return immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCollective;

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<(), CommError> {
        Ok(())
    }

    fn all_gather<T: Gatherable>(&self, value: T) -> Result<Vec<T>, CommError> {
        Ok(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_gather_is_singleton() {
        let c = LocalCollective;
        assert!(c.is_main_process());
        assert_eq!(c.all_gather(7u32).unwrap(), vec![7]);
        c.barrier().unwrap();
    }
}
