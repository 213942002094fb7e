//! Capacity bound for admission control.
//!
//! The check compares a snapshot of the current load against the bound.
//! It is taken under the scheduler's admission lock but is not
//! transactional with the queue insert that follows, so concurrent
//! enqueues may slightly over- or under-admit. Consumers draining the
//! queue bring the load back under the bound, so the bound is never
//! permanently bypassed.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    max: Option<usize>,
}

impl Capacity {
    pub fn unbounded() -> Self {
        Self { max: None }
    }

    pub fn bounded(max: usize) -> Self {
        Self {
            max: Some(max).filter(|max| *max > 0),
        }
    }

    pub fn max(&self) -> Option<usize> {
        self.max
    }

    /// Deny admitting `incoming` items when the load would exceed the bound.
    pub fn check(&self, load: usize, incoming: usize) -> Result<()> {
        match self.max {
            Some(max) if load.saturating_add(incoming) > max => {
                Err(Error::CapacityExceeded { max })
            }
            _ => Ok(()),
        }
    }
}

impl From<Option<usize>> for Capacity {
    fn from(max: Option<usize>) -> Self {
        max.map_or_else(Capacity::unbounded, Capacity::bounded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_admits_anything() {
        Capacity::unbounded().check(usize::MAX, 10).unwrap();
    }

    #[test]
    fn admits_up_to_the_bound() {
        let capacity = Capacity::bounded(2);
        capacity.check(0, 2).unwrap();
        capacity.check(1, 1).unwrap();
        assert!(matches!(
            capacity.check(2, 1),
            Err(Error::CapacityExceeded { max: 2 })
        ));
    }

    #[test]
    fn batch_larger_than_bound_is_denied_on_an_empty_queue() {
        assert!(Capacity::bounded(1).check(0, 4).is_err());
    }

    #[test]
    fn zero_bound_means_unbounded() {
        assert_eq!(Capacity::bounded(0), Capacity::unbounded());
    }
}
