//! Recommended access order for a batch of retrieve jobs.

use crate::mount::RetrieveJob;

/// Reorders a batch to minimise tape positioning.
pub trait RaoStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// A permutation of `0..jobs.len()` giving the order to read the jobs in.
    fn perform_rao(&self, jobs: &[RetrieveJob]) -> Vec<usize>;
}

/// Reads jobs in ascending fSeq order.
#[derive(Clone, Copy, Debug, Default)]
pub struct FseqOrder;

impl RaoStrategy for FseqOrder {
    fn name(&self) -> &str {
        "fseq_order"
    }

    fn perform_rao(&self, jobs: &[RetrieveJob]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..jobs.len()).collect();
        order.sort_by_key(|i| jobs[*i].job.fseq);
        order
    }
}

/// Whether `order` is a permutation of `0..len`.
pub(crate) fn is_permutation(order: &[usize], len: usize) -> bool {
    if order.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    for &i in order {
        if i >= len || seen[i] {
            return false;
        }
        seen[i] = true;
    }
    true
}
