//! Shape arithmetic for the operator kinds known to the optimizer
use crate::Error;

/// Ordered list of dimension sizes
pub type Shape = Vec<usize>;

/// Returns the number of elements in a tensor of the given shape
///
/// A rank-0 shape holds a single element.  Returns `None` if the count does
/// not fit in a `usize`.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
}

/// Two-way broadcasting, aligned from the trailing dimension
///
/// ```
/// # use tensorplan::shape::broadcast;
/// assert_eq!(broadcast(&[2, 1, 4], &[3, 1]).unwrap(), vec![2, 3, 4]);
/// assert!(broadcast(&[2, 3], &[4, 3]).is_err());
/// ```
pub fn broadcast(a: &[usize], b: &[usize]) -> Result<Shape, Error> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        // Missing leading dimensions behave like 1
        let da = a.len().checked_sub(rank - i).map_or(1, |j| a[j]);
        let db = b.len().checked_sub(rank - i).map_or(1, |j| b[j]);
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            (x, y) => return Err(Error::BadBroadcast(x, y)),
        };
    }
    Ok(out)
}

/// Checks whether `perm` is a reordering of `0..rank`
pub fn is_permutation(perm: &[usize], rank: usize) -> bool {
    if perm.len() != rank {
        return false;
    }
    let mut seen = vec![false; rank];
    for &p in perm {
        if p >= rank || std::mem::replace(&mut seen[p], true) {
            return false;
        }
    }
    true
}

/// Output shape of a transpose, where `out[i] = shape[perm[i]]`
pub fn transpose(shape: &[usize], perm: &[usize]) -> Result<Shape, Error> {
    if !is_permutation(perm, shape.len()) {
        return Err(Error::BadPermutation(perm.to_vec(), shape.len()));
    }
    Ok(perm.iter().map(|&p| shape[p]).collect())
}

/// Checks whether `perm` swaps the last two axes and fixes every other axis
///
/// ```
/// # use tensorplan::shape::swaps_trailing_axes;
/// assert!(swaps_trailing_axes(&[1, 0]));
/// assert!(swaps_trailing_axes(&[0, 2, 1]));
/// assert!(!swaps_trailing_axes(&[2, 1, 0]));
/// assert!(!swaps_trailing_axes(&[0, 1, 2]));
/// ```
pub fn swaps_trailing_axes(perm: &[usize]) -> bool {
    let rank = perm.len();
    rank >= 2
        && perm[..rank - 2].iter().enumerate().all(|(i, &p)| i == p)
        && perm[rank - 2] == rank - 1
        && perm[rank - 1] == rank - 2
}

/// Checks whether applying `first` and then `second` is a no-op
///
/// With `out[i] = in[perm[i]]`, the composition maps axis `i` to
/// `first[second[i]]`.
pub fn composes_to_identity(first: &[usize], second: &[usize]) -> bool {
    first.len() == second.len()
        && second
            .iter()
            .enumerate()
            .all(|(i, &s)| first.get(s) == Some(&i))
}

/// Output shape of a (batched) matrix multiplication
///
/// The trailing two dimensions of each operand are the matrix; any leading
/// dimensions are broadcast against each other.
pub fn matmul(
    a: &[usize],
    b: &[usize],
    trans_a: bool,
    trans_b: bool,
) -> Result<Shape, Error> {
    if a.len() < 2 {
        return Err(Error::BadRank(a.len(), 2));
    }
    if b.len() < 2 {
        return Err(Error::BadRank(b.len(), 2));
    }
    let (ra, rb) = (a.len(), b.len());
    let (m, ka) = if trans_a {
        (a[ra - 1], a[ra - 2])
    } else {
        (a[ra - 2], a[ra - 1])
    };
    let (kb, n) = if trans_b {
        (b[rb - 1], b[rb - 2])
    } else {
        (b[rb - 2], b[rb - 1])
    };
    if ka != kb {
        return Err(Error::MismatchedDims(ka, kb));
    }
    let mut out = broadcast(&a[..ra - 2], &b[..rb - 2])?;
    out.push(m);
    out.push(n);
    Ok(out)
}
