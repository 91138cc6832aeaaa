use std::fmt;

/// Possible errors returned by methods on the routing stores. All of them
/// are recoverable from the caller's point of view: the trie stays the
/// source of truth and a later mutation will re-mark any window a failed
/// rebuild left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibStoreError {
    /// A route for the exact (address, prefix length) pair is already in
    /// the table. Use the `set` semantics to overwrite it.
    AlreadyExists,
    /// The requested prefix was not found in the table.
    NotFound,
    /// A textual route specification could not be parsed. Carries the
    /// 1-based index of the offending argument.
    Malformed(usize),
    /// A fixed-size pool ran out: the nexthop table, the DIR-24-8
    /// secondary block pool, or the DXR range pool. The route set is too
    /// rich for the configured table geometry.
    OutOfCapacity,
    /// The node arena cannot grow any further.
    OutOfMemory,
}

impl std::error::Error for FibStoreError {}

impl fmt::Display for FibStoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FibStoreError::AlreadyExists => {
                write!(f, "Error: A route for this prefix already exists.")
            }
            FibStoreError::NotFound => {
                write!(f, "Error: No route for this prefix exists.")
            }
            FibStoreError::Malformed(arg) => {
                write!(
                    f,
                    "Error: Argument {} should be ADDR/MASK [GW] OUTPUT.",
                    arg
                )
            }
            FibStoreError::OutOfCapacity => {
                write!(
                    f,
                    "Error: A lookup table pool is exhausted. The route \
                    cannot be expressed in the configured table geometry."
                )
            }
            FibStoreError::OutOfMemory => {
                write!(f, "Error: The node arena cannot grow any further.")
            }
        }
    }
}
