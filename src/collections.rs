//! Hash set alias that switches between gxhash and std based on the
//! `gxhash` feature. gxhash needs AES intrinsics at compile time.
//!
//! Construct sets with `HashSet::default()`, which works for both hashers.

/// Type alias for HashSet that uses gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashSet<T> = gxhash::HashSet<T>;

/// Type alias for HashSet that uses gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashSet<T> = std::collections::HashSet<T>;
