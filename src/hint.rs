//! Branch prediction hints for the allocation hot path.

#[inline]
#[cold]
fn cold() {}

/// Hints to the compiler that the condition is likely true.
#[inline]
pub fn likely(b: bool) -> bool {
    if !b {
        cold()
    }
    b
}

/// Hints to the compiler that the condition is unlikely true.
#[inline]
pub fn unlikely(b: bool) -> bool {
    if b {
        cold()
    }
    b
}
