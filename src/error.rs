use std::fmt;

/// Error returned when a map is constructed with a capacity of zero.
///
/// A zero capacity cannot describe a usable table: the bin array length must
/// be a non-zero power of two at every instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError;

impl fmt::Display for CapacityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "map capacity must be greater than zero")
    }
}

impl std::error::Error for CapacityError {}
