/// Boilerplate impls for raw-pointer wrapper types.
pub(crate) mod boilerplate;

/// Interoperability with C return values and file-descriptor waits.
pub(crate) mod interop;

/// Cancellation token observed at blocking waits.
pub mod token;
