//! Domain entities for the bridge host.
//!
//! Pure data and rules with no I/O: which USB devices count as bridges, and
//! what a persisted profile looks like.  The host crate's storage and
//! application layers build on these types; nothing here touches the file
//! system or a serial port.

pub mod device;
pub mod profile;
