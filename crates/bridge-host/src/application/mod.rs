//! Application layer use cases for the bridge host.
//!
//! # What is the "application" layer? (for beginners)
//!
//! The application layer sits between the domain types in `bridge-core` and
//! the OS-facing adapters in [`crate::infrastructure`].  Code here decides
//! *what* happens when a bridge is plugged in, identified, connected, or
//! unplugged.  It makes no OS calls of its own: the serial conversation and
//! the profile files sit behind the [`identify::DeviceIdentifier`] and
//! [`arbiter::ProfileRepository`] traits.
//!
//! # Sub-modules
//!
//! - **`claims`**   – The claim table: at most one connected profile per
//!   bridge serial.
//! - **`identify`** – The identification seam and its outcomes (identified,
//!   busy, timed out, failed).
//! - **`arbiter`**  – The per-device state machine binding serials to
//!   profiles and enforcing exclusivity.
//! - **`service`**  – The Tokio task that owns the arbiter and the handle the
//!   rest of the program uses to reach it.

pub mod arbiter;
pub mod claims;
pub mod identify;
pub mod service;
