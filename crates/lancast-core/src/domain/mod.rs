//! Pure domain logic: roster entities, quality classification, address ranking.
//!
//! Nothing in this module performs I/O, so every rule here is unit-testable
//! without sockets or timers.

pub mod quality;
pub mod ranker;
pub mod viewer;
