//! Stream combinators for outbound frame pacing.

mod pace;

pub use pace::{PaceExt, Paced};
