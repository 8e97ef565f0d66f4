//! Command handlers for the langbridge CLI.

pub mod check;
pub mod highlight;
pub mod logging;
pub mod servers;
pub mod session;
pub mod symbols;
pub mod tokens;

pub use check::*;
pub use highlight::*;
pub use logging::*;
pub use servers::*;
pub use symbols::*;
pub use tokens::*;
