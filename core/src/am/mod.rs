//! Active Message subsystem: wire frame encoding, invocation tokens, and the
//! engine that drives them over a `Transport` (spec §4).

pub mod engine;
pub mod frame;
pub mod token;

pub use engine::Engine;
pub use frame::{AmFrame, Category, Cmd};
pub use token::Token;
