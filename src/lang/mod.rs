/*!
# Language Module

Source tokens, identifier rules, diagnostics, and the syntax tree this
crate compiles. Lexing and parsing happen outside the crate; the tree
arrives here already parsed and lexically valid.

*/

#[macro_use]
mod error;
mod ident;
mod token;

pub use error::Error;
pub use error::ErrorCode;
pub use error::Phase;
pub use ident::{first_char, split_sigil, untyped, untyped_no_period, SIGILS};
pub use token::Token;

pub mod ast;
