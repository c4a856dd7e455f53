//! # QB Lang
//!
//! A compiler and virtual machine for a structured legacy BASIC
//! dialect: labeled GOTO/GOSUB control flow, SUB/FUNCTION/DEF FN
//! procedures, sigil-typed variables, user-defined record types,
//! DATA/READ, and a library of built-in statements.
//!
//! The crate consumes an already-parsed syntax tree ([`lang::ast`]),
//! checks and lowers it into a flat, address-based [`mach::Program`],
//! and executes that program under a cooperative single-threaded
//! scheduler ([`mach::Invocation`]) that can suspend for user input
//! or device events while reproducing legacy arithmetic semantics.
//!
//! Lexing and parsing, concrete device implementations, and legacy
//! binary program formats are external collaborators and are not part
//! of this crate.

pub mod lang;
pub mod mach;
