/*!
# Machine Module

The compiler middle-end and virtual machine. `compile` turns a parsed
syntax tree into an executable [`Program`]: the semantic analyzer
resolves names, checks types, and allocates storage; the code
generator lowers structured statements into flat per-procedure chunks;
a final link pass resolves every label reference. [`Invocation`] then
steps the compiled program under a cooperative scheduler against
injected [`Devices`].

*/

mod builtins;
mod codegen;
mod common;
mod context;
mod devices;
mod events;
mod expr;
mod files;
mod invocation;
mod memory;
mod program;
mod statement;
mod symbol;
mod ty;
mod typer;
mod val;
mod var;

pub use common::CommonBlock;
pub use context::ExecutionContext;
pub use devices::{
    Devices, Disk, FakeHandles, FakeKeys, FakeTimer, Joystick, Keyboard, LightPen, Printer,
    ScreenCapture, Speaker, SystemTimer, TextScreen, TimerDevice,
};
pub use events::{Channel, Events, TrapState};
pub use files::{FileAccessor, FileMode, Files, MemoryOpener, OpenFile, Opener};
pub use invocation::{Event, Invocation, Limits, State};
pub use memory::{Address, Memory, StorageClass};
pub use program::{DataItem, Program, ProgramChunk};
pub use statement::{ControlFlow, InputRequest, Statement};
pub use symbol::{Procedure, Symbol, SymbolTable};
pub use ty::{RecordTy, Ty};
pub use val::Val;
pub use var::Variable;

use crate::lang::{ast, Error};

/// Compile a parsed program. The analyzer walks the tree once to
/// resolve and type every name, the generator walks it again to emit
/// flat statement chunks, and the link pass resolves forward label
/// references. Any error aborts compilation; there is no partial
/// output.
pub fn compile(ast: &[ast::Statement]) -> Result<Program, Error> {
    let (mut program, notes) = typer::analyze(ast)?;
    codegen::generate(&mut program, ast, &notes)?;
    program.link()?;
    Ok(program)
}
