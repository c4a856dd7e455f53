use super::context::ExecutionContext;
use super::devices::Devices;
use super::events::Channel;
use super::program::Program;
use super::statement::{ControlFlow, InputRequest};
use super::val::Val;
use crate::error;
use crate::lang::Error;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## Execution engine
///
/// A cooperative, single-threaded scheduler over a compiled program.
/// The call stack holds program locations, distinct from memory's
/// automatic frames; `step` executes exactly one statement and
/// applies its control-flow effect. The run loop executes a bounded
/// burst and yields so the host can interleave device work; nothing
/// here ever blocks the host thread.

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum State {
    Idle,
    Running,
    Waiting,
    Stopped,
}

/// What a bounded run burst reports back to the host.
#[derive(Debug)]
pub enum Event {
    /// Budget exhausted; call `run` again.
    Running,
    Stopped,
    /// Parked on user input; complete with `provide_input`.
    Suspended(InputRequest),
    Errors(Vec<Error>),
}

/// Why a location is on the stack, which decides what may pop it.
#[derive(Clone, Copy, Debug, PartialEq)]
enum FrameKind {
    Root,
    Gosub,
    Call,
    /// An event handler injected by a trap; RETURN re-enables the
    /// channel.
    Trap(Channel),
}

#[derive(Clone, Copy, Debug)]
struct Location {
    chunk: usize,
    statement: usize,
    kind: FrameKind,
}

/// Execution ceilings, adjustable per invocation.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_call_depth: usize,
}

impl Default for Limits {
    fn default() -> Limits {
        Limits {
            max_call_depth: 1000,
        }
    }
}

pub struct Invocation {
    program: Rc<Program>,
    ctx: ExecutionContext,
    stack: Vec<Location>,
    state: State,
    waiting: Option<InputRequest>,
    stop_requested: bool,
    limits: Limits,
}

impl Invocation {
    pub fn new(program: Rc<Program>, devices: Devices) -> Invocation {
        let data = Rc::new(program.data.clone());
        let ctx = ExecutionContext::new(devices, program.static_size, data);
        Invocation {
            program,
            ctx,
            stack: vec![Location {
                chunk: 0,
                statement: 0,
                kind: FrameKind::Root,
            }],
            state: State::Idle,
            waiting: None,
            stop_requested: false,
            limits: Limits::default(),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Invocation {
        self.limits = limits;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ExecutionContext {
        &mut self.ctx
    }

    /// CHAIN target, if the program handed off before halting.
    pub fn chained(&self) -> Option<(Rc<str>, Vec<u8>)> {
        match (&self.ctx.chained, &self.ctx.chain_envelope) {
            (Some(path), Some(envelope)) => Some((path.clone(), envelope.clone())),
            _ => None,
        }
    }

    /// Cooperative cancellation, checked before each step. An
    /// in-flight suspension is simply never resumed.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Execute at most `max_steps` statements, then yield. Device
    /// polling happens once per step, so event handlers only ever
    /// interrupt between statements.
    pub fn run(&mut self, max_steps: usize) -> Event {
        for _ in 0..max_steps {
            if self.stop_requested {
                self.state = State::Stopped;
            }
            match self.state {
                State::Stopped => return Event::Stopped,
                State::Waiting => {
                    let request = self.waiting.clone().expect("waiting without a request");
                    return Event::Suspended(request);
                }
                State::Idle | State::Running => {}
            }
            self.state = State::Running;
            self.ctx.events.poll(&mut self.ctx.devices);
            if self.ctx.events.sleeping(&mut self.ctx.devices) {
                return Event::Running;
            }
            if let Some(trigger) = self.ctx.events.trap(&mut self.ctx.devices) {
                log::trace!("event trap to statement {}", trigger.target);
                self.stack.push(Location {
                    chunk: 0,
                    statement: trigger.target,
                    kind: FrameKind::Trap(trigger.channel),
                });
            }
            if let Err(error) = self.step() {
                self.state = State::Stopped;
                return Event::Errors(vec![error]);
            }
            match self.state {
                State::Stopped => return Event::Stopped,
                State::Waiting => {
                    let request = self.waiting.clone().expect("waiting without a request");
                    return Event::Suspended(request);
                }
                _ => {}
            }
        }
        Event::Running
    }

    fn step(&mut self) -> Result<()> {
        let location = match self.stack.last() {
            Some(location) => *location,
            None => {
                self.state = State::Stopped;
                return Ok(());
            }
        };
        let program = self.program.clone();
        let chunk = &program.chunks[location.chunk];
        let chunk_len = chunk.statements.len();
        let statement = match chunk.statements.get(location.statement) {
            Some(statement) => statement,
            None => {
                // Ran off the end of the chunk: implicit return.
                self.pop_location();
                return Ok(());
            }
        };
        log::trace!("step {}:{}", location.chunk, location.statement);
        let effect = statement.execute(&mut self.ctx).map_err(|error| {
            // Attribute untagged faults to the statement's token.
            if error.line() == 0 {
                match statement.token() {
                    Some(token) if !token.is_internal() => error.at(token),
                    _ => error,
                }
            } else {
                error
            }
        })?;
        match effect {
            None => self.advance(chunk_len),
            Some(ControlFlow::Goto(target)) => {
                if target >= chunk_len {
                    self.pop_location();
                } else {
                    self.stack.last_mut().unwrap().statement = target;
                }
            }
            Some(ControlFlow::Gosub(target)) => {
                self.check_depth(statement.token())?;
                self.advance(chunk_len);
                self.stack.push(Location {
                    chunk: location.chunk,
                    statement: target,
                    kind: FrameKind::Gosub,
                });
            }
            Some(ControlFlow::Call(chunk_index)) => {
                self.check_depth(statement.token())?;
                self.advance(chunk_len);
                self.stack.push(Location {
                    chunk: chunk_index,
                    statement: 0,
                    kind: FrameKind::Call,
                });
            }
            Some(ControlFlow::Return) => match location.kind {
                FrameKind::Gosub | FrameKind::Trap(_) => {
                    self.pop_location();
                }
                FrameKind::Root | FrameKind::Call => {
                    let error = error!(ReturnWithoutGosub);
                    return Err(match statement.token() {
                        Some(token) => error.at(token).runtime(),
                        None => error.runtime(),
                    });
                }
            },
            Some(ControlFlow::Exit) => loop {
                match self.stack.pop() {
                    Some(Location {
                        kind: FrameKind::Call,
                        ..
                    }) => break,
                    Some(Location {
                        kind: FrameKind::Trap(channel),
                        ..
                    }) => self.ctx.events.resume(channel),
                    Some(_) => {}
                    None => {
                        return Err(error!(InternalError; "Exit outside a procedure"));
                    }
                }
            },
            Some(ControlFlow::Halt) => {
                self.state = State::Stopped;
            }
            Some(ControlFlow::Wait(request)) => {
                self.state = State::Waiting;
                self.waiting = Some(request);
            }
        }
        if self.stack.is_empty() {
            self.state = State::Stopped;
        }
        Ok(())
    }

    /// Complete a suspended INPUT. Numeric fields that fail to parse
    /// leave the engine parked so the host can re-prompt, matching
    /// the legacy "Redo from start" loop.
    pub fn provide_input(&mut self, fields: &[String]) -> Result<()> {
        let request = match self.waiting.take() {
            Some(request) => request,
            None => return Err(error!(InternalError; "No input pending")),
        };
        let result = self.write_input(&request, fields);
        if result.is_err() {
            self.waiting = Some(request);
            return result;
        }
        // Resume at the suspended statement's increment successor.
        let chunk_len = self.stack.last().map(|location| {
            self.program.chunks[location.chunk].statements.len()
        });
        if let Some(chunk_len) = chunk_len {
            self.advance(chunk_len);
        }
        self.state = State::Running;
        Ok(())
    }

    fn write_input(&mut self, request: &InputRequest, fields: &[String]) -> Result<()> {
        if request.line {
            let text = fields.first().cloned().unwrap_or_default();
            let target = &request.targets[0];
            self.ctx
                .memory
                .write(target, Val::String(text.into()))?;
            return Ok(());
        }
        if fields.len() != request.targets.len() {
            return Err(error!(IllegalFunctionCall; "Field count mismatch"));
        }
        for (target, field) in request.targets.iter().zip(fields) {
            let value = if target.ty.is_string() {
                Val::String(field.trim().into())
            } else {
                match super::builtins::parse_leading_number(field) {
                    Some(n) => Val::Double(n),
                    None => return Err(error!(TypeMismatch; "Redo from start")),
                }
            };
            let value = value
                .cast(&target.ty)
                .map_err(|code| Error::new(code).runtime())?;
            self.ctx.memory.write(target, value)?;
        }
        Ok(())
    }

    fn advance(&mut self, chunk_len: usize) {
        let location = match self.stack.last_mut() {
            Some(location) => location,
            None => return,
        };
        location.statement += 1;
        if location.statement >= chunk_len {
            self.pop_location();
        }
    }

    fn pop_location(&mut self) {
        if let Some(location) = self.stack.pop() {
            if let FrameKind::Trap(channel) = location.kind {
                self.ctx.events.resume(channel);
            }
        }
        if self.stack.is_empty() {
            self.state = State::Stopped;
        }
    }

    fn check_depth(&self, token: Option<&crate::lang::Token>) -> Result<()> {
        if self.stack.len() >= self.limits.max_call_depth {
            let error = error!(OutOfMemory; "Call stack limit reached");
            return Err(match token {
                Some(token) => error.at(token).runtime(),
                None => error.runtime(),
            });
        }
        Ok(())
    }
}
