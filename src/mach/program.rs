use super::statement::Statement;
use super::symbol::{Procedure, SymbolTable};
use super::ty::RecordTy;
use crate::error;
use crate::lang::{Error, Token};
use std::collections::HashMap;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## Compiled program
///
/// The hand-off artifact between compilation and execution: one chunk
/// per procedure plus the top-level chunk, the global DATA literals,
/// the record-type registry, and the static storage size. Built once,
/// immutable afterwards.

#[derive(Debug)]
pub struct Program {
    /// Chunk 0 is the top level.
    pub chunks: Vec<ProgramChunk>,
    pub data: Vec<DataItem>,
    /// Label to DATA offset, for RESTORE.
    pub data_labels: HashMap<Rc<str>, usize>,
    pub records: HashMap<Rc<str>, Rc<RecordTy>>,
    pub static_size: usize,
}

impl Program {
    pub fn new() -> Program {
        Program {
            chunks: vec![ProgramChunk::new(None)],
            data: vec![],
            data_labels: HashMap::new(),
            records: HashMap::new(),
            static_size: 0,
        }
    }

    /// Resolve every chunk's forward label references. Must run once
    /// after generation and before execution.
    pub fn link(&mut self) -> Result<()> {
        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            log::debug!(
                "link chunk {} ({} statements, {} labels)",
                index,
                chunk.statements.len(),
                chunk.labels.len()
            );
            chunk.link()?;
        }
        Ok(())
    }
}

impl Default for Program {
    fn default() -> Program {
        Program::new()
    }
}

/// One DATA literal, kept as source text until READ casts it.
#[derive(Clone, Debug, PartialEq)]
pub struct DataItem {
    pub text: Option<Rc<str>>,
    pub quoted: bool,
}

/// Flat statement list and label table for one procedure body.
#[derive(Debug)]
pub struct ProgramChunk {
    pub statements: Vec<Statement>,
    labels: HashMap<Rc<str>, usize>,
    /// (statement index, label, use site), resolved by `link`.
    pending: Vec<(usize, Rc<str>, Token)>,
    pub symbols: SymbolTable,
    /// Automatic frame slots this chunk needs when called.
    pub frame_size: usize,
    pub procedure: Option<Rc<Procedure>>,
}

impl ProgramChunk {
    pub fn new(procedure: Option<Rc<Procedure>>) -> ProgramChunk {
        ProgramChunk {
            statements: vec![],
            labels: HashMap::new(),
            pending: vec![],
            symbols: SymbolTable::new(),
            frame_size: 0,
            procedure,
        }
    }

    pub fn push(&mut self, statement: Statement) {
        self.statements.push(statement);
    }

    /// Bind a label to the next statement emitted. False if the label
    /// was already bound in this chunk.
    pub fn add_label(&mut self, label: Rc<str>) -> bool {
        let index = self.statements.len();
        self.labels.insert(label, index).is_none()
    }

    /// Record that the most recently emitted statement branches to
    /// `label`, to be resolved once the whole chunk exists.
    pub fn set_target(&mut self, label: Rc<str>, token: &Token) {
        debug_assert!(!self.statements.is_empty());
        let index = self.statements.len() - 1;
        self.pending.push((index, label, token.clone()));
    }

    fn link(&mut self) -> Result<()> {
        for (index, label, token) in std::mem::take(&mut self.pending) {
            let target = match self.labels.get(&label) {
                Some(target) => *target,
                None => return Err(error!(LabelNotDefined, &token)),
            };
            self.statements[index].set_target(target);
        }
        Ok(())
    }
}
