use super::Token;

/// Diagnostics for both compile passes and execution. Compile errors
/// abort compilation immediately; runtime errors terminate the
/// invocation that raised them. Internal errors signal compiler bugs
/// and are never expected for a correctly compiled program.

pub struct Error {
    code: ErrorCode,
    phase: Phase,
    line: u32,
    column: u32,
    message: &'static str,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Phase {
    Compile,
    Runtime,
}

#[doc(hidden)]
#[macro_export]
macro_rules! error {
    ($err:ident) => {
        $crate::lang::Error::new($crate::lang::ErrorCode::$err)
    };
    ($err:ident, $token:expr) => {
        $crate::lang::Error::new($crate::lang::ErrorCode::$err).at($token)
    };
    ($err:ident; $msg:expr) => {
        $crate::lang::Error::new($crate::lang::ErrorCode::$err).message($msg)
    };
    ($err:ident, $token:expr; $msg:expr) => {
        $crate::lang::Error::new($crate::lang::ErrorCode::$err)
            .at($token)
            .message($msg)
    };
}

impl Error {
    pub fn new(code: ErrorCode) -> Error {
        Error {
            code,
            phase: Phase::Compile,
            line: 0,
            column: 0,
            message: "",
        }
    }

    pub fn at(mut self, token: &Token) -> Error {
        self.line = token.line;
        self.column = token.column;
        self
    }

    pub fn message(mut self, message: &'static str) -> Error {
        debug_assert!(self.message.is_empty());
        self.message = message;
        self
    }

    pub fn runtime(mut self) -> Error {
        self.phase = Phase::Runtime;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_internal(&self) -> bool {
        self.code == ErrorCode::InternalError
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn column(&self) -> u32 {
        self.column
    }
}

/// Legacy error codes. Numbered entries match the classic runtime
/// error numbers; the unnumbered diagnostics only ever occur at
/// compile time.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorCode {
    NextWithoutFor = 1,
    SyntaxError = 2,
    ReturnWithoutGosub = 3,
    OutOfData = 4,
    IllegalFunctionCall = 5,
    Overflow = 6,
    OutOfMemory = 7,
    SubscriptOutOfRange = 9,
    DuplicateDefinition = 10,
    DivisionByZero = 11,
    TypeMismatch = 13,
    OutOfStringSpace = 14,
    NoResume = 19,
    DeviceUnavailable = 24,
    DuplicateLabel = 33,
    SubprogramNotDefined = 35,
    ArgumentCountMismatch = 37,
    VariableRequired = 40,
    InternalError = 51,
    BadFileNameOrNumber = 52,
    FileNotFound = 53,
    BadFileMode = 54,
    FileAlreadyOpen = 55,
    DeviceIoError = 57,
    FileAlreadyExists = 58,
    InputPastEnd = 62,
    BadRecordNumber = 63,
    TooManyFiles = 67,
    AdvancedFeature = 73,
    // Compile-time only.
    LabelNotDefined = 1001,
    ParameterTypeMismatch = 1002,
    TypeNotDefined = 1003,
    AsClauseRequired = 1004,
    InvalidConstant = 1005,
}

impl ErrorCode {
    pub fn text(self) -> &'static str {
        use ErrorCode::*;
        match self {
            NextWithoutFor => "NEXT without FOR",
            SyntaxError => "Syntax error",
            ReturnWithoutGosub => "RETURN without GOSUB",
            OutOfData => "Out of DATA",
            IllegalFunctionCall => "Illegal function call",
            Overflow => "Overflow",
            OutOfMemory => "Out of memory",
            SubscriptOutOfRange => "Subscript out of range",
            DuplicateDefinition => "Duplicate definition",
            DivisionByZero => "Division by zero",
            TypeMismatch => "Type mismatch",
            OutOfStringSpace => "Out of string space",
            NoResume => "No RESUME",
            DeviceUnavailable => "Device unavailable",
            DuplicateLabel => "Duplicate label",
            SubprogramNotDefined => "Subprogram not defined",
            ArgumentCountMismatch => "Argument-count mismatch",
            VariableRequired => "Variable required",
            InternalError => "Internal error",
            BadFileNameOrNumber => "Bad file name or number",
            BadFileMode => "Bad file mode",
            FileAlreadyOpen => "File already open",
            FileNotFound => "File not found",
            DeviceIoError => "Device I/O error",
            FileAlreadyExists => "File already exists",
            InputPastEnd => "Input past end of file",
            BadRecordNumber => "Bad record number",
            TooManyFiles => "Too many files",
            AdvancedFeature => "Advanced feature unavailable",
            LabelNotDefined => "Label not defined",
            ParameterTypeMismatch => "Parameter type mismatch",
            TypeNotDefined => "Type not defined",
            AsClauseRequired => "AS clause required",
            InvalidConstant => "Invalid constant",
        }
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Error {{ {} }}", self)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.code.text())?;
        if self.line != 0 {
            write!(f, " in line {} column {}", self.line, self.column)?;
        }
        if !self.message.is_empty() {
            write!(f, "; {}", self.message)?;
        }
        Ok(())
    }
}
