//! Engine-internal error type. Converted into a tagged
//! [`crate::driver::DriverError`] at the driver boundary; never crosses it.

use crate::native::dwarf::leb128::DecodeError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors ----------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),

    // --------------------------------- syscall errors ----------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),

    // --------------------------------- parsing errors ----------------------
    #[error("dwarf parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),
    #[error(transparent)]
    Leb128(#[from] DecodeError),

    // --------------------------------- lookup errors -----------------------
    #[error("no source place at address {0:#x}")]
    PlaceNotFound(u64),
    #[error("no debug information for file {0}")]
    FileNotIndexed(String),
    #[error("no statement at {0}:{1}")]
    NoPlaceForLine(String, u32),
    #[error("function not found at address {0:#x}")]
    FunctionNotFound(u64),
    #[error("frame number {0} not found")]
    FrameNotFound(u32),
    #[error("variable `{0}` not found in scope")]
    VariableNotFound(String),
    #[error("type not found")]
    TypeNotFound,

    // --------------------------------- dwarf evaluation --------------------
    #[error("no frame base address")]
    NoFBA,
    #[error("frame base attribute not an expression")]
    FBANotAnExpression,
    #[error("unsupported location expression (op {0:#x})")]
    UnsupportedLocation(u8),
    #[error("unknown register {0}")]
    RegisterNotFound(u16),
    #[error("invalid binary representation of type `{0}`")]
    TypeBinaryRepr(&'static str),

    // --------------------------------- unwind errors -----------------------
    #[error("unwind: no frame information for address {0:#x}")]
    NoUnwindInfo(u64),
    #[error("unwind: unsupported CFA rule")]
    UnsupportedCfaRule,

    // --------------------------------- debugee process errors --------------
    #[error("backend round-trip exceeded {0} ms")]
    Timeout(u64),
    #[error("debugee process exited with code {0}")]
    ProcessExit(i32),
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error("memory region for {0} not found")]
    MappingNotFound(String),
}

impl Error {
    /// True for failures of the process-tracing machinery itself: the
    /// session cannot continue and must transition to terminated.
    pub fn is_trace_fault(&self) -> bool {
        matches!(
            self,
            Error::Waitpid(_)
                | Error::Ptrace(_)
                | Error::Syscall(_, _)
                | Error::IO(_)
                | Error::Timeout(_)
                | Error::ProcessExit(_)
                | Error::MappingNotFound(_)
        )
    }
}
