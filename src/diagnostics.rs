use miette::Diagnostic;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum CompileError {
    #[error("Malformed module description: {message}")]
    #[diagnostic(code = "E0001")]
    BadModule { message: String },

    #[error("Unresolved overload for call to `{function}` (key `{key}`)")]
    #[diagnostic(
        code = "E0002",
        help = "the disambiguation pass saw no method matching this deferred call"
    )]
    UnresolvedOverload { function: String, key: String },

    #[error("Branch to `{target}` in `{method}` has no matching label")]
    #[diagnostic(code = "E0003")]
    MissingBranchTarget { method: String, target: String },

    #[error("Native compilation failed")]
    #[diagnostic(code = "E0004")]
    NativeBuildFailed { stderr: String },
}

/// Collects per-method warnings during lowering. Shared across the
/// method-parallel body pass, so interior mutability.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    warnings: Mutex<Vec<String>>,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&self, message: String) {
        log::warn!("{}", message);
        self.warnings.lock().push(message);
    }

    /// Warning line format shared by all soft failures: opcode, bytecode
    /// offset in hex, mangled method name.
    pub fn warn_opcode(&self, method_cpp: &str, mnemonic: &str, offset: u32, detail: &str) {
        self.warn(format!(
            "{}: {} at IL_{:04x}: {}",
            method_cpp, mnemonic, offset, detail
        ));
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.lock().len()
    }

    // Driver-facing status lines. Progress goes to stdout, problems to
    // stderr, each under a one-glyph tag.

    pub fn success(message: &str) {
        Self::console(Severity::Success, message);
    }

    pub fn info(message: &str) {
        Self::console(Severity::Info, message);
    }

    pub fn warning(message: &str) {
        Self::console(Severity::Warning, message);
    }

    pub fn error(message: &str) {
        Self::console(Severity::Error, message);
    }

    fn console(severity: Severity, message: &str) {
        let line = format!("{} {}", severity.tag(), message);
        match severity {
            Severity::Success | Severity::Info => println!("{}", line),
            Severity::Warning | Severity::Error => eprintln!("{}", line),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

impl Severity {
    fn tag(self) -> char {
        match self {
            Severity::Success => '✓',
            Severity::Info => 'ℹ',
            Severity::Warning => '⚠',
            Severity::Error => '✗',
        }
    }
}
