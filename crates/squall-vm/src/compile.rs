//! Script compilation.
//!
//! Sources are validated with the SWC parser before they ever reach the
//! interpreter. When parsing fails and a [`Transform`] is configured, the
//! source is transformed once and validated again, which lets scripts use
//! syntax the engine does not understand (TypeScript annotations, for one).

use crate::error::{VmError, VmResult};
use std::sync::Arc;
use swc_common::{FileName, SourceMap, Spanned, sync::Lrc};
use swc_ecma_ast::EsVersion;
use swc_ecma_parser::{EsSyntax, Parser, StringInput, Syntax, lexer::Lexer};
use tracing::debug;

/// Source transform applied when parsing fails.
pub type Transform = Arc<dyn Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static>;

/// A validated script, ready to run on any interpreter generation.
///
/// Cloning is cheap; clones share the same source and compare equal under
/// [`Program::ptr_eq`].
#[derive(Clone)]
pub struct Program {
    inner: Arc<ProgramInner>,
}

struct ProgramInner {
    name: String,
    source: String,
}

impl Program {
    pub(crate) fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ProgramInner {
                name: name.into(),
                source: source.into(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The (possibly transformed) source that will be evaluated.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// True when both handles refer to the same compiled program.
    pub fn ptr_eq(a: &Program, b: &Program) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.inner.name)
            .field("len", &self.inner.source.len())
            .finish()
    }
}

/// Compile `source`, retrying once through `transform` when it does not parse.
pub fn compile(name: &str, source: &str, transform: Option<&Transform>) -> VmResult<Program> {
    match check_syntax(name, source) {
        Ok(()) => Ok(Program::new(name, source)),
        Err(err) => {
            let Some(transform) = transform else {
                return Err(err);
            };
            debug!(name, error = %err, "Parse failed, retrying with transform");
            let transformed =
                transform(source).map_err(|e| VmError::Transform(format!("{e:#}")))?;
            check_syntax(name, &transformed)?;
            Ok(Program::new(name, transformed))
        }
    }
}

/// Parse `source` as an ECMAScript script, reporting the first error.
pub fn check_syntax(name: &str, source: &str) -> VmResult<()> {
    let cm: Lrc<SourceMap> = Default::default();
    let fm = cm.new_source_file(
        Lrc::new(FileName::Custom(name.to_string())),
        source.to_string(),
    );

    let lexer = Lexer::new(
        Syntax::Es(EsSyntax::default()),
        EsVersion::EsNext,
        StringInput::from(&*fm),
        None,
    );
    let mut parser = Parser::new_from(lexer);

    let syntax_error = |e: swc_ecma_parser::error::Error| {
        let line = cm.lookup_char_pos(e.span().lo).line;
        VmError::Syntax {
            file: name.to_string(),
            line,
            message: e.kind().msg().to_string(),
        }
    };

    parser.parse_script().map_err(syntax_error)?;
    if let Some(e) = parser.take_errors().into_iter().next() {
        return Err(syntax_error(e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_valid_script() {
        let program = compile("<eval>", "var x = 1; x + 1", None).unwrap();
        assert_eq!(program.name(), "<eval>");
        assert_eq!(program.source(), "var x = 1; x + 1");
    }

    #[test]
    fn test_compile_reports_syntax_error() {
        let err = compile("broken.js", "function(", None).unwrap_err();
        match err {
            VmError::Syntax { file, line, .. } => {
                assert_eq!(file, "broken.js");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_transform_runs_only_on_failure() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let transform: Transform = Arc::new(move |src: &str| -> anyhow::Result<String> {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(src.replace("@@ ", ""))
        });

        compile("ok.js", "1 + 1", Some(&transform)).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);

        let program = compile("fixed.js", "1 + @@ 1", Some(&transform)).unwrap();
        assert_eq!(program.source(), "1 + 1");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transform_error_is_reported() {
        let transform: Transform = Arc::new(|_: &str| -> anyhow::Result<String> {
            anyhow::bail!("cannot handle this")
        });
        let err = compile("bad.js", "function(", Some(&transform)).unwrap_err();
        assert!(matches!(err, VmError::Transform(msg) if msg.contains("cannot handle this")));
    }

    #[test]
    fn test_program_identity() {
        let a = Program::new("a", "1");
        let b = a.clone();
        let c = Program::new("a", "1");
        assert!(Program::ptr_eq(&a, &b));
        assert!(!Program::ptr_eq(&a, &c));
    }
}
