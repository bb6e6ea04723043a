//! TypeScript stripping transform.
//!
//! Uses SWC to parse TypeScript, strip type-only syntax and re-emit plain
//! JavaScript. Scripts and CommonJS bodies are parsed with the script goal;
//! sources with `import`/`export` fall back to the module goal.

use crate::compile::Transform;
use anyhow::{Context, bail};
use std::sync::Arc;
use swc_common::{FileName, GLOBALS, Globals, Mark, SourceMap, sync::Lrc};
use swc_ecma_ast::{EsVersion, Program};
use swc_ecma_codegen::{Config as CodegenConfig, Emitter, text_writer::JsWriter};
use swc_ecma_parser::{Parser, StringInput, Syntax, TsSyntax, lexer::Lexer};
use swc_ecma_transforms_base::{fixer::fixer, resolver};
use swc_ecma_transforms_typescript::strip;
use swc_ecma_visit::VisitMutWith;

/// A [`Transform`] that strips TypeScript syntax.
pub fn typescript_transformer() -> Transform {
    Arc::new(|source: &str| strip_types(source))
}

/// Strip TypeScript syntax from `source` and emit JavaScript.
pub fn strip_types(source: &str) -> anyhow::Result<String> {
    let cm: Lrc<SourceMap> = Default::default();

    let parse = |module_goal: bool| -> anyhow::Result<Program> {
        let fm = cm.new_source_file(
            Lrc::new(FileName::Custom("script.ts".to_string())),
            source.to_string(),
        );
        let syntax = Syntax::Typescript(TsSyntax {
            tsx: false,
            decorators: true,
            dts: false,
            no_early_errors: false,
            disallow_ambiguous_jsx_like: false,
        });
        let lexer = Lexer::new(syntax, EsVersion::Es2020, StringInput::from(&*fm), None);
        let mut parser = Parser::new_from(lexer);

        let program = if module_goal {
            parser.parse_module().map(Program::Module)
        } else {
            parser.parse_script().map(Program::Script)
        };
        let program = program.map_err(|e| anyhow::anyhow!("{}", e.kind().msg()))?;
        if let Some(e) = parser.take_errors().into_iter().next() {
            bail!("{}", e.kind().msg());
        }
        Ok(program)
    };

    let mut program = parse(false)
        .or_else(|_| parse(true))
        .context("failed to parse TypeScript")?;

    GLOBALS.set(&Globals::default(), || {
        let unresolved_mark = Mark::new();
        let top_level_mark = Mark::new();

        program.visit_mut_with(&mut resolver(unresolved_mark, top_level_mark, true));
        program.mutate(&mut strip(unresolved_mark, top_level_mark));
        program.visit_mut_with(&mut fixer(None));
    });

    let mut buf = vec![];
    {
        let writer = JsWriter::new(cm.clone(), "\n", &mut buf, None);
        let mut emitter = Emitter {
            cfg: CodegenConfig::default()
                .with_target(EsVersion::Es2020)
                .with_ascii_only(false)
                .with_minify(false)
                .with_omit_last_semi(false),
            cm: cm.clone(),
            comments: None,
            wr: writer,
        };
        match &program {
            Program::Script(script) => emitter.emit_script(script),
            Program::Module(module) => emitter.emit_module(module),
        }
        .context("failed to emit JavaScript")?;
    }

    String::from_utf8(buf).context("emitted code is not UTF-8")
}
