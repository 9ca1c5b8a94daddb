//! Aspect-oriented weaving of WebAssembly text modules.
//!
//! A weaving session parses a WAT module into a [`Code`] tree indexed by a
//! [`ModuleContext`], finds join-points with the pointcuts in [`pointcut`],
//! replaces them with advice code whose `%...%` keywords are expanded by the
//! [`keyword`] language, and finally lowers the `/.../` runtime expressions
//! left in the advice into calls to a host bridge with [`runtime::rewrite`].
//!
//! ```
//! use wasm_weaver::{Weaver, WeaverConfig, pointcut};
//!
//! let mut weaver = Weaver::new(
//!     "(module (func $f (call $g)) (func $g (nop)))",
//!     &WeaverConfig::new(),
//! )?;
//! let calls = pointcut::find_calls(weaver.context(), weaver.context().root(), |_, _| {
//!     Some(pointcut::Environment::new())
//! })?;
//! assert_eq!(weaver.weave(calls, "(unreachable)")?, 1);
//! let output = weaver.finish()?;
//! assert!(output.wat.contains("(func $f\n    (unreachable))"));
//! # Ok::<(), wasm_weaver::WeaverError>(())
//! ```

pub mod apply;
pub mod code;
mod config;
pub mod context;
mod error;
pub mod instructions;
pub mod keyword;
pub mod pointcut;
pub mod runtime;
pub mod template;
pub mod types;

pub use crate::code::{Block, BlockKind, Code};
pub use crate::config::WeaverConfig;
pub use crate::context::ModuleContext;
pub use crate::error::{WeaverError, WeaverResult};
pub use crate::pointcut::{JoinPoint, JoinPointSearch, Pointcuts};
pub use crate::runtime::ImportFunctionDef;

use crate::keyword::{Evaluator, Scope};
use crate::template::{ExternalMatcher, SearchResult, StructuralMatcher, Templates};
use log::{debug, warn};

/// The result of a weaving session.
#[derive(Clone, Debug)]
pub struct WeaveOutput {
    /// The woven module, indented.
    pub wat: String,
    /// Whether the module imports any host bridge function.
    pub need_js: bool,
    /// The host bridge functions the module imports.
    pub glue_imports: Vec<ImportFunctionDef>,
}

/// A weaving session over one module.
pub struct Weaver {
    ctx: ModuleContext,
    config: WeaverConfig,
    templates: Templates,
    pointcuts: Pointcuts,
    /// Script values visible to every advice.
    scope: Scope,
}

impl Weaver {
    /// Parse and index `source`.
    pub fn new(source: &str, config: &WeaverConfig) -> WeaverResult<Self> {
        let ctx = ModuleContext::new(source)?;
        debug!("weaving a module with {} functions", ctx.functions().count());
        Ok(Weaver {
            ctx,
            config: config.clone(),
            templates: Templates::new(),
            pointcuts: Pointcuts::new(),
            scope: Scope::new(),
        })
    }

    /// The module being woven.
    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    /// Mutable access to the module, for additions made by the weaving
    /// script.
    pub fn context_mut(&mut self) -> &mut ModuleContext {
        &mut self.ctx
    }

    /// The configuration of this session.
    pub fn config(&self) -> &WeaverConfig {
        &self.config
    }

    /// The templates available to [`Weaver::search_template`].
    pub fn templates_mut(&mut self) -> &mut Templates {
        &mut self.templates
    }

    /// The named pointcuts available to [`Weaver::pointcut`].
    pub fn pointcuts_mut(&mut self) -> &mut Pointcuts {
        &mut self.pointcuts
    }

    /// The script scope, searched after the scope of each join-point.
    pub fn scope_mut(&mut self) -> &mut Scope {
        &mut self.scope
    }

    /// Every internal function of the module.
    pub fn search(&self) -> WeaverResult<JoinPointSearch> {
        pointcut::init_search(&self.ctx)
    }

    /// Evaluate the pointcut `text`, e.g. `() => call(* $log (..))`.
    pub fn pointcut(&mut self, text: &str) -> WeaverResult<JoinPointSearch> {
        self.pointcuts
            .evaluate(&mut self.ctx, &mut self.templates, &StructuralMatcher, text)
    }

    /// Match the template `key` against `code`.
    pub fn search_template(&mut self, key: &str, code: &str) -> WeaverResult<SearchResult> {
        self.templates.search(key, code, &StructuralMatcher)
    }

    /// Match the template `key` against `code` with a comby-compatible
    /// executable, bounded by the configured matcher timeout.
    pub fn search_template_with(&mut self, program: &str, key: &str, code: &str) -> WeaverResult<SearchResult> {
        let matcher = ExternalMatcher::new(self.config.timeout()).program(program);
        self.templates.search(key, code, &matcher)
    }

    /// Compress runs of consecutive join-points into groups of at most the
    /// configured size. Only the first join-point of each group survives.
    pub fn rearrange(&mut self, search: JoinPointSearch) -> JoinPointSearch {
        let found = apply::rearrange_blocks(self.ctx.code_mut(), search.into_found(), self.config.group_size());
        found.into_iter().collect()
    }

    /// Expand the keywords of `advice` for `jp`.
    pub fn expand(&self, jp: &JoinPoint, advice: &str) -> WeaverResult<String> {
        if !keyword::has_keywords(advice) {
            return Ok(advice.to_string());
        }
        let order = self.ctx.order_map();
        let scope = jp.scope();
        let evaluator = Evaluator::new(&order).scope(&scope).scope(&self.scope);
        keyword::expand(&evaluator, advice)
    }

    /// Expand `advice` for `jp` and apply it in the configured mode.
    pub fn apply(&mut self, jp: &JoinPoint, advice: &str) -> WeaverResult<()> {
        let code = self.expand(jp, advice)?;
        apply::apply(&mut self.ctx, jp, &code, self.config.is_smart())
    }

    /// Apply `advice` to every join-point of `search`. Join-points whose
    /// block was removed by an earlier application are skipped. Returns the
    /// number of join-points woven.
    pub fn weave(&mut self, search: JoinPointSearch, advice: &str) -> WeaverResult<usize> {
        let mut woven = 0;
        for jp in search {
            if !self.ctx.code().is_attached(jp.block(), self.ctx.root()) {
                warn!("skipping join-point {} removed by earlier advice", jp.block());
                continue;
            }
            self.apply(&jp, advice)?;
            woven += 1;
        }
        debug!("wove {woven} join-points");
        Ok(woven)
    }

    /// Lower the runtime expressions and serialize the module.
    pub fn finish(mut self) -> WeaverResult<WeaveOutput> {
        runtime::rewrite(&mut self.ctx)?;
        Ok(WeaveOutput {
            wat: self.ctx.string_indent(self.config.indent_width()),
            need_js: self.ctx.need_js(),
            glue_imports: self.ctx.glue_imports().to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_session() {
        let weaver = Weaver::new("(module (func $f (nop)))", &WeaverConfig::new()).unwrap();
        assert_eq!(weaver.search().unwrap().len(), 1);
        let output = weaver.finish().unwrap();
        assert!(output.wat.starts_with("(module\n  (func $f\n    (nop))"), "{}", output.wat);
        assert!(!output.need_js);
        assert!(output.glue_imports.is_empty());
    }

    #[test]
    fn rearrange_uses_the_configured_group_size() {
        let mut config = WeaverConfig::new();
        config.max_in_a_row(2);
        let mut weaver = Weaver::new("(module (func $f (nop) (nop) (nop)))", &config).unwrap();
        let f = weaver.context().function("$f").unwrap().instr();
        let search = pointcut::find_instructions(weaver.context(), f, "(nop)").unwrap();
        assert_eq!(search.len(), 3);
        assert_eq!(weaver.rearrange(search).len(), 2);
    }

    #[test]
    fn pointcut_text_uses_session_templates_and_named_pointcuts() {
        let mut weaver = Weaver::new(
            "(module (func $f (call $g (i32.const 1))) (func $g (param i32) (nop)))",
            &WeaverConfig::new(),
        )
        .unwrap();
        weaver.templates_mut().insert("one", "(i32.const 1)");
        weaver.pointcuts_mut().insert("to_g", "() => call(* $g (i32))");
        let search = weaver.pointcut("() => to_g() && template(one)").unwrap();
        assert_eq!(search.len(), 1);
        assert_eq!(weaver.context().code().string(search.found()[0].block()), "(i32.const 1)");
        assert_eq!(weaver.weave(search, "(i32.const 2)").unwrap(), 1);
        assert!(weaver.pointcut("() => func(").is_err());
    }

    #[test]
    fn advice_sees_join_point_and_script_scope() {
        let mut weaver = Weaver::new(
            "(module (func $f (drop (i32.const 1))) (func $g (nop)))",
            &WeaverConfig::new(),
        )
        .unwrap();
        weaver.scope_mut().insert("marker", "7");
        let search = weaver.search().unwrap();
        let jp = &search.found()[0];
        assert_eq!(
            weaver.expand(jp, "(i32.const %marker%) ;; %name%").unwrap(),
            "(i32.const 7) ;; f"
        );
        assert_eq!(
            weaver.expand(jp, "(drop (i32.add (i32.const %marker%) /#a % 2/))").unwrap(),
            "(drop (i32.add (i32.const 7) /#a % 2/))"
        );
    }
}
