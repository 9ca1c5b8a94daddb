//! The module context: an index of module-level entities.
//!
//! A [`ModuleContext`] owns the [`Code`] arena of a module and keeps a set of
//! lookup tables over it: functions, types, globals, imports, exports and the
//! start function. The tables are filled by walking the tree once per entity
//! class, and every high-level addition (a new function, global, type, ...)
//! goes through the same path: render a WAT snippet, parse it, splice it into
//! the module at its canonical position and index only the new blocks.

use crate::code::{Block, BlockKind, Code};
use crate::error::{WeaverError, WeaverResult};
use crate::instructions::order_weight;
use crate::runtime::{ImportFunctionDef, RuntimeState};
use crate::types;
use indexmap::IndexMap;
use log::{debug, trace};
use regex::Regex;

mod definitions;
mod templates;
mod value;

pub use self::definitions::{
    FunctionArgYaml, FunctionDef, FunctionImportYaml, FunctionYaml, GlobalDef, ImportedDef, LocalDef,
    ParamDef, TypeDef, type_signature,
};
pub use self::templates::CODE_INDEX_PREFIX;
pub use self::value::{Variable, parse_variable};

/// Index of a WebAssembly text module.
pub struct ModuleContext {
    code: Code,
    root: Block,
    module: Block,
    /// Internal function name to the name used by weaving scripts.
    pub function_alias: IndexMap<String, String>,
    /// Internal global name to the name used by weaving scripts.
    pub global_alias: IndexMap<String, String>,
    functions: IndexMap<String, FunctionDef>,
    export_functions: IndexMap<String, String>,
    import_functions: IndexMap<(String, String), String>,
    start_function: Option<String>,
    types: IndexMap<String, TypeDef>,
    globals: IndexMap<String, GlobalDef>,
    export_globals: IndexMap<String, String>,
    import_globals: IndexMap<(String, String), String>,
    pub(crate) runtime: RuntimeState,
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').to_string()
}

/// Is `b` a module field, i.e. directly under `module` or a detached root?
fn is_module_field(code: &Code, b: Block) -> bool {
    match code.parent(b) {
        None => true,
        Some(p) => code.is_named(p, "module"),
    }
}

fn parent_named(code: &Code, b: Block, name: &str) -> bool {
    code.parent(b).is_some_and(|p| code.is_named(p, name))
}

impl ModuleContext {
    /// Parse `source` and index it.
    pub fn new(source: &str) -> WeaverResult<Self> {
        let mut code = Code::new();
        let root = code.parse(source)?;
        Self::from_code(code, root)
    }

    /// Index an already parsed tree rooted at `root`.
    pub fn from_code(code: Code, root: Block) -> WeaverResult<Self> {
        let module = code
            .module(root)
            .ok_or_else(|| WeaverError::structural("no `module` instruction found"))?;
        let mut ctx = ModuleContext {
            code,
            root,
            module,
            function_alias: IndexMap::new(),
            global_alias: IndexMap::new(),
            functions: IndexMap::new(),
            export_functions: IndexMap::new(),
            import_functions: IndexMap::new(),
            start_function: None,
            types: IndexMap::new(),
            globals: IndexMap::new(),
            export_globals: IndexMap::new(),
            import_globals: IndexMap::new(),
            runtime: RuntimeState::default(),
        };
        ctx.fill(root)?;
        debug!(
            "indexed module: {} functions, {} types, {} globals",
            ctx.functions.len(),
            ctx.types.len(),
            ctx.globals.len()
        );
        Ok(ctx)
    }

    /// The code arena.
    pub fn code(&self) -> &Code {
        &self.code
    }

    /// Mutable access to the code arena.
    ///
    /// Edits that add or remove module fields must be followed by
    /// [`ModuleContext::fill`] on the new blocks.
    pub fn code_mut(&mut self) -> &mut Code {
        &mut self.code
    }

    /// The root element of the parsed source.
    pub fn root(&self) -> Block {
        self.root
    }

    /// The `module` instruction.
    pub fn module(&self) -> Block {
        self.module
    }

    /// Compact text of the whole module.
    pub fn string(&self) -> String {
        self.code.string(self.root)
    }

    /// Indented text of the whole module.
    pub fn string_indent(&self, width: usize) -> String {
        self.code.string_indent(self.root, width)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    pub fn function_mut(&mut self, name: &str) -> Option<&mut FunctionDef> {
        self.functions.get_mut(name)
    }

    /// Look up a function that must exist.
    pub(crate) fn expect_function(&self, name: &str) -> WeaverResult<&FunctionDef> {
        self.function(name)
            .ok_or_else(|| WeaverError::unknown("function", name))
    }

    /// Every function, imported ones included.
    pub fn functions(&self) -> impl Iterator<Item = &FunctionDef> {
        self.functions.values()
    }

    /// The function whose `func` instruction is `instr`.
    pub fn function_by_instr(&self, instr: Block) -> Option<&FunctionDef> {
        self.functions.values().find(|f| f.instr == instr)
    }

    /// A function by export name.
    pub fn export_function(&self, export: &str) -> Option<&FunctionDef> {
        self.export_functions
            .get(export)
            .and_then(|name| self.functions.get(name))
    }

    /// The first exported function whose export name matches `pattern`.
    pub fn export_function_by_regex(&self, pattern: &str) -> WeaverResult<Option<&FunctionDef>> {
        let re = Regex::new(pattern).map_err(|e| WeaverError::structural(format!("invalid regex: {e}")))?;
        Ok(self
            .export_functions
            .iter()
            .find(|(export, _)| re.is_match(export))
            .and_then(|(_, name)| self.functions.get(name)))
    }

    /// A function by import coordinates.
    pub fn import_function(&self, module: &str, field: &str) -> Option<&FunctionDef> {
        self.import_functions
            .get(&(module.to_string(), field.to_string()))
            .and_then(|name| self.functions.get(name))
    }

    /// Number of imported functions.
    pub fn import_count(&self) -> usize {
        self.functions
            .values()
            .filter(|f| f.imported.is_some())
            .count()
    }

    /// The WebAssembly index of a function.
    pub fn function_index(&self, f: &FunctionDef) -> usize {
        f.index(self.import_count())
    }

    pub fn start_function(&self) -> Option<&FunctionDef> {
        self.start_function
            .as_deref()
            .and_then(|name| self.functions.get(name))
    }

    /// Make `name` the start function.
    pub fn set_start_function(&mut self, name: &str) -> WeaverResult<()> {
        let f = self
            .functions
            .get_mut(name)
            .ok_or_else(|| WeaverError::unknown("function", name))?;
        f.is_start = true;
        self.start_function = Some(name.to_string());
        Ok(())
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    pub fn global(&self, name: &str) -> Option<&GlobalDef> {
        self.globals.get(name)
    }

    pub fn globals(&self) -> impl Iterator<Item = &GlobalDef> {
        self.globals.values()
    }

    /// A global by export name.
    pub fn export_global(&self, export: &str) -> Option<&GlobalDef> {
        self.export_globals
            .get(export)
            .and_then(|name| self.globals.get(name))
    }

    /// A global by import coordinates.
    pub fn import_global(&self, module: &str, field: &str) -> Option<&GlobalDef> {
        self.import_globals
            .get(&(module.to_string(), field.to_string()))
            .and_then(|name| self.globals.get(name))
    }

    /// 1-based function order by name, including script aliases.
    pub fn order_map(&self) -> IndexMap<String, usize> {
        let imports = self.import_count();
        let mut res: IndexMap<String, usize> = self
            .functions
            .values()
            .map(|f| (f.name.clone(), f.index(imports) + 1))
            .collect();
        for (name, alias) in &self.function_alias {
            if let Some(f) = self.functions.get(name) {
                res.insert(alias.clone(), f.index(imports) + 1);
            }
        }
        res
    }

    /// Script alias of an internal global or function name. Globals are
    /// consulted first.
    pub fn alias_value(&self, key: &str) -> Option<&str> {
        self.global_alias
            .get(key)
            .or_else(|| self.function_alias.get(key))
            .map(String::as_str)
    }

    /// Internal name of a script alias. Globals are consulted first.
    pub fn alias_key(&self, value: &str) -> Option<&str> {
        fn find<'a>(map: &'a IndexMap<String, String>, value: &str) -> Option<&'a str> {
            map.iter().find(|(_, v)| *v == value).map(|(k, _)| k.as_str())
        }
        find(&self.global_alias, value).or_else(|| find(&self.function_alias, value))
    }

    /// Whether the module needs a host bridge.
    pub fn need_js(&self) -> bool {
        self.runtime.need_js
    }

    /// Glue imports added by the runtime rewriter.
    pub fn glue_imports(&self) -> &[ImportFunctionDef] {
        &self.runtime.glue_imports
    }

    // Indexing.

    /// Index the module fields found in the subtree of `block`.
    pub fn fill(&mut self, block: Block) -> WeaverResult<()> {
        let blocks = self.code.preorder(block);
        for b in &blocks {
            self.fill_type(*b);
        }
        for b in &blocks {
            self.fill_function(*b)?;
        }
        for b in &blocks {
            self.fill_global(*b)?;
        }
        for b in &blocks {
            self.fill_export(*b)?;
        }
        for b in &blocks {
            self.fill_start(*b)?;
        }
        Ok(())
    }

    fn fill_type(&mut self, b: Block) {
        let code = &self.code;
        if !code.is_named(b, "func") || !parent_named(code, b, "type") {
            return;
        }
        let Some(parent) = code.parent(b) else { return };
        if code.children(parent).len() != 2 {
            return;
        }
        let mut def = TypeDef {
            name: code.string(code.children(parent)[0]),
            params: Vec::new(),
            result: String::new(),
        };
        for child in code.children(b) {
            match code.name(*child) {
                Some("param") => def
                    .params
                    .extend(code.children(*child).iter().map(|p| code.string(*p))),
                Some("result") if code.children(*child).len() == 1 => {
                    def.result = code.string(code.children(*child)[0]);
                }
                Some("result") => {}
                _ => break,
            }
        }
        trace!("type {}", def.name);
        self.types.insert(def.name.clone(), def);
    }

    fn fill_function(&mut self, b: Block) -> WeaverResult<()> {
        if !self.code.is_named(b, "func") {
            return Ok(());
        }
        let from_import = parent_named(&self.code, b, "import");
        if !from_import && !is_module_field(&self.code, b) {
            return Ok(());
        }
        let mut imported = None;
        if from_import {
            let import = self.code.parent(b).ok_or_else(|| WeaverError::structural("orphan import"))?;
            imported = Some(self.import_descriptor(import)?);
        } else if self.code.children(b).is_empty() {
            return Err(WeaverError::Block {
                block: self.code.string(b),
                msg: "function without children".to_string(),
            });
        }

        let first = self.code.child(b, 0);
        let named = first
            .and_then(|c| self.code.text(c))
            .filter(|t| t.starts_with('$'))
            .map(str::to_string);
        let name = named.clone().unwrap_or_else(|| self.functions.len().to_string());
        let mut f = FunctionDef::new(name, b, 0);
        let header_start = usize::from(named.is_some());
        let mut exported = Vec::new();

        for child in self.code.children(b)[header_start..].iter().copied() {
            let code = &self.code;
            let args = code.children(child);
            match code.name(child) {
                Some("type") if args.len() == 1 => f.type_name = code.string(args[0]),
                Some("param") => {
                    let named = args.len() == 2 && code.text(args[0]).is_some_and(|t| t.starts_with('$'));
                    if named {
                        let name = code.string(args[0]);
                        let order = f.params.len();
                        f.params.insert(
                            name.clone(),
                            ParamDef {
                                name,
                                ty: code.string(args[1]),
                                order,
                            },
                        );
                    } else {
                        for ty in args {
                            let order = f.params.len();
                            let name = order.to_string();
                            f.params.insert(
                                name.clone(),
                                ParamDef {
                                    name,
                                    ty: code.string(*ty),
                                    order,
                                },
                            );
                        }
                    }
                }
                Some("result") => {
                    if let Some(r) = args.first() {
                        f.result = code.string(*r);
                    }
                }
                Some("local") => {
                    let named = args.len() == 2 && code.text(args[0]).is_some_and(|t| t.starts_with('$'));
                    let entries: Vec<(String, String)> = if named {
                        vec![(code.string(args[0]), code.string(args[1]))]
                    } else {
                        args.iter()
                            .enumerate()
                            .map(|(i, ty)| ((f.params.len() + f.locals.len() + i).to_string(), code.string(*ty)))
                            .collect()
                    };
                    for (name, ty) in entries {
                        let order = f.locals.len();
                        f.locals.insert(
                            name.clone(),
                            LocalDef {
                                name,
                                ty,
                                initial_value: String::new(),
                                order,
                            },
                        );
                    }
                }
                Some("export") if args.len() == 1 => exported.push(unquote(&code.string(args[0]))),
                Some("import") => imported = Some(self.import_descriptor(child)?),
                Some("type" | "export") => {}
                _ => break,
            }
        }

        if !f.type_name.is_empty() && f.params.is_empty() && f.result.is_empty() {
            match self.types.get(&f.type_name) {
                Some(ty) => {
                    for (i, p) in ty.params.iter().enumerate() {
                        f.params.insert(
                            i.to_string(),
                            ParamDef {
                                name: i.to_string(),
                                ty: p.clone(),
                                order: i,
                            },
                        );
                    }
                    f.result = ty.result.clone();
                }
                None if imported.is_some() => return Err(WeaverError::unknown("type", f.type_name)),
                None => {}
            }
        }

        f.order = if imported.is_some() {
            self.import_count()
        } else {
            self.functions.len() - self.import_count()
        };
        if let Some(import) = &imported {
            self.import_functions
                .insert((import.module.clone(), import.field.clone()), f.name.clone());
        }
        f.imported = imported;
        if let Some(export) = exported.last() {
            f.exported = Some(export.clone());
        }
        for export in exported {
            self.export_functions.insert(export, f.name.clone());
        }
        trace!("function {} (order {})", f.name, f.order);
        self.functions.insert(f.name.clone(), f);
        Ok(())
    }

    /// Read the module and field names of an `import` instruction. A
    /// top-level import must have exactly three children, an inline one two.
    fn import_descriptor(&self, import: Block) -> WeaverResult<ImportedDef> {
        let args = self.code.children(import);
        let expected = if is_module_field(&self.code, import) { 3 } else { 2 };
        if args.len() != expected {
            return Err(WeaverError::Block {
                block: self.code.string(import),
                msg: format!("import expects {expected} arguments but got {}", args.len()),
            });
        }
        Ok(ImportedDef {
            module: unquote(&self.code.string(args[0])),
            field: unquote(&self.code.string(args[1])),
        })
    }

    fn fill_global(&mut self, b: Block) -> WeaverResult<()> {
        if !self.code.is_named(b, "global") {
            return Ok(());
        }
        let from_import = parent_named(&self.code, b, "import");
        if !from_import && !is_module_field(&self.code, b) {
            return Ok(());
        }
        let mut imported = None;
        if from_import {
            let import = self.code.parent(b).ok_or_else(|| WeaverError::structural("orphan import"))?;
            imported = Some(self.import_descriptor(import)?);
        }
        let code = &self.code;
        let args = code.children(b);
        let named = args
            .first()
            .and_then(|c| code.text(*c))
            .filter(|t| t.starts_with('$'))
            .map(str::to_string);
        let mut rest = &args[usize::from(named.is_some())..];
        let mut exported = None;
        while let Some((first, tail)) = rest.split_first() {
            match code.name(*first) {
                Some("export") if code.children(*first).len() == 1 => {
                    exported = Some(unquote(&code.string(code.children(*first)[0])));
                }
                Some("import") => imported = Some(self.import_descriptor(*first)?),
                _ => break,
            }
            rest = tail;
        }
        let Some((ty_block, init)) = rest.split_first() else {
            return Err(WeaverError::Block {
                block: code.string(b),
                msg: "global without type".to_string(),
            });
        };
        let (ty, mutable) = match code.name(*ty_block) {
            Some("mut") => (
                code.first_value(*ty_block).unwrap_or_default(),
                true,
            ),
            _ => (code.string(*ty_block), false),
        };
        let initial_value = init
            .first()
            .filter(|v| code.name(**v).is_some_and(|n| n.ends_with(".const")))
            .map(|v| {
                let values = code.children(*v);
                match values {
                    [single] if matches!(code.kind(*single), BlockKind::Quoted(_)) => unquote(&code.string(*single)),
                    _ => values.iter().map(|p| code.string(*p)).collect::<String>(),
                }
            })
            .unwrap_or_default();
        let def = GlobalDef {
            name: named.unwrap_or_else(|| self.globals.len().to_string()),
            ty,
            mutable,
            imported,
            exported,
            initial_value,
            instr: b,
        };
        if let Some(import) = &def.imported {
            self.import_globals
                .insert((import.module.clone(), import.field.clone()), def.name.clone());
        }
        if let Some(export) = &def.exported {
            self.export_globals.insert(export.clone(), def.name.clone());
        }
        trace!("global {}: {}", def.name, def.ty);
        self.globals.insert(def.name.clone(), def);
        Ok(())
    }

    fn fill_export(&mut self, b: Block) -> WeaverResult<()> {
        if !self.code.is_named(b, "export") || !is_module_field(&self.code, b) {
            return Ok(());
        }
        let args = self.code.children(b);
        if args.len() != 2 {
            return Err(WeaverError::Block {
                block: self.code.string(b),
                msg: format!("export expects 2 arguments but got {}", args.len()),
            });
        }
        let export = unquote(&self.code.string(args[0]));
        let desc = args[1];
        let Some(target) = self.code.first_value(desc) else {
            return Ok(());
        };
        match self.code.name(desc) {
            Some("func") => {
                let f = self
                    .functions
                    .get_mut(&target)
                    .ok_or_else(|| WeaverError::unknown("function", target.clone()))?;
                f.exported = Some(export.clone());
                self.export_functions.insert(export, target);
            }
            Some("global") => {
                let g = self
                    .globals
                    .get_mut(&target)
                    .ok_or_else(|| WeaverError::unknown("global", target.clone()))?;
                g.exported = Some(export.clone());
                self.export_globals.insert(export, target);
            }
            _ => {}
        }
        Ok(())
    }

    fn fill_start(&mut self, b: Block) -> WeaverResult<()> {
        if !self.code.is_named(b, "start") || !is_module_field(&self.code, b) {
            return Ok(());
        }
        let args = self.code.children(b);
        if args.len() != 1 {
            return Err(WeaverError::Block {
                block: self.code.string(b),
                msg: "start expects exactly one function".to_string(),
            });
        }
        let target = match self.code.name(args[0]) {
            Some("func") => self.code.first_value(args[0]).unwrap_or_default(),
            _ => self.code.string(args[0]),
        };
        self.set_start_function(&target)
    }

    // Additions.

    /// Insert `blocks` into the module, keeping the canonical field order,
    /// and index them.
    pub fn add_blocks(&mut self, blocks: Vec<Block>) -> WeaverResult<()> {
        let module = self.module;
        for b in blocks {
            let index = match self.code.name(b) {
                Some(name) => {
                    // The module's own `$name` is text and always stays first.
                    let weight = order_weight(name);
                    self.code
                        .children(module)
                        .iter()
                        .take_while(|c| self.code.name(**c).map_or(0, order_weight) <= weight)
                        .count()
                }
                None => self.code.children(module).len(),
            };
            self.code.add_children_by_index(module, index, &[b])?;
            self.fill(b)?;
        }
        Ok(())
    }

    fn add_code(&mut self, code: &str) -> WeaverResult<()> {
        let blocks = self.code.parse_blocks(code)?;
        if blocks.is_empty() {
            return Err(WeaverError::structural(format!("generated code is empty: `{code}`")));
        }
        self.add_blocks(blocks)
    }

    fn fresh_name(class: char, start: usize, taken: impl Fn(&str) -> bool) -> String {
        (start..)
            .map(|n| format!("${CODE_INDEX_PREFIX}{class}{n}"))
            .find(|name| !taken(name))
            .unwrap_or_default()
    }

    /// A function name that is not in use.
    pub fn generate_function_index(&self) -> String {
        Self::fresh_name('f', self.functions.len(), |n| self.functions.contains_key(n))
    }

    /// A global name that is not in use.
    pub fn generate_global_index(&self) -> String {
        Self::fresh_name('g', self.globals.len(), |n| self.globals.contains_key(n))
    }

    /// A type name that is not in use.
    pub fn generate_type_index(&self) -> String {
        Self::fresh_name('t', self.types.len(), |n| self.types.contains_key(n))
    }

    /// A local name that is not in use in `func`.
    pub fn generate_local_index(&self, func: &FunctionDef) -> String {
        Self::fresh_name('l', func.locals.len(), |n| {
            func.locals.contains_key(n) || func.params.contains_key(n)
        })
    }

    /// Add a global from a `type = value` declaration. Returns its name.
    pub fn add_global(&mut self, decl: &str) -> WeaverResult<String> {
        let var = parse_variable(decl)?;
        let name = self.generate_global_index();
        self.add_code(&templates::global(&name, &var.ty.to_string(), &var.value))?;
        debug!("added global {name}: {}", var.ty);
        Ok(name)
    }

    /// Add a type for the signature of `f`. Returns its name.
    pub fn add_type(&mut self, f: &FunctionYaml) -> WeaverResult<String> {
        let params: Vec<String> = f.args.iter().map(|a| a.ty.clone()).collect();
        self.add_type_with(&params, &f.result)
    }

    /// Add a type with the given params and result. Returns its name.
    pub fn add_type_with(&mut self, params: &[String], result: &str) -> WeaverResult<String> {
        let name = self.generate_type_index();
        self.add_code(&templates::function_type(&name, params, result))?;
        Ok(name)
    }

    /// Types keyed by their structural signature.
    pub fn types_by_signature(&self) -> IndexMap<String, String> {
        self.types
            .values()
            .map(|t| (t.signature(), t.name.clone()))
            .collect()
    }

    /// Find a type matching the signature of `f`, adding one if needed.
    fn resolve_function_type(&mut self, f: &FunctionYaml) -> WeaverResult<String> {
        let existing = self.types.values().find(|t| {
            t.result == f.result
                && t.params.len() == f.args.len()
                && t.params.iter().zip(&f.args).all(|(p, a)| *p == a.ty)
        });
        match existing {
            Some(t) => Ok(t.name.clone()),
            None => self.add_type(f),
        }
    }

    /// Add an internal function. Returns its name.
    pub fn add_function(&mut self, f: &FunctionYaml) -> WeaverResult<String> {
        let type_name = self.resolve_function_type(f)?;
        let name = self.generate_function_index();
        self.add_code(&templates::function(f, &name, &type_name))?;
        debug!("added function {name}");
        Ok(name)
    }

    /// Add an imported function. Returns its name.
    pub fn add_import_function(&mut self, f: &FunctionYaml) -> WeaverResult<String> {
        let import = f
            .imported
            .clone()
            .ok_or_else(|| WeaverError::structural("imported function without import descriptor"))?;
        let type_name = self.resolve_function_type(f)?;
        let name = self.generate_function_index();
        self.add_custom_import_function(&name, &type_name, &import.module, &import.field)?;
        Ok(name)
    }

    /// Add an import with a given function name.
    pub fn add_custom_import_function(
        &mut self,
        name: &str,
        type_name: &str,
        module: &str,
        field: &str,
    ) -> WeaverResult<()> {
        self.add_code(&templates::import_function(name, type_name, module, field))?;
        trace!("imported {module}.{field} as {name}");
        Ok(())
    }

    /// Export the existing function `name` under the export name of `f`.
    pub fn add_export_function(&mut self, f: &FunctionYaml, name: &str) -> WeaverResult<()> {
        let export = f
            .exported
            .as_deref()
            .ok_or_else(|| WeaverError::structural("exported function without export name"))?;
        self.expect_function(name)?;
        self.add_code(&templates::export_function(name, export))
    }

    /// Add a `start` field for the function `name`.
    pub fn add_start_function(&mut self, name: &str) -> WeaverResult<()> {
        self.expect_function(name)?;
        self.add_code(&templates::start(name))
    }

    /// Add a local to `func` from a `type = value` declaration. Returns its
    /// name.
    pub fn add_local(&mut self, func: &str, decl: &str) -> WeaverResult<String> {
        let var = parse_variable(decl)?;
        let name = self.generate_local_index(self.expect_function(func)?);
        self.add_local_with(func, &name, &var.ty.to_string(), &var.value)?;
        Ok(name)
    }

    /// Add a local with a chosen name. A primitive local with a non-empty
    /// value is also initialized at the start of the function body.
    pub fn add_local_with(&mut self, func: &str, name: &str, ty: &str, value: &str) -> WeaverResult<()> {
        let instr = self.expect_function(func)?.instr;
        let mut snippet = templates::local(name, ty);
        if types::is_primitive(ty) && !value.is_empty() {
            snippet.push(' ');
            snippet.push_str(&templates::set_local(name, ty, value));
        }
        let blocks = self.code.parse_blocks(&snippet)?;
        let index = self
            .code
            .find_first_instruction(instr)
            .unwrap_or(self.code.children(instr).len());
        self.code.add_children_by_index(instr, index, &blocks)?;
        let f = self
            .functions
            .get_mut(func)
            .ok_or_else(|| WeaverError::unknown("function", func))?;
        let order = f.locals.len();
        f.locals.insert(
            name.to_string(),
            LocalDef {
                name: name.to_string(),
                ty: ty.to_string(),
                initial_value: value.to_string(),
                order,
            },
        );
        trace!("added local {name} {ty} to {func}");
        Ok(())
    }

    /// Insert `code` at the beginning of the body of `func`, after any
    /// leading constant local initializations.
    pub fn add_code_at_func_start(&mut self, func: &str, code: &str) -> WeaverResult<()> {
        let instr = self.expect_function(func)?.instr;
        let blocks = self.code.parse_blocks(code)?;
        let c = &self.code;
        let len = c.children(instr).len();
        let mut index = c.find_first_instruction(instr).unwrap_or(len);
        while index < len {
            let b = c.children(instr)[index];
            let is_const_init = c.is_named(b, "local.set")
                && c.children(b).len() == 2
                && c.children(b)[1..].iter().all(|v| {
                    c.name(*v).is_some_and(|n| n.ends_with("const")) && c.children(*v).len() == 1
                });
            if !is_const_init {
                break;
            }
            index += 1;
        }
        self.code.add_children_by_index(instr, index, &blocks)
    }

    /// Insert `code` before every `return` of `func`, and at the end of its
    /// body unless the body already ends with a `return`.
    pub fn add_code_at_func_end(&mut self, func: &str, code: &str) -> WeaverResult<()> {
        let instr = self.expect_function(func)?.instr;
        let returns: Vec<Block> = self
            .code
            .preorder(instr)
            .into_iter()
            .filter(|b| self.code.is_named(*b, "return"))
            .collect();
        for ret in &returns {
            let Some(parent) = self.code.parent(*ret) else { continue };
            let blocks = self.code.parse_blocks(code)?;
            self.code.add_children(parent, *ret, &blocks)?;
        }
        let ends_with_return = match (returns.last(), self.code.children(instr).last()) {
            (Some(r), Some(last)) => r == last,
            _ => false,
        };
        if !ends_with_return {
            let blocks = self.code.parse_blocks(code)?;
            self.code.append_children(instr, &blocks)?;
        }
        Ok(())
    }

    /// Remove a module field from the tree. Its index entries are left in
    /// place.
    pub(crate) fn remove_field(&mut self, block: Block) -> WeaverResult<()> {
        self.code.detach(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODULE: &str = r#"(module
        (type $t0 (func (param i32) (result i32)))
        (import "env" "log" (func $log (type $t0)))
        (func $add (param $a i32) (param $b i32) (result i32) (local $tmp i32)
            (i32.add (local.get $a) (local.get $b)))
        (func $main (export "main") (call $add (i32.const 1) (i32.const 2)) drop)
        (global $g (mut i32) (i32.const 7))
        (global $s (mut string) (string.const "hi"))
        (export "add" (func $add))
        (start $main))"#;

    fn ctx() -> ModuleContext {
        ModuleContext::new(MODULE).unwrap()
    }

    #[track_caller]
    fn weights(ctx: &ModuleContext) -> Vec<u8> {
        let code = ctx.code();
        code.children(ctx.module())
            .iter()
            .map(|b| code.name(*b).map_or(10, order_weight))
            .collect()
    }

    #[test]
    fn index_completeness() {
        let ctx = ctx();
        assert_eq!(ctx.functions().count(), 3);
        let log = ctx.function("$log").unwrap();
        assert_eq!(log.imported.as_ref().unwrap().field, "log");
        assert_eq!(log.params.len(), 1);
        assert_eq!(log.result, "i32");
        assert_eq!(ctx.import_function("env", "log").unwrap().name, "$log");

        let add = ctx.function("$add").unwrap();
        assert_eq!(add.parameters().map(|p| p.name.as_str()).collect::<Vec<_>>(), ["$a", "$b"]);
        assert_eq!(add.locals["$tmp"].ty, "i32");
        assert_eq!(ctx.function_index(add), 1);
        assert_eq!(ctx.export_function("add").unwrap().name, "$add");
        assert_eq!(ctx.export_function("main").unwrap().name, "$main");
        assert_eq!(ctx.start_function().unwrap().name, "$main");
        assert!(ctx.function("$main").unwrap().is_start);

        let g = ctx.global("$g").unwrap();
        assert!(g.mutable);
        assert_eq!(g.initial_value, "7");
        let s = ctx.global("$s").unwrap();
        assert_eq!(s.ty, "string");
        assert_eq!(s.initial_value, "hi");
        assert!(!s.is_primitive());
        assert_eq!(ctx.type_def("$t0").unwrap().signature(), "i32_i32");
    }

    #[test]
    fn structural_errors() {
        assert!(matches!(ModuleContext::new("(func $f)"), Err(WeaverError::Structural(_))));
        assert!(ModuleContext::new("(module (func))").is_err());
        assert!(ModuleContext::new(r#"(module (import "a" (func $f)))"#).is_err());
        assert!(ModuleContext::new(r#"(module (export "x" (func $nope)))"#).is_err());
        assert!(ModuleContext::new("(module (start $nope))").is_err());
    }

    #[test]
    fn unnamed_functions_use_their_index() {
        let ctx = ModuleContext::new("(module (func (nop)) (func (nop)))").unwrap();
        assert!(ctx.function("0").is_some());
        assert!(ctx.function("1").is_some());
    }

    #[test]
    fn additions_keep_canonical_order() {
        let mut ctx = ctx();
        let f = FunctionYaml {
            args: vec![FunctionArgYaml {
                name: "x".into(),
                ty: "f64".into(),
            }],
            result: "f64".into(),
            code: "(local.get $x)".into(),
            ..Default::default()
        };
        let name = ctx.add_function(&f).unwrap();
        assert_eq!(name, "$wmr_f3");
        assert_eq!(ctx.function(&name).unwrap().type_name, "$wmr_t1");
        let g = ctx.add_global("f32 = 1.5").unwrap();
        assert_eq!(ctx.global(&g).unwrap().initial_value, "1.5");
        let imp = FunctionYaml {
            imported: Some(FunctionImportYaml {
                module: "m".into(),
                field: "f".into(),
            }),
            ..Default::default()
        };
        let imported = ctx.add_import_function(&imp).unwrap();
        assert!(ctx.function(&imported).unwrap().imported.is_some());
        let exp = FunctionYaml {
            exported: Some("twice".into()),
            ..Default::default()
        };
        ctx.add_export_function(&exp, &name).unwrap();
        assert_eq!(ctx.export_function("twice").unwrap().name, name);

        let w = weights(&ctx);
        assert!(w.windows(2).all(|p| p[0] <= p[1]), "{w:?}");
    }

    #[test]
    fn additions_follow_the_module_name() {
        let mut ctx = ModuleContext::new("(module $m (func $f (nop)))").unwrap();
        ctx.add_function(&FunctionYaml::default()).unwrap();
        assert_eq!(
            ctx.string(),
            "(module $m (type $wmr_t0 (func)) (func $f (nop)) (func $wmr_f1 (type $wmr_t0)))"
        );
    }

    #[test]
    fn fresh_names() {
        let mut ctx = ModuleContext::new("(module (func $wmr_f0 (nop)))").unwrap();
        let name = ctx.generate_function_index();
        assert!(ctx.function(&name).is_none());
        let name = ctx.add_function(&FunctionYaml::default()).unwrap();
        assert_ne!(name, "$wmr_f0");
        assert!(name.starts_with("$wmr_f"));
    }

    #[test]
    fn locals_and_body_code() {
        let mut ctx = ctx();
        let l = ctx.add_local("$add", "i32 = 3").unwrap();
        assert_eq!(l, "$wmr_l1");
        ctx.add_code_at_func_start("$add", "(nop)").unwrap();
        ctx.add_code_at_func_end("$add", "(unreachable)").unwrap();
        let add = ctx.function("$add").unwrap().instr();
        assert_eq!(
            ctx.code().func_instrs_string(add),
            "(local.set $wmr_l1 (i32.const 3)) (nop) (i32.add (local.get $a) (local.get $b)) (unreachable)"
        );
    }

    #[test]
    fn code_at_end_goes_before_returns() {
        let mut ctx =
            ModuleContext::new("(module (func $f (block (return)) (return)))").unwrap();
        ctx.add_code_at_func_end("$f", "(nop)").unwrap();
        let f = ctx.function("$f").unwrap().instr();
        assert_eq!(ctx.code().func_instrs_string(f), "(block (nop) (return)) (nop) (return)");
    }

    #[test]
    fn aliases_and_order() {
        let mut ctx = ctx();
        ctx.function_alias.insert("$add".into(), "sum".into());
        ctx.global_alias.insert("$g".into(), "sum".into());
        assert_eq!(ctx.alias_key("sum"), Some("$g"));
        assert_eq!(ctx.alias_value("$add"), Some("sum"));
        let order = ctx.order_map();
        assert_eq!(order["$log"], 1);
        assert_eq!(order["$add"], 2);
        assert_eq!(order["sum"], 2);
        assert_eq!(ctx.export_function_by_regex("^ma").unwrap().unwrap().name, "$main");
        assert!(ctx.export_function_by_regex("(").is_err());
    }
}
