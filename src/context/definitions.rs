//! Definitions of module-level entities.

use crate::code::Block;
use crate::types::{self, VariableType};
use indexmap::IndexMap;
use itertools::Itertools;
use serde_derive::Deserialize;

/// Where an imported entity comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportedDef {
    pub module: String,
    pub field: String,
}

/// A function parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamDef {
    pub name: String,
    pub ty: String,
    pub order: usize,
}

impl ParamDef {
    /// Is the parameter a WebAssembly numeric value?
    pub fn is_primitive(&self) -> bool {
        types::is_primitive(&self.ty)
    }

    /// The host type code of the parameter seen from inside its function.
    pub fn type_code_on_fn(&self, exported: bool) -> u32 {
        VariableType::parse(&self.ty).map_or(0, |t| t.code_on_fn(exported))
    }
}

/// A function local.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalDef {
    pub name: String,
    pub ty: String,
    pub initial_value: String,
    pub order: usize,
}

impl LocalDef {
    pub fn is_primitive(&self) -> bool {
        types::is_primitive(&self.ty)
    }
}

/// A function type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    pub params: Vec<String>,
    pub result: String,
}

impl TypeDef {
    /// Key identifying structurally equal types.
    pub fn signature(&self) -> String {
        type_signature(&self.result, &self.params)
    }
}

/// The structural key `result_param_param...` of a function type.
pub fn type_signature(result: &str, params: &[String]) -> String {
    format!("{result}_{}", params.join("_"))
}

/// A global variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalDef {
    pub name: String,
    pub ty: String,
    pub mutable: bool,
    pub imported: Option<ImportedDef>,
    pub exported: Option<String>,
    pub initial_value: String,
    pub(crate) instr: Block,
}

impl GlobalDef {
    pub fn is_primitive(&self) -> bool {
        types::is_primitive(&self.ty)
    }

    /// The `global` instruction that declares this global.
    pub fn instr(&self) -> Block {
        self.instr
    }
}

/// A function, either internal or imported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    pub type_name: String,
    pub params: IndexMap<String, ParamDef>,
    pub result: String,
    pub locals: IndexMap<String, LocalDef>,
    pub imported: Option<ImportedDef>,
    pub exported: Option<String>,
    pub is_start: bool,
    /// Internal param and local names to the names used by weaving scripts.
    pub alias: IndexMap<String, String>,
    /// Position among functions of the same class (imported or internal).
    pub(crate) order: usize,
    pub(crate) instr: Block,
}

impl FunctionDef {
    pub(crate) fn new(name: String, instr: Block, order: usize) -> Self {
        FunctionDef {
            name,
            type_name: String::new(),
            params: IndexMap::new(),
            result: String::new(),
            locals: IndexMap::new(),
            imported: None,
            exported: None,
            is_start: false,
            alias: IndexMap::new(),
            order,
            instr,
        }
    }

    /// The `func` instruction of this function.
    pub fn instr(&self) -> Block {
        self.instr
    }

    /// The WebAssembly function index, given the number of imported
    /// functions in the module.
    pub fn index(&self, import_count: usize) -> usize {
        if self.imported.is_some() {
            self.order
        } else {
            self.order + import_count
        }
    }

    /// Parameters sorted by position.
    pub fn parameters(&self) -> impl Iterator<Item = &ParamDef> {
        self.params.values().sorted_by_key(|p| p.order)
    }

    /// Script alias of an internal param or local name.
    pub fn alias_value(&self, key: &str) -> Option<&str> {
        self.alias.get(key).map(String::as_str)
    }

    /// Internal name of a script alias.
    pub fn alias_key(&self, value: &str) -> Option<&str> {
        self.alias
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(k, _)| k.as_str())
    }
}

/// The description of a function handed to the context by a weaving script.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FunctionYaml {
    pub args: Vec<FunctionArgYaml>,
    pub result: String,
    pub code: String,
    pub imported: Option<FunctionImportYaml>,
    pub exported: Option<String>,
}

/// A named, typed function argument.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FunctionArgYaml {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// Import coordinates of a script-declared function.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FunctionImportYaml {
    pub module: String,
    pub field: String,
}
