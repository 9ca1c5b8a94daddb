//! Host bridge imports.
//!
//! Lowered code calls into five host modules. Each module exposes a fixed
//! roster of functions, and a module's whole roster is imported as soon as
//! any rewritten code needs it.

use super::RuntimeState;
use crate::context::{ModuleContext, type_signature};
use crate::error::WeaverResult;
use log::debug;
use serde_derive::Serialize;

/// A function the host must provide.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImportFunctionDef {
    pub module_name: String,
    pub exported_name: String,
    pub params: Vec<String>,
    pub result: String,
}

impl ImportFunctionDef {
    /// The name under which the import is declared in the module.
    pub fn internal_name(&self) -> String {
        format!("${}.{}", self.module_name, self.exported_name)
    }
}

/// `(field, result, params)`; an empty result means none.
type Roster = &'static [(&'static str, &'static str, &'static [&'static str])];

const OPERATIONS: Roster = &[
    ("clear", "", &[]),
    ("new_code", "", &["i32"]),
    ("write", "", &["i32"]),
    ("write_f32", "", &["f32"]),
    ("write_f64", "", &["f64"]),
    ("read", "i32", &["i32"]),
    ("read_f32", "f32", &["i32"]),
    ("read_f64", "f64", &["i32"]),
    ("evaluate", "i32", &[]),
];

const ARGS: Roster = &[
    ("push", "", &[]),
    ("pop", "", &[]),
    ("new", "", &["i32"]),
    ("write", "", &["i32"]),
    ("write_f32", "", &["f32"]),
    ("write_f64", "", &["f64"]),
    ("new_copy", "", &[]),
    ("copy_index", "", &["i32"]),
    ("copy_operation", "", &["i32"]),
];

const ZONE: Roster = &[
    ("push", "", &[]),
    ("pop", "", &[]),
    ("new", "", &["i32"]),
    ("write_name", "", &["i32"]),
    ("write_key", "", &["i32"]),
    ("write_value", "", &["i32"]),
    ("write_value_f32", "", &["f32"]),
    ("write_value_f64", "", &["f64"]),
    ("new_copy", "", &[]),
    ("copy_name", "", &["i32"]),
    ("copy_key", "", &["i32"]),
    ("copy_arg", "", &["i32"]),
    ("copy_operation", "", &["i32"]),
    ("copy_operation_global", "", &["i32"]),
    ("set", "", &[]),
    ("set_global", "", &[]),
];

const RETURNS: Roster = &[
    ("new_copy", "", &[]),
    ("copy_name", "", &["i32"]),
    ("copy_key", "", &["i32"]),
    ("copy_var", "", &[]),
    ("copy_operation", "", &["i32"]),
];

const ERROR: Roster = &[("new", "", &[]), ("set", "", &["i32"]), ("print", "", &[])];

/// A host module and the functions it exports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GlueGroup {
    Operations,
    Args,
    Zone,
    Returns,
    Error,
}

impl GlueGroup {
    /// All groups, in import order.
    pub const ALL: [GlueGroup; 5] = [
        GlueGroup::Operations,
        GlueGroup::Args,
        GlueGroup::Zone,
        GlueGroup::Returns,
        GlueGroup::Error,
    ];

    /// The host module name.
    pub fn module_name(self) -> &'static str {
        match self {
            GlueGroup::Operations => "operations",
            GlueGroup::Args => "args",
            GlueGroup::Zone => "zone",
            GlueGroup::Returns => "returns",
            GlueGroup::Error => "error",
        }
    }

    fn roster(self) -> Roster {
        match self {
            GlueGroup::Operations => OPERATIONS,
            GlueGroup::Args => ARGS,
            GlueGroup::Zone => ZONE,
            GlueGroup::Returns => RETURNS,
            GlueGroup::Error => ERROR,
        }
    }

    /// The functions of this group.
    pub fn functions(self) -> Vec<ImportFunctionDef> {
        self.roster()
            .iter()
            .map(|(field, result, params)| ImportFunctionDef {
                module_name: self.module_name().to_string(),
                exported_name: field.to_string(),
                params: params.iter().map(|p| p.to_string()).collect(),
                result: result.to_string(),
            })
            .collect()
    }
}

impl RuntimeState {
    /// Does rewritten code depend on `group`?
    pub(crate) fn needs(&self, group: GlueGroup) -> bool {
        match group {
            GlueGroup::Operations => self.operations,
            GlueGroup::Args => !self.arg_calls.is_empty(),
            GlueGroup::Zone => self.zone,
            GlueGroup::Returns => self.returns,
            GlueGroup::Error => self.error,
        }
    }
}

/// Import every group the rewritten code depends on.
///
/// Functions that are already declared are skipped, and types are shared
/// with existing types of the same signature.
pub(crate) fn add_glue_functions(ctx: &mut ModuleContext) -> WeaverResult<()> {
    let groups: Vec<GlueGroup> = GlueGroup::ALL
        .into_iter()
        .filter(|g| ctx.runtime.needs(*g))
        .collect();
    if groups.is_empty() {
        return Ok(());
    }
    ctx.runtime.need_js = true;
    let mut types = ctx.types_by_signature();
    for group in groups {
        debug!("importing glue group `{}`", group.module_name());
        for f in group.functions() {
            let name = f.internal_name();
            if ctx.function(&name).is_some() {
                continue;
            }
            let signature = type_signature(&f.result, &f.params);
            let type_name = match types.get(&signature) {
                Some(t) => t.clone(),
                None => {
                    let t = ctx.add_type_with(&f.params, &f.result)?;
                    types.insert(signature, t.clone());
                    t
                }
            };
            ctx.add_custom_import_function(&name, &type_name, &f.module_name, &f.exported_name)?;
            ctx.runtime.glue_imports.push(f);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rosters() {
        let ops = GlueGroup::Operations.functions();
        assert_eq!(ops.len(), 9);
        let read = ops.iter().find(|f| f.exported_name == "read_f64").unwrap();
        assert_eq!(read.params, ["i32"]);
        assert_eq!(read.result, "f64");
        assert_eq!(read.internal_name(), "$operations.read_f64");
        assert_eq!(GlueGroup::Zone.functions().len(), 16);
        assert_eq!(GlueGroup::Error.functions()[1].exported_name, "set");
        assert!(GlueGroup::ALL.iter().all(|g| !g.functions().is_empty()));
    }

    #[test]
    fn serializes_with_field_names() {
        let f = &GlueGroup::Returns.functions()[1];
        let json = serde_json::to_value(f).unwrap();
        assert_eq!(json["ModuleName"], "returns");
        assert_eq!(json["ExportedName"], "copy_name");
        assert_eq!(json["Params"][0], "i32");
    }

    #[test]
    fn imports_share_types() {
        let mut ctx = ModuleContext::new("(module (type $t (func (param i32))) (func $f (nop)))").unwrap();
        ctx.runtime.error = true;
        add_glue_functions(&mut ctx).unwrap();
        assert!(ctx.need_js());
        assert_eq!(ctx.glue_imports().len(), 3);
        assert_eq!(ctx.function("$error.set").unwrap().type_name, "$t");
        assert_eq!(ctx.function("$error.new").unwrap().imported.as_ref().unwrap().module, "error");

        let before = ctx.string();
        add_glue_functions(&mut ctx).unwrap();
        assert_eq!(ctx.string(), before);
        assert_eq!(ctx.glue_imports().len(), 3);
    }
}
