/// Reachability analysis
/// Closed-world worklist over instruction operands deciding which types
/// and methods get compiled
use hashbrown::HashSet;

use crate::metadata::{MethodInfo, Module};
use crate::opcodes::{CilOp, FieldRef, MethodRef, TokenRef};

type MethodKey = (String, String, usize);

#[derive(Debug, Default)]
pub struct ReachableSet {
    types: HashSet<String>,
    methods: HashSet<MethodKey>,
}

impl ReachableSet {
    pub fn has_type(&self, il_name: &str) -> bool {
        self.types.contains(il_name)
    }

    pub fn has_method(&self, declaring: &str, name: &str, arity: usize) -> bool {
        self.methods
            .contains(&(declaring.to_string(), name.to_string(), arity))
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

fn method_key(m: &MethodRef) -> MethodKey {
    (m.declaring_type.clone(), m.name.clone(), m.params.len())
}

fn visit_op(op: &CilOp, types: &mut Vec<String>, methods: &mut Vec<MethodRef>) {
    match op {
        CilOp::Call(m)
        | CilOp::CallVirt(m)
        | CilOp::NewObj(m)
        | CilOp::Jmp(m)
        | CilOp::LdFtn(m)
        | CilOp::LdVirtFtn(m) => {
            methods.push(m.clone());
        }
        CilOp::LdFld(f)
        | CilOp::LdFldA(f)
        | CilOp::StFld(f)
        | CilOp::LdsFld(f)
        | CilOp::LdsFldA(f)
        | CilOp::StsFld(f) => {
            visit_field(f, types);
        }
        CilOp::NewArr(t)
        | CilOp::LdObj(t)
        | CilOp::StObj(t)
        | CilOp::CpObj(t)
        | CilOp::LdElemAny(t)
        | CilOp::StElemAny(t)
        | CilOp::LdElemA(t)
        | CilOp::CastClass(t)
        | CilOp::IsInst(t)
        | CilOp::Box(t)
        | CilOp::Unbox(t)
        | CilOp::UnboxAny(t)
        | CilOp::InitObj(t)
        | CilOp::MkRefAny(t)
        | CilOp::RefAnyVal(t)
        | CilOp::SizeOf(t)
        | CilOp::Constrained(t) => {
            types.push(t.clone());
        }
        CilOp::LdToken(TokenRef::Type(t)) => types.push(t.clone()),
        CilOp::LdToken(TokenRef::Field(f)) => visit_field(f, types),
        CilOp::LdToken(TokenRef::Method(m)) => methods.push(m.clone()),
        _ => {}
    }
}

fn visit_field(f: &FieldRef, types: &mut Vec<String>) {
    types.push(f.declaring_type.clone());
    types.push(f.field_type.clone());
}

fn strip_shape(il_name: &str) -> &str {
    let name = il_name.trim();
    let name = name.strip_suffix('&').unwrap_or(name);
    let name = name.strip_suffix('*').unwrap_or(name);
    name.strip_suffix("[]").unwrap_or(name)
}

/// Computes the reachable closure from the module entry point (or every
/// method, for library modules) plus static constructors of every
/// reached type.
pub fn analyze(source: &Module) -> ReachableSet {
    let mut set = ReachableSet::default();
    let mut method_worklist: Vec<MethodKey> = Vec::new();
    let mut type_worklist: Vec<String> = Vec::new();

    match &source.entry_point {
        Some(entry) => method_worklist.push(method_key(entry)),
        None => {
            for ty in &source.types {
                type_worklist.push(ty.full_name.clone());
                for m in &ty.methods {
                    method_worklist.push((ty.full_name.clone(), m.name.clone(), m.params.len()));
                }
            }
        }
    }

    while !method_worklist.is_empty() || !type_worklist.is_empty() {
        while let Some(name) = type_worklist.pop() {
            let name = strip_shape(&name).to_string();
            if name.is_empty() || !set.types.insert(name.clone()) {
                continue;
            }
            if let Some(ty) = source.get_type(&name) {
                if let Some(base) = &ty.base_type {
                    type_worklist.push(base.clone());
                }
                type_worklist.extend(ty.interfaces.iter().cloned());
                for field in &ty.fields {
                    type_worklist.push(field.field_type.clone());
                }
                // A reached type's static constructor runs.
                if let Some(cctor) = ty.methods.iter().find(|m| m.is_cctor()) {
                    method_worklist.push((
                        ty.full_name.clone(),
                        cctor.name.clone(),
                        cctor.params.len(),
                    ));
                }
            }
        }

        while let Some(key) = method_worklist.pop() {
            if !set.methods.insert(key.clone()) {
                continue;
            }
            let (declaring, name, arity) = &key;
            type_worklist.push(declaring.clone());
            let body: Option<&MethodInfo> = source
                .get_type(declaring)
                .and_then(|t| t.methods.iter().find(|m| &m.name == name && m.params.len() == *arity));
            let Some(method) = body else { continue };
            type_worklist.push(method.return_type.clone());
            for p in &method.params {
                type_worklist.push(p.param_type.clone());
            }
            for l in &method.locals {
                type_worklist.push(l.local_type.clone());
            }
            for h in &method.handlers {
                if let Some(t) = &h.catch_type {
                    type_worklist.push(t.clone());
                }
            }
            let mut types = Vec::new();
            let mut methods = Vec::new();
            for ins in &method.body {
                visit_op(&ins.op, &mut types, &mut methods);
            }
            type_worklist.extend(types);
            for m in methods {
                type_worklist.push(m.declaring_type.clone());
                type_worklist.push(m.return_type.clone());
                for p in &m.params {
                    type_worklist.push(p.clone());
                }
                for a in &m.generic_args {
                    type_worklist.push(a.clone());
                }
                method_worklist.push(method_key(&m));
            }
            // The loop restarts type processing, which may enqueue new
            // static constructors.
            if !type_worklist.is_empty() {
                break;
            }
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Instruction, MethodAttrs, MethodInfo, TypeAttrs, TypeDef};

    fn ty(name: &str, methods: Vec<MethodInfo>) -> TypeDef {
        TypeDef {
            full_name: name.into(),
            namespace: String::new(),
            attrs: TypeAttrs::default(),
            base_type: Some("System.Object".into()),
            interfaces: vec![],
            fields: vec![],
            methods,
            enum_underlying: None,
            generic_params: vec![],
        }
    }

    fn m(name: &str, body: Vec<CilOp>) -> MethodInfo {
        MethodInfo {
            name: name.into(),
            attrs: MethodAttrs::STATIC,
            params: vec![],
            return_type: "System.Void".into(),
            locals: vec![],
            body: body
                .into_iter()
                .enumerate()
                .map(|(i, op)| Instruction { offset: i as u32, op })
                .collect(),
            handlers: vec![],
            sequence_points: vec![],
            pinvoke: None,
            generic_params: vec![],
            overrides: vec![],
        }
    }

    fn call(declaring: &str, name: &str) -> CilOp {
        CilOp::Call(MethodRef {
            declaring_type: declaring.into(),
            name: name.into(),
            params: vec![],
            return_type: "System.Void".into(),
            has_this: false,
            generic_args: vec![],
        })
    }

    #[test]
    fn closure_follows_calls_and_skips_unreferenced() {
        let module = Module {
            name: "m".into(),
            entry_point: Some(MethodRef {
                declaring_type: "App.Program".into(),
                name: "Main".into(),
                params: vec![],
                return_type: "System.Void".into(),
                has_this: false,
                generic_args: vec![],
            }),
            types: vec![
                ty("App.Program", vec![m("Main", vec![call("App.Used", "Go"), CilOp::Ret])]),
                ty("App.Used", vec![m("Go", vec![CilOp::Ret])]),
                ty("App.Unused", vec![m("Never", vec![CilOp::Ret])]),
            ],
            external_enums: Default::default(),
        };
        let set = analyze(&module);
        assert!(set.has_type("App.Program"));
        assert!(set.has_type("App.Used"));
        assert!(!set.has_type("App.Unused"));
        assert!(set.has_method("App.Used", "Go", 0));
        assert!(!set.has_method("App.Unused", "Never", 0));
    }

    #[test]
    fn static_constructors_of_reached_types_are_roots() {
        let mut used = ty("App.Used", vec![m("Go", vec![CilOp::Ret])]);
        let mut cctor = m(".cctor", vec![call("App.Init", "Prime"), CilOp::Ret]);
        cctor.attrs = MethodAttrs::STATIC | MethodAttrs::CCTOR;
        used.methods.push(cctor);

        let module = Module {
            name: "m".into(),
            entry_point: Some(MethodRef {
                declaring_type: "App.Program".into(),
                name: "Main".into(),
                params: vec![],
                return_type: "System.Void".into(),
                has_this: false,
                generic_args: vec![],
            }),
            types: vec![
                ty("App.Program", vec![m("Main", vec![call("App.Used", "Go"), CilOp::Ret])]),
                used,
                ty("App.Init", vec![m("Prime", vec![CilOp::Ret])]),
            ],
            external_enums: Default::default(),
        };
        let set = analyze(&module);
        assert!(set.has_method("App.Used", ".cctor", 0));
        assert!(set.has_method("App.Init", "Prime", 0));
    }

    #[test]
    fn library_modules_compile_everything() {
        let module = Module {
            name: "m".into(),
            entry_point: None,
            types: vec![ty("App.A", vec![m("F", vec![CilOp::Ret])])],
            external_enums: Default::default(),
        };
        let set = analyze(&module);
        assert!(set.has_method("App.A", "F", 0));
    }

    #[test]
    fn shaped_type_names_collapse_to_the_element() {
        let module = Module {
            name: "m".into(),
            entry_point: Some(MethodRef {
                declaring_type: "App.Program".into(),
                name: "Main".into(),
                params: vec![],
                return_type: "System.Void".into(),
                has_this: false,
                generic_args: vec![],
            }),
            types: vec![ty(
                "App.Program",
                vec![m(
                    "Main",
                    vec![
                        CilOp::LdcI4(1),
                        CilOp::NewArr("App.Elem[]".into()),
                        CilOp::Pop,
                        CilOp::Ret,
                    ],
                )],
            ), ty("App.Elem", vec![])],
            external_enums: Default::default(),
        };
        let set = analyze(&module);
        assert!(set.has_type("App.Elem"));
    }
}
