/// IR construction and rewriting passes
/// Pass order: type shells -> interface proxies -> method shells and
/// vtables -> method bodies -> overload disambiguation -> deferred-call
/// fix-up -> verification
use hashbrown::{HashMap, HashSet};
use rayon::prelude::*;

use crate::config::CompilerOptions;
use crate::diagnostics::{CompileError, DiagnosticSink};
use crate::icall::{ICallQuery, ICALLS};
use crate::interfaces::{is_known_bcl_interface, synthesize_proxy};
use crate::ir::{
    ExplicitOverride, IRField, IRLocal, IRMethod, IRModule, IRParam, IRType, InstKind, TypeFlags,
    VtableSlot,
};
use crate::lowering::{lower_method_body, SharedPools};
use crate::mangle::{
    disambig_suffix, disambig_key, mangle_method_name, mangle_type_name, sanitize_identifier,
    short_class_name, split_generic_instance, substitute_generic_params, TypeResolver,
};
use crate::metadata::{MethodInfo, Module, TypeDef};
use crate::reachability::ReachableSet;

/// Seeds the resolver with the module's value types, enums and the
/// runtime-provided name sets.
pub fn build_resolver(source: &Module, options: &CompilerOptions) -> TypeResolver {
    let mut resolver = TypeResolver::new();
    for ty in &source.types {
        if ty.is_enum() {
            let underlying = ty.enum_underlying.as_deref().unwrap_or("System.Int32");
            resolver.add_enum(&ty.full_name, underlying);
        } else if ty.is_value_type() {
            resolver.add_value_type(&ty.full_name);
        }
    }
    for (name, underlying) in &source.external_enums {
        resolver.add_enum(name, underlying);
    }
    for name in options.runtime_provided_types() {
        resolver.add_runtime_short(name);
    }
    resolver
}

fn type_cpp_name(il_name: &str, options: &CompilerOptions) -> String {
    if options.is_runtime_provided(il_name) {
        short_class_name(il_name)
    } else {
        mangle_type_name(il_name)
    }
}

/// Generic substitution map for a closed instance type: the open type's
/// parameter names mapped positionally onto the instance arguments.
fn generic_context(ty: &TypeDef) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some((_, args)) = split_generic_instance(&ty.full_name) {
        for (param, arg) in ty.generic_params.iter().zip(args) {
            map.insert(param.clone(), arg);
        }
    }
    map
}

pub fn build_type_shells(
    source: &Module,
    reachable: &ReachableSet,
    options: &CompilerOptions,
    resolver: &TypeResolver,
) -> IRModule {
    let mut module = IRModule::new(source.name.clone());
    module.external_enums = source.external_enums.clone();

    for ty in &source.types {
        if !reachable.has_type(&ty.full_name) {
            continue;
        }
        let cpp_name = type_cpp_name(&ty.full_name, options);
        let mut shell = IRType::new(ty.full_name.clone(), cpp_name);
        shell.namespace = ty.namespace.clone();
        shell.base_type = ty.base_type.clone();
        shell.interfaces = ty.interfaces.clone();
        if ty.is_interface() {
            shell.flags |= TypeFlags::INTERFACE | TypeFlags::ABSTRACT;
        }
        if ty.attrs.contains(crate::metadata::TypeAttrs::ABSTRACT) {
            shell.flags |= TypeFlags::ABSTRACT;
        }
        if ty.is_value_type() {
            shell.flags |= TypeFlags::VALUE_TYPE;
        }
        if ty.is_enum() {
            shell.flags |= TypeFlags::ENUM | TypeFlags::VALUE_TYPE;
            let underlying = ty.enum_underlying.as_deref().unwrap_or("System.Int32");
            shell.enum_underlying = Some(resolver.cpp_type(underlying));
        }
        if options.is_runtime_provided(&ty.full_name) {
            shell.flags |= TypeFlags::RUNTIME_PROVIDED;
        }
        if let Some((_, args)) = split_generic_instance(&ty.full_name) {
            shell.flags |= TypeFlags::GENERIC_INSTANCE;
            shell.generic_args = args;
        }

        let ctx = generic_context(ty);
        let mut field_resolver = resolver.clone();
        field_resolver.set_generic_context(ctx.clone());
        for f in &ty.fields {
            shell.fields.push(IRField {
                il_name: f.name.clone(),
                cpp_name: sanitize_identifier(&f.name),
                cpp_type: field_resolver.cpp_type(&f.field_type),
                is_static: f.is_static(),
            });
        }
        module.add_type(shell);
    }
    module
}

/// Synthesizes proxy IR types for catalogue BCL interfaces that are
/// referenced (directly or through proxy parents) but never loaded.
pub fn add_interface_proxies(module: &mut IRModule, resolver: &TypeResolver) {
    let mut pending: Vec<String> = Vec::new();
    for ty in module.types() {
        for iface in &ty.interfaces {
            if !module.has_type(iface) && is_known_bcl_interface(iface) {
                pending.push(iface.clone());
            }
        }
    }
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(name) = pending.pop() {
        if module.has_type(&name) || !seen.insert(name.clone()) {
            continue;
        }
        if let Some(proxy) = synthesize_proxy(&name, resolver) {
            for parent in &proxy.interfaces {
                if !module.has_type(parent) && is_known_bcl_interface(parent) {
                    pending.push(parent.clone());
                }
            }
            module.add_type(proxy);
        }
    }
}

pub fn build_method_shells(
    module: &mut IRModule,
    source: &Module,
    reachable: &ReachableSet,
    resolver: &TypeResolver,
) {
    for src_ty in &source.types {
        if !module.has_type(&src_ty.full_name) {
            continue;
        }
        let ctx = generic_context(src_ty);
        let mut local_resolver = resolver.clone();
        local_resolver.set_generic_context(ctx.clone());

        let mut methods = Vec::new();
        let Some(shell_ref) = module.type_by_name(&src_ty.full_name) else {
            continue;
        };
        let type_cpp = shell_ref.cpp_name.clone();
        let declaring_il = shell_ref.il_name.clone();

        for m in &src_ty.methods {
            if source.entry_point.is_some()
                && !reachable.has_method(&src_ty.full_name, &m.name, m.params.len())
            {
                continue;
            }
            let il_ret = substitute_generic_params(&m.return_type, &ctx);
            let mut method =
                IRMethod::new(m.name.clone(), mangle_method_name(&type_cpp, &m.name, &il_ret));
            method.declaring_type = declaring_il.clone();
            method.is_static = m.is_static();
            method.is_virtual = m.is_virtual();
            method.is_newslot = m.attrs.contains(crate::metadata::MethodAttrs::NEWSLOT);
            method.is_abstract = m.attrs.contains(crate::metadata::MethodAttrs::ABSTRACT);
            method.is_ctor = m.is_ctor();
            method.pinvoke = m.pinvoke.clone();
            method.return_type = local_resolver.cpp_type(&il_ret);
            method.overrides = m
                .overrides
                .iter()
                .map(|o| ExplicitOverride {
                    interface_type: o.interface_type.clone(),
                    method_name: o.method_name.clone(),
                })
                .collect();

            if !m.is_static() {
                method.params.push(IRParam {
                    name: "__this".into(),
                    cpp_type: format!("{}*", type_cpp),
                    il_type: src_ty.full_name.clone(),
                });
            }
            for (i, p) in m.params.iter().enumerate() {
                let il_type = substitute_generic_params(&p.param_type, &ctx);
                let name = if p.name.is_empty() {
                    format!("a{}", i)
                } else {
                    sanitize_identifier(&p.name)
                };
                method.params.push(IRParam {
                    name,
                    cpp_type: local_resolver.cpp_type(&il_type),
                    il_type: il_type.clone(),
                });
                method.il_params.push(il_type);
            }
            for (i, l) in m.locals.iter().enumerate() {
                let il_type = substitute_generic_params(&l.local_type, &ctx);
                let name = l
                    .name
                    .as_deref()
                    .map(sanitize_identifier)
                    .unwrap_or_else(|| format!("loc{}", i));
                method.locals.push(IRLocal {
                    name,
                    cpp_type: local_resolver.cpp_type(&il_type),
                    il_type,
                });
            }

            // Registry mappings beat IL bodies: JIT-intrinsic bodies
            // cannot be lowered faithfully.
            let query = ICallQuery {
                declaring_type: &src_ty.full_name,
                method_name: &m.name,
                param_count: m.params.len(),
                first_param_il: method.il_params.first().map(String::as_str),
                is_generic_method: !m.generic_params.is_empty(),
                first_type_arg_is_reference: false,
            };
            if ICALLS.lookup(&query).is_some() {
                method.has_icall_mapping = true;
            }

            methods.push(method);
        }

        if let Some(shell) = module.type_by_name_mut(&src_ty.full_name) {
            shell.methods = methods;
        }
    }
}

fn topo_order(module: &IRModule) -> Vec<usize> {
    let index: HashMap<&str, usize> = module
        .types()
        .iter()
        .enumerate()
        .map(|(i, t)| (t.il_name.as_str(), i))
        .collect();
    let mut order = Vec::with_capacity(module.types().len());
    let mut placed = vec![false; module.types().len()];
    // Bases first; external bases act as roots. Bounded passes guard
    // against metadata cycles.
    for _ in 0..module.types().len() + 1 {
        let mut progressed = false;
        for (i, ty) in module.types().iter().enumerate() {
            if placed[i] {
                continue;
            }
            let base_ready = match ty.base_type.as_deref().and_then(|b| index.get(b)) {
                Some(&bi) => placed[bi],
                None => true,
            };
            if base_ready {
                placed[i] = true;
                order.push(i);
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    for (i, was_placed) in placed.iter().enumerate() {
        if !was_placed {
            order.push(i);
        }
    }
    order
}

/// Builds the virtual dispatch tables: a type starts from its base's
/// slots, overrides match by IL name and argument count, `newslot`
/// methods always append.
pub fn build_vtables(module: &mut IRModule) {
    for idx in topo_order(module) {
        let base_vtable: Vec<VtableSlot> = module.types()[idx]
            .base_type
            .as_deref()
            .and_then(|b| module.type_by_name(b))
            .map(|t| t.vtable.clone())
            .unwrap_or_default();

        let ty = &mut module.types_mut()[idx];
        if !ty.vtable.is_empty() {
            continue; // interface proxies arrive with their slots
        }
        let mut vtable = base_vtable;
        for m in &ty.methods {
            if !m.is_virtual {
                continue;
            }
            let arg_count = m.il_params.len();
            let existing = if m.is_newslot {
                None
            } else {
                vtable
                    .iter_mut()
                    .find(|s| s.il_name == m.il_name && s.arg_count == arg_count)
            };
            match existing {
                Some(slot) => slot.cpp_name = m.cpp_name.clone(),
                None => {
                    let slot = vtable.len();
                    vtable.push(VtableSlot {
                        slot,
                        il_name: m.il_name.clone(),
                        cpp_name: m.cpp_name.clone(),
                        arg_count,
                    });
                }
            }
        }
        ty.vtable = vtable;
    }
}

fn needs_body(ty: &IRType, method: &IRMethod) -> bool {
    !ty.is_interface()
        && !ty.flags.contains(TypeFlags::RUNTIME_PROVIDED)
        && !method.is_abstract
        && !method.has_icall_mapping
        && method.pinvoke.is_none()
}

/// Method-parallel body lowering. Each worker owns its stack, temps and
/// region state; module-level pools are serialized behind the shared
/// mutexes and drained back into the module afterwards.
pub fn lower_bodies(
    module: &mut IRModule,
    source: &Module,
    resolver: &TypeResolver,
    options: &CompilerOptions,
    sink: &DiagnosticSink,
) {
    let pools = SharedPools::default();

    let work: Vec<(usize, usize)> = module
        .types()
        .iter()
        .enumerate()
        .flat_map(|(ti, ty)| {
            ty.methods
                .iter()
                .enumerate()
                .filter(|(_, m)| needs_body(ty, m))
                .map(move |(mi, _)| (ti, mi))
        })
        .collect();

    let results: Vec<((usize, usize), crate::lowering::LoweredBody)> = {
        let module_ref = &*module;
        work.par_iter()
            .filter_map(|&(ti, mi)| {
                let ty = &module_ref.types()[ti];
                let shell = &ty.methods[mi];
                let src_ty = source.get_type(&ty.il_name)?;
                let ctx = generic_context(src_ty);
                // Overloads share a name and often an arity; the
                // substituted parameter list is the identity.
                let src_m: &MethodInfo = src_ty.methods.iter().find(|m| {
                    m.name == shell.il_name
                        && m.params.len() == shell.il_params.len()
                        && m.params.iter().zip(&shell.il_params).all(|(p, il)| {
                            substitute_generic_params(&p.param_type, &ctx) == *il
                        })
                })?;
                if !src_m.has_body() {
                    return None;
                }
                let mut local_resolver = resolver.clone();
                local_resolver.set_generic_context(ctx);
                let body = lower_method_body(
                    source,
                    module_ref,
                    &local_resolver,
                    &pools,
                    options,
                    sink,
                    shell,
                    src_m,
                );
                Some(((ti, mi), body))
            })
            .collect()
    };

    for ((ti, mi), body) in results {
        let method = &mut module.types_mut()[ti].methods[mi];
        method.blocks[0].instructions = body.instructions;
        method.temp_var_types.extend(body.temp_var_types);
    }

    module.string_pool = pools.strings.into_inner();
    module.array_inits = pools.array_inits.into_inner();
    module.method_instantiations = pools.instantiations.into_inner();
    for prim in pools.primitive_type_infos.into_inner() {
        module.register_primitive_type_info(&prim);
    }
    for (declaring, name, arity) in pools.icall_flagged.into_inner() {
        if let Some(ty) = module.type_by_name_mut(&declaring) {
            for m in &mut ty.methods {
                if m.il_name == name && m.il_params.len() == arity {
                    m.has_icall_mapping = true;
                }
            }
        }
    }
}

/// Renames colliding overloads by appending the IL parameter suffix and
/// records every rename for the fix-up pass. Running it twice is a
/// no-op: renamed methods no longer collide.
pub fn disambiguate_overloads(module: &mut IRModule) {
    let mut renames: HashMap<String, String> = HashMap::new();
    for ty in module.types_mut().iter_mut() {
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, m) in ty.methods.iter().enumerate() {
            groups.entry(m.cpp_name.clone()).or_default().push(i);
        }
        for (name, idxs) in groups {
            if idxs.len() < 2 {
                continue;
            }
            for i in idxs {
                let m = &mut ty.methods[i];
                let suffix = disambig_suffix(&m.il_params);
                let renamed = if suffix.is_empty() {
                    format!("{}_0", name)
                } else {
                    format!("{}_{}", name, suffix)
                };
                renames.insert(disambig_key(&name, &m.il_params), renamed.clone());
                m.cpp_name = renamed;
            }
        }
        // Vtable slots follow their methods' final names.
        let lookup: Vec<(String, usize, String)> = ty
            .methods
            .iter()
            .map(|m| (m.il_name.clone(), m.il_params.len(), m.cpp_name.clone()))
            .collect();
        for slot in &mut ty.vtable {
            if let Some((_, _, cpp)) = lookup
                .iter()
                .find(|(il, argc, _)| *il == slot.il_name && *argc == slot.arg_count)
            {
                slot.cpp_name = cpp.clone();
            }
        }
    }
    module.disambiguated_methods.extend(renames);
}

/// Rewrites deferred calls through the disambiguation map. A deferred
/// key that matches neither the map nor a surviving method name is an
/// invariant violation and fails the build.
pub fn fix_up_deferred_calls(module: &mut IRModule) -> Result<(), CompileError> {
    let map = module.disambiguated_methods.clone();
    let known: HashSet<String> = module
        .types()
        .iter()
        .flat_map(|t| t.methods.iter().map(|m| m.cpp_name.clone()))
        .collect();

    for ty in module.types_mut().iter_mut() {
        for method in &mut ty.methods {
            for block in &mut method.blocks {
                for inst in &mut block.instructions {
                    if let InstKind::Call {
                        function_name,
                        deferred_disambig_key,
                        ..
                    } = &mut inst.kind
                    {
                        if deferred_disambig_key.is_empty() {
                            continue;
                        }
                        if let Some(renamed) = map.get(deferred_disambig_key.as_str()) {
                            *function_name = renamed.clone();
                            deferred_disambig_key.clear();
                        } else if known.contains(function_name.as_str()) {
                            deferred_disambig_key.clear();
                        } else {
                            return Err(CompileError::UnresolvedOverload {
                                function: function_name.clone(),
                                key: deferred_disambig_key.clone(),
                            });
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Structural invariants checked before the module is handed to the
/// backend: every branch lands on a label, no deferred keys survive.
pub fn verify(module: &IRModule) -> Result<(), CompileError> {
    for ty in module.types() {
        for method in &ty.methods {
            let labels: HashSet<&str> = method
                .instructions()
                .filter_map(|i| match &i.kind {
                    InstKind::Label { name } => Some(name.as_str()),
                    _ => None,
                })
                .collect();
            for inst in method.instructions() {
                let targets: Vec<&str> = match &inst.kind {
                    InstKind::Branch { target } => vec![target.as_str()],
                    InstKind::ConditionalBranch { true_label, .. } => vec![true_label.as_str()],
                    InstKind::Switch { cases, .. } => {
                        cases.iter().map(String::as_str).collect()
                    }
                    InstKind::Call {
                        function_name,
                        deferred_disambig_key,
                        ..
                    } => {
                        if !deferred_disambig_key.is_empty() {
                            return Err(CompileError::UnresolvedOverload {
                                function: function_name.clone(),
                                key: deferred_disambig_key.clone(),
                            });
                        }
                        vec![]
                    }
                    _ => vec![],
                };
                for target in targets {
                    if !labels.contains(target) {
                        return Err(CompileError::MissingBranchTarget {
                            method: method.cpp_name.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::IRInstruction;
    use crate::metadata::{Instruction, MethodAttrs, ParamInfo, TypeAttrs};
    use crate::opcodes::{CilOp, MethodRef};

    fn method_with(name: &str, params: &[&str], body: Vec<CilOp>) -> MethodInfo {
        MethodInfo {
            name: name.into(),
            attrs: MethodAttrs::STATIC,
            params: params
                .iter()
                .enumerate()
                .map(|(i, p)| ParamInfo {
                    name: format!("p{}", i),
                    param_type: (*p).to_string(),
                })
                .collect(),
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

    fn source_with(types: Vec<TypeDef>) -> Module {
        Module {
            name: "m".into(),
            entry_point: None,
            types,
            external_enums: Default::default(),
        }
    }

    fn plain_type(name: &str, methods: Vec<MethodInfo>) -> TypeDef {
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

    fn run_shell_passes(source: &Module) -> (IRModule, TypeResolver, CompilerOptions) {
        let options = CompilerOptions::with_default_runtime_types();
        let resolver = build_resolver(source, &options);
        let reachable = crate::reachability::analyze(source);
        let mut module = build_type_shells(source, &reachable, &options, &resolver);
        add_interface_proxies(&mut module, &resolver);
        build_method_shells(&mut module, source, &reachable, &resolver);
        build_vtables(&mut module);
        (module, resolver, options)
    }

    #[test]
    fn colliding_overloads_are_renamed_uniquely() {
        let source = source_with(vec![plain_type(
            "App.C",
            vec![
                method_with("F", &["System.Int32"], vec![CilOp::Ret]),
                method_with("F", &["System.Single"], vec![CilOp::Ret]),
            ],
        )]);
        let (mut module, _, _) = run_shell_passes(&source);
        disambiguate_overloads(&mut module);

        let ty = module.type_by_name("App.C").unwrap();
        let names: Vec<&str> = ty.methods.iter().map(|m| m.cpp_name.as_str()).collect();
        assert_eq!(names, vec!["App_C_F_System_Int32", "App_C_F_System_Single"]);
        assert_eq!(
            module
                .disambiguated_methods
                .get("App_C_F|System.Int32")
                .map(String::as_str),
            Some("App_C_F_System_Int32")
        );
    }

    #[test]
    fn disambiguation_is_idempotent() {
        let source = source_with(vec![plain_type(
            "App.C",
            vec![
                method_with("F", &["System.Int32"], vec![CilOp::Ret]),
                method_with("F", &["System.Single"], vec![CilOp::Ret]),
            ],
        )]);
        let (mut module, _, _) = run_shell_passes(&source);
        disambiguate_overloads(&mut module);
        let once = module.clone();
        disambiguate_overloads(&mut module);
        assert_eq!(module, once);
    }

    #[test]
    fn fix_up_rewrites_and_clears_matching_keys() {
        let source = source_with(vec![plain_type(
            "App.C",
            vec![
                method_with("F", &["System.Int32"], vec![CilOp::Ret]),
                method_with("F", &["System.Single"], vec![CilOp::Ret]),
                method_with(
                    "Caller",
                    &[],
                    vec![
                        CilOp::LdcI4(1),
                        CilOp::Call(MethodRef {
                            declaring_type: "App.C".into(),
                            name: "F".into(),
                            params: vec!["System.Int32".into()],
                            return_type: "System.Void".into(),
                            has_this: false,
                            generic_args: vec![],
                        }),
                        CilOp::Ret,
                    ],
                ),
            ],
        )]);
        let (mut module, resolver, options) = run_shell_passes(&source);
        let sink = DiagnosticSink::new();
        lower_bodies(&mut module, &source, &resolver, &options, &sink);
        disambiguate_overloads(&mut module);
        fix_up_deferred_calls(&mut module).unwrap();
        verify(&module).unwrap();

        let caller = module
            .type_by_name("App.C")
            .unwrap()
            .methods
            .iter()
            .find(|m| m.il_name == "Caller")
            .unwrap();
        let call = caller
            .instructions()
            .find_map(|i| match &i.kind {
                InstKind::Call { function_name, deferred_disambig_key, .. } => {
                    Some((function_name.clone(), deferred_disambig_key.clone()))
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(call.0, "App_C_F_System_Int32");
        assert!(call.1.is_empty());
    }

    #[test]
    fn unresolved_deferred_key_fails_the_build() {
        let source = source_with(vec![plain_type(
            "App.C",
            vec![method_with("Caller", &[], vec![CilOp::Ret])],
        )]);
        let (mut module, _, _) = run_shell_passes(&source);
        // Hand-plant a deferred call to a method the module never saw.
        let ty = module.type_by_name_mut("App.C").unwrap();
        ty.methods[0].blocks[0].push(IRInstruction::new(InstKind::Call {
            function_name: "App_C_Ghost".into(),
            args: vec![],
            result: None,
            result_type: None,
            deferred_disambig_key: "App_C_Ghost|System.Int32".into(),
        }));
        let err = fix_up_deferred_calls(&mut module).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedOverload { .. }));
    }

    #[test]
    fn verify_rejects_branches_without_labels() {
        let source = source_with(vec![plain_type(
            "App.C",
            vec![method_with("F", &[], vec![CilOp::Ret])],
        )]);
        let (mut module, _, _) = run_shell_passes(&source);
        let ty = module.type_by_name_mut("App.C").unwrap();
        ty.methods[0].blocks[0].push(IRInstruction::new(InstKind::Branch {
            target: "IL_9999".into(),
        }));
        let err = verify(&module).unwrap_err();
        assert!(matches!(err, CompileError::MissingBranchTarget { .. }));
    }

    #[test]
    fn vtables_inherit_override_and_append() {
        let mut base_m = method_with("Speak", &[], vec![CilOp::Ret]);
        base_m.attrs = MethodAttrs::VIRTUAL | MethodAttrs::NEWSLOT;
        let mut derived_override = method_with("Speak", &[], vec![CilOp::Ret]);
        derived_override.attrs = MethodAttrs::VIRTUAL;
        let mut derived_new = method_with("Run", &[], vec![CilOp::Ret]);
        derived_new.attrs = MethodAttrs::VIRTUAL | MethodAttrs::NEWSLOT;

        let mut base = plain_type("App.Base", vec![base_m]);
        base.base_type = None;
        let mut derived = plain_type("App.Derived", vec![derived_override, derived_new]);
        derived.base_type = Some("App.Base".into());

        let source = source_with(vec![derived, base]);
        let (module, _, _) = run_shell_passes(&source);

        let base_ty = module.type_by_name("App.Base").unwrap();
        assert_eq!(base_ty.vtable.len(), 1);
        assert_eq!(base_ty.vtable[0].cpp_name, "App_Base_Speak");

        let derived_ty = module.type_by_name("App.Derived").unwrap();
        assert_eq!(derived_ty.vtable.len(), 2);
        assert_eq!(derived_ty.vtable[0].slot, 0);
        assert_eq!(derived_ty.vtable[0].cpp_name, "App_Derived_Speak");
        assert_eq!(derived_ty.vtable[1].cpp_name, "App_Derived_Run");
    }

    #[test]
    fn icall_mapped_methods_keep_the_flag_and_lose_the_body() {
        // The registry maps Volatile.Read even though this module ships
        // an IL body for it.
        let mut volatile_ty = plain_type(
            "System.Threading.Volatile",
            vec![method_with("Read", &["System.Int64&"], vec![
                CilOp::LdArg(0),
                CilOp::Ret,
            ])],
        );
        volatile_ty.attrs = TypeAttrs::ABSTRACT | TypeAttrs::SEALED;
        let source = source_with(vec![volatile_ty]);
        let (mut module, resolver, options) = run_shell_passes(&source);
        let sink = DiagnosticSink::new();
        lower_bodies(&mut module, &source, &resolver, &options, &sink);

        let method = &module.type_by_name("System.Threading.Volatile").unwrap().methods[0];
        assert!(method.has_icall_mapping);
        assert!(method.blocks[0].instructions.is_empty());
    }

    #[test]
    fn interface_proxies_pull_in_their_parents() {
        let mut ty = plain_type("App.Bag", vec![]);
        ty.interfaces = vec!["System.Collections.Generic.IEnumerable`1<System.Int32>".into()];
        let source = source_with(vec![ty]);
        let (module, _, _) = run_shell_passes(&source);

        assert!(module
            .type_by_name("System.Collections.Generic.IEnumerable`1<System.Int32>")
            .is_some());
        // The parent edge pulled the non-generic IEnumerable in too.
        assert!(module.type_by_name("System.Collections.IEnumerable").is_some());
    }
}
