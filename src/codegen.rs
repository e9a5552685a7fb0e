/// C++ backend
/// Prints a lowered IRModule as one translation unit for the companion
/// runtime
use crate::config::CompilerOptions;
use crate::ir::{IRMethod, IRModule, IRType, InstKind, TypeFlags};
use crate::runtime;

pub struct CppCodegen<'a> {
    options: &'a CompilerOptions,
}

enum Region {
    Open,
    Catch,
    Filter,
    Finally,
}

impl<'a> CppCodegen<'a> {
    pub fn new(options: &'a CompilerOptions) -> Self {
        Self { options }
    }

    /// Emits the whole module: prelude, pools, type declarations,
    /// TypeInfo definitions, prototypes, method bodies, entry point.
    pub fn generate(&self, module: &IRModule, entry: Option<&str>) -> String {
        let mut out = String::new();
        out.push_str(runtime::prelude());
        out.push_str(&format!("\n// module: {}\n\n", module.name));

        self.emit_string_pool(module, &mut out);
        self.emit_blob_pool(module, &mut out);
        self.emit_forward_decls(module, &mut out);
        self.emit_type_decls(module, &mut out);
        self.emit_type_infos(module, &mut out);
        self.emit_static_fields(module, &mut out);
        self.emit_prototypes(module, &mut out);

        for ty in module.types() {
            if self.skip_type_bodies(ty) {
                continue;
            }
            for method in &ty.methods {
                if self.skip_method_body(method) {
                    continue;
                }
                self.emit_method(ty, method, &mut out);
            }
        }

        if let Some(entry) = entry {
            self.emit_entry_point(module, entry, &mut out);
        }
        out
    }

    fn skip_type_bodies(&self, ty: &IRType) -> bool {
        ty.is_interface() || ty.flags.contains(TypeFlags::RUNTIME_PROVIDED)
    }

    fn skip_method_body(&self, method: &IRMethod) -> bool {
        method.is_abstract || method.has_icall_mapping
    }

    fn emit_string_pool(&self, module: &IRModule, out: &mut String) {
        for (id, literal) in module.string_pool.iter() {
            out.push_str(&format!(
                "static cil2cpp::StringLiteral __str_{}{{u\"{}\", {}}};\n",
                id,
                runtime::escape_utf16_literal(literal),
                runtime::utf16_len(literal)
            ));
        }
        if !module.string_pool.is_empty() {
            out.push('\n');
        }
    }

    fn emit_blob_pool(&self, module: &IRModule, out: &mut String) {
        for (id, bytes) in module.array_inits.iter() {
            let body: Vec<String> = bytes.iter().map(|b| b.to_string()).collect();
            out.push_str(&format!(
                "static const uint8_t __blob_{}[] = {{{}}};\n",
                id,
                body.join(", ")
            ));
        }
    }

    fn declared_in_unit(&self, ty: &IRType) -> bool {
        !ty.flags.contains(TypeFlags::RUNTIME_PROVIDED) && !ty.is_interface()
    }

    fn emit_forward_decls(&self, module: &IRModule, out: &mut String) {
        for ty in module.types() {
            if self.declared_in_unit(ty) && !ty.flags.contains(TypeFlags::ENUM) {
                out.push_str(&format!("struct {};\n", ty.cpp_name));
            }
        }
        out.push('\n');
    }

    fn base_cpp(&self, module: &IRModule, ty: &IRType) -> String {
        match ty.base_type.as_deref() {
            Some(base) => match module.type_by_name(base) {
                Some(b) => b.cpp_name.clone(),
                None if self.options.is_runtime_provided(base) => {
                    crate::mangle::short_class_name(base)
                }
                None => "Object".to_string(),
            },
            None => "Object".to_string(),
        }
    }

    fn emit_type_decls(&self, module: &IRModule, out: &mut String) {
        let mut last_namespace = String::new();
        for ty in module.types() {
            if !self.declared_in_unit(ty) {
                continue;
            }
            if ty.namespace != last_namespace {
                out.push_str(&format!("// namespace {}\n", ty.namespace));
                last_namespace = ty.namespace.clone();
            }
            if ty.flags.contains(TypeFlags::ENUM) {
                let underlying = ty.enum_underlying.as_deref().unwrap_or("int32_t");
                out.push_str(&format!("using {} = {};\n", ty.cpp_name, underlying));
                continue;
            }
            if ty.is_value_type() {
                out.push_str(&format!("struct {} {{\n", ty.cpp_name));
            } else {
                out.push_str(&format!(
                    "struct {} : {} {{\n",
                    ty.cpp_name,
                    self.base_cpp(module, ty)
                ));
            }
            for field in &ty.fields {
                if field.is_static {
                    continue;
                }
                out.push_str(&format!("    {} {}{{}};\n", field.cpp_type, field.cpp_name));
            }
            out.push_str("};\n");
        }
        out.push('\n');
    }

    fn emit_type_infos(&self, module: &IRModule, out: &mut String) {
        out.push_str("extern TypeInfo Array_TypeInfo;\n");
        for prim in module.primitive_type_infos() {
            out.push_str(&format!(
                "extern TypeInfo {};\n",
                runtime::type_info_symbol(&crate::mangle::mangle_type_name(prim))
            ));
        }
        for ty in module.types() {
            let sym = runtime::type_info_symbol(&ty.cpp_name);
            if ty.flags.contains(TypeFlags::RUNTIME_PROVIDED) {
                out.push_str(&format!("extern TypeInfo {};\n", sym));
            } else {
                out.push_str(&format!("TypeInfo {}{{\"{}\"}};\n", sym, ty.il_name));
            }
        }
        out.push('\n');
    }

    fn emit_static_fields(&self, module: &IRModule, out: &mut String) {
        for ty in module.types() {
            if !self.declared_in_unit(ty) {
                continue;
            }
            for field in &ty.fields {
                if field.is_static {
                    out.push_str(&format!(
                        "{} {}_{}{{}};\n",
                        field.cpp_type, ty.cpp_name, field.cpp_name
                    ));
                }
            }
        }
        out.push('\n');
    }

    fn signature(&self, method: &IRMethod) -> String {
        let params: Vec<String> = method
            .params
            .iter()
            .map(|p| format!("{} {}", p.cpp_type, p.name))
            .collect();
        format!(
            "{} {}({})",
            method.return_type,
            method.cpp_name,
            params.join(", ")
        )
    }

    fn emit_prototypes(&self, module: &IRModule, out: &mut String) {
        for ty in module.types() {
            if self.skip_type_bodies(ty) {
                continue;
            }
            for method in &ty.methods {
                if self.skip_method_body(method) {
                    continue;
                }
                out.push_str(&format!("{};\n", self.signature(method)));
            }
        }
        out.push('\n');
    }

    fn emit_method(&self, ty: &IRType, method: &IRMethod, out: &mut String) {
        out.push_str(&format!("// {}::{}\n", method.declaring_type, method.il_name));
        for o in &method.overrides {
            out.push_str(&format!(
                "// explicit override of {}::{}\n",
                o.interface_type, o.method_name
            ));
        }
        out.push_str(&format!("{} {{\n", self.signature(method)));

        if let Some(pinvoke) = &method.pinvoke {
            self.emit_pinvoke_body(method, pinvoke, out);
            out.push_str("}\n\n");
            return;
        }
        if method.blocks.iter().all(|b| b.instructions.is_empty()) {
            if self.is_delegate_type_name(ty) && method.il_name == "Invoke" {
                self.emit_delegate_invoke_body(method, out);
            } else if method.return_type != "void" {
                out.push_str(&format!("    return {}{{}};\n", method.return_type));
            }
            out.push_str("}\n\n");
            return;
        }

        // Temporaries that live across scope boundaries are declared at
        // function scope, in name order for stable output.
        let mut temps: Vec<(&String, &String)> = method.temp_var_types.iter().collect();
        temps.sort();
        for (name, ty) in temps {
            out.push_str(&format!("    {} {}{{}};\n", ty, name));
        }
        let has_finally = method
            .instructions()
            .any(|i| matches!(i.kind, InstKind::FinallyBegin));
        if has_finally {
            out.push_str("    std::exception_ptr __finally_pending;\n");
        }

        let mut regions: Vec<Region> = Vec::new();
        for block in &method.blocks {
            if method.blocks.len() > 1 {
                out.push_str(&format!("    // block {}\n", block.id));
            }
            for inst in &block.instructions {
                if let Some(loc) = &inst.loc {
                    if self.options.emit_line_directives {
                        out.push_str(&format!("#line {} \"{}\"\n", loc.line, loc.file));
                    } else {
                        out.push_str(&format!(
                            "    // {}:{}:{} IL_{:04x}\n",
                            loc.file, loc.line, loc.column, loc.il_offset
                        ));
                    }
                }
                self.emit_inst(method, &inst.kind, &mut regions, out);
            }
        }
        out.push_str("}\n\n");
    }

    fn is_delegate_type_name(&self, ty: &IRType) -> bool {
        ty.base_type
            .as_deref()
            .is_some_and(|b| b == "System.MulticastDelegate" || b == "System.Delegate")
    }

    fn emit_pinvoke_body(
        &self,
        method: &IRMethod,
        pinvoke: &crate::metadata::PInvokeInfo,
        out: &mut String,
    ) {
        let tys: Vec<String> = method.params.iter().map(|p| p.cpp_type.clone()).collect();
        let args: Vec<String> = method.params.iter().map(|p| p.name.clone()).collect();
        let cc = if pinvoke.calling_convention.is_empty() {
            String::new()
        } else {
            format!(" ({})", pinvoke.calling_convention)
        };
        out.push_str(&format!(
            "    // pinvoke {}!{}{}\n",
            pinvoke.module, pinvoke.entry_point, cc
        ));
        out.push_str(&format!(
            "    extern \"C\" {} {}({});\n",
            method.return_type,
            pinvoke.entry_point,
            tys.join(", ")
        ));
        if method.return_type == "void" {
            out.push_str(&format!("    {}({});\n", pinvoke.entry_point, args.join(", ")));
        } else {
            out.push_str(&format!(
                "    return {}({});\n",
                pinvoke.entry_point,
                args.join(", ")
            ));
        }
    }

    fn emit_delegate_invoke_body(&self, method: &IRMethod, out: &mut String) {
        let mut cast_tys = vec!["Object*".to_string()];
        cast_tys.extend(method.params.iter().skip(1).map(|p| p.cpp_type.clone()));
        let mut args = vec!["cil2cpp::delegate_self((Delegate*)__this)".to_string()];
        args.extend(method.params.iter().skip(1).map(|p| p.name.clone()));
        out.push_str(&format!(
            "    auto __fn = ({} (*)({}))cil2cpp::delegate_target((Delegate*)__this);\n",
            method.return_type,
            cast_tys.join(", ")
        ));
        if method.return_type == "void" {
            out.push_str(&format!("    __fn({});\n", args.join(", ")));
        } else {
            out.push_str(&format!("    return __fn({});\n", args.join(", ")));
        }
    }

    /// Assigns into a function-scope temporary or declares an inline one.
    fn store_result(
        &self,
        method: &IRMethod,
        result: &str,
        result_type: Option<&str>,
        rhs: &str,
        out: &mut String,
    ) {
        if method.temp_var_types.contains_key(result) {
            out.push_str(&format!("    {} = {};\n", result, rhs));
        } else {
            let ty = result_type.unwrap_or("auto");
            out.push_str(&format!("    {} {} = {};\n", ty, result, rhs));
        }
    }

    fn emit_inst(
        &self,
        method: &IRMethod,
        kind: &InstKind,
        regions: &mut Vec<Region>,
        out: &mut String,
    ) {
        match kind {
            InstKind::Assign { target, value } => {
                out.push_str(&format!("    {} = {};\n", target, value));
            }
            InstKind::Label { name } => {
                out.push_str(&format!("{}:;\n", name));
            }
            InstKind::Branch { target } => {
                out.push_str(&format!("    goto {};\n", target));
            }
            InstKind::ConditionalBranch { cond, true_label } => {
                out.push_str(&format!("    if ({}) goto {};\n", cond, true_label));
            }
            InstKind::Switch { value, cases } => {
                out.push_str(&format!("    switch ({}) {{\n", value));
                for (i, label) in cases.iter().enumerate() {
                    out.push_str(&format!("    case {}: goto {};\n", i, label));
                }
                out.push_str("    default: break;\n    }\n");
            }
            InstKind::Return { value } => match value {
                Some(v) => out.push_str(&format!("    return {};\n", v)),
                None => out.push_str("    return;\n"),
            },
            InstKind::Throw { expr } => {
                out.push_str(&format!(
                    "    cil2cpp::throw_exception((Object*)({}));\n",
                    expr
                ));
            }
            InstKind::Rethrow => {
                out.push_str("    throw;\n");
            }
            InstKind::TryBegin => {
                regions.push(Region::Open);
                out.push_str("    try {\n");
            }
            InstKind::CatchBegin { exc_type } => {
                if let Some(top) = regions.last_mut() {
                    *top = Region::Catch;
                }
                match exc_type {
                    Some(ty) => {
                        let base = ty.trim_end_matches('*');
                        out.push_str("    } catch (Object* __exc_obj) {\n");
                        out.push_str(&format!(
                            "    if (!cil2cpp::exception_matches(__exc_obj, &{})) {{ throw; }}\n",
                            runtime::type_info_symbol(base)
                        ));
                        out.push_str(&format!("    {} __exc = ({})__exc_obj;\n", ty, ty));
                    }
                    None => out.push_str("    } catch (Object* __exc) {\n"),
                }
            }
            InstKind::FilterBegin => {
                if let Some(top) = regions.last_mut() {
                    *top = Region::Filter;
                }
                out.push_str("    } catch (Object* __exc) {\n");
                out.push_str("    int32_t __filter_result = 0;\n");
            }
            InstKind::EndFilter => {
                out.push_str("    if (__filter_result == 0) { throw; }\n");
            }
            InstKind::FilterHandlerBegin => {}
            InstKind::FinallyBegin => {
                if let Some(top) = regions.last_mut() {
                    *top = Region::Finally;
                }
                out.push_str(
                    "    } catch (...) { __finally_pending = std::current_exception(); }\n    {\n",
                );
            }
            InstKind::TryEnd => {
                let region = regions.pop().unwrap_or(Region::Open);
                out.push_str("    }\n");
                if matches!(region, Region::Finally) {
                    out.push_str(
                        "    if (__finally_pending) { auto __e = __finally_pending; __finally_pending = nullptr; std::rethrow_exception(__e); }\n",
                    );
                }
            }

            InstKind::BinaryOp { op, a, b, result, result_type } => {
                self.store_result(
                    method,
                    result,
                    result_type.as_deref(),
                    &format!("{} {} {}", a, op, b),
                    out,
                );
            }
            InstKind::UnaryOp { op, x, result, result_type } => {
                self.store_result(
                    method,
                    result,
                    result_type.as_deref(),
                    &format!("{}({})", op, x),
                    out,
                );
            }
            InstKind::Conversion { src, target_type, result } => {
                self.store_result(
                    method,
                    result,
                    Some(target_type),
                    &format!("({})({})", target_type, src),
                    out,
                );
            }
            InstKind::Cast { src, target_type, result, safe, type_info_name } => {
                let rhs = match (safe, type_info_name) {
                    (true, Some(info)) => {
                        format!("({})cil2cpp::is_inst((Object*)({}), {})", target_type, src, info)
                    }
                    (false, Some(info)) => {
                        format!("({})cil2cpp::cast_class((Object*)({}), {})", target_type, src, info)
                    }
                    _ => format!("({})({})", target_type, src),
                };
                self.store_result(method, result, Some(target_type), &rhs, out);
            }

            InstKind::FieldAccess {
                object,
                field,
                is_store,
                store_value,
                is_value_access,
                cast_to_type,
                result,
                result_type,
            } => {
                let obj = match cast_to_type {
                    Some(cast) => format!("(({})({}))", cast, object),
                    None => object.clone(),
                };
                let sep = if *is_value_access { "." } else { "->" };
                let lvalue = format!("{}{}{}", obj, sep, field);
                if *is_store {
                    let value = store_value.as_deref().unwrap_or("0");
                    out.push_str(&format!("    {} = {};\n", lvalue, value));
                } else if let Some(result) = result {
                    self.store_result(method, result, result_type.as_deref(), &lvalue, out);
                }
            }
            InstKind::StaticFieldAccess { field, is_store, store_value, result, result_type } => {
                if *is_store {
                    let value = store_value.as_deref().unwrap_or("0");
                    out.push_str(&format!("    {} = {};\n", field, value));
                } else if let Some(result) = result {
                    self.store_result(method, result, result_type.as_deref(), field, out);
                }
            }
            InstKind::ArrayAccess {
                array,
                index,
                element_type,
                is_store,
                store_value,
                result,
            } => {
                let lvalue = format!(
                    "(({}*)cil2cpp::array_data({}))[{}]",
                    element_type, array, index
                );
                if *is_store {
                    let value = store_value.as_deref().unwrap_or("0");
                    out.push_str(&format!("    {} = {};\n", lvalue, value));
                } else if let Some(result) = result {
                    self.store_result(method, result, Some(element_type), &lvalue, out);
                }
            }

            InstKind::Box { value, value_type, type_info_name, result } => {
                let info = type_info_name.as_deref().unwrap_or("nullptr");
                self.store_result(
                    method,
                    result,
                    Some("Object*"),
                    &format!("cil2cpp::box<{}>({}, {})", value_type, value, info),
                    out,
                );
            }
            InstKind::Unbox { object, value_type, result, is_unbox_any, result_type } => {
                let rhs = if *is_unbox_any {
                    format!("*({}*)cil2cpp::unbox({})", value_type, object)
                } else {
                    format!("({}*)cil2cpp::unbox({})", value_type, object)
                };
                self.store_result(method, result, result_type.as_deref(), &rhs, out);
            }
            InstKind::InitObj { address, type_name, is_reference_type } => {
                if *is_reference_type {
                    out.push_str(&format!(
                        "    *({}*)({}) = nullptr;\n",
                        type_name, address
                    ));
                } else {
                    out.push_str(&format!(
                        "    *({}*)({}) = {}{{}};\n",
                        type_name, address, type_name
                    ));
                }
            }
            InstKind::NewObj { ctor_name, args, result, result_type } => {
                let ty = result_type.as_deref().unwrap_or("Object*");
                if let Some(base) = ty.strip_suffix('*') {
                    self.store_result(
                        method,
                        result,
                        Some(ty),
                        &format!(
                            "({})cil2cpp::object_new(&{})",
                            ty,
                            runtime::type_info_symbol(base)
                        ),
                        out,
                    );
                    let mut all = vec![result.clone()];
                    all.extend(args.iter().cloned());
                    out.push_str(&format!("    {}({});\n", ctor_name, all.join(", ")));
                } else {
                    // Value-type construction in place.
                    let mut all = vec![format!("&{}", result)];
                    all.extend(args.iter().cloned());
                    out.push_str(&format!("    {}({});\n", ctor_name, all.join(", ")));
                }
            }

            InstKind::Call { function_name, args, result, result_type, .. } => {
                let call = format!("{}({})", function_name, args.join(", "));
                match result {
                    Some(result) => {
                        self.store_result(method, result, result_type.as_deref(), &call, out)
                    }
                    None => out.push_str(&format!("    {};\n", call)),
                }
            }
            InstKind::LoadFunctionPointer { method_name, result, is_virtual, object, vtable_slot } => {
                let rhs = match (is_virtual, object, vtable_slot) {
                    (true, Some(obj), Some(slot)) => {
                        format!("cil2cpp::vtable_entry({}, {})", obj, slot)
                    }
                    _ => format!("(void*)&{}", method_name),
                };
                self.store_result(method, result, Some("void*"), &rhs, out);
            }
            InstKind::DelegateCreate { delegate_type, object, method_name, result } => {
                self.store_result(
                    method,
                    result,
                    Some(&format!("{}*", delegate_type)),
                    &format!(
                        "({}*)cil2cpp::delegate_create(&{}, (Object*)({}), {})",
                        delegate_type,
                        runtime::type_info_symbol(delegate_type),
                        object,
                        method_name
                    ),
                    out,
                );
            }
            InstKind::DelegateInvoke { delegate, args, result, result_type } => {
                let mut all = vec![format!("(Delegate*)({})", delegate)];
                all.extend(args.iter().cloned());
                let call = format!("cil2cpp::delegate_invoke({})", all.join(", "));
                match result {
                    Some(result) => {
                        self.store_result(method, result, result_type.as_deref(), &call, out)
                    }
                    None => out.push_str(&format!("    {};\n", call)),
                }
            }
            InstKind::DeclareLocal { name, ty } => {
                out.push_str(&format!("    {} {}{{}};\n", ty, name));
            }
            InstKind::Comment { text } => {
                out.push_str(&format!("    // {}\n", text));
            }
            InstKind::RawCpp { code, result, result_type } => match result {
                Some(result) => {
                    self.store_result(method, result, result_type.as_deref(), code, out)
                }
                None => out.push_str(&format!("    {}\n", code)),
            },
        }
    }

    fn emit_entry_point(&self, module: &IRModule, entry: &str, out: &mut String) {
        out.push_str("int main(int argc, char** argv) {\n");
        out.push_str("    cil2cpp::runtime_init(argc, argv);\n");
        for ty in module.types() {
            for method in &ty.methods {
                if method.il_name == ".cctor" && !method.has_icall_mapping {
                    out.push_str(&format!("    {}();\n", method.cpp_name));
                }
            }
        }
        out.push_str(&format!("    {}();\n", entry));
        out.push_str("    cil2cpp::runtime_shutdown();\n    return 0;\n}\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::DiagnosticSink;
    use crate::metadata::{
        Instruction, MethodAttrs, MethodInfo, Module, TypeDef,
    };
    use crate::opcodes::{CilOp, MethodRef};
    use crate::passes;

    fn tiny_module() -> Module {
        Module {
            name: "app".into(),
            entry_point: Some(MethodRef {
                declaring_type: "App.Program".into(),
                name: "Main".into(),
                params: vec![],
                return_type: "System.Void".into(),
                has_this: false,
                generic_args: vec![],
            }),
            types: vec![TypeDef {
                full_name: "App.Program".into(),
                namespace: "App".into(),
                attrs: Default::default(),
                base_type: Some("System.Object".into()),
                interfaces: vec![],
                fields: vec![],
                methods: vec![MethodInfo {
                    name: "Main".into(),
                    attrs: MethodAttrs::STATIC,
                    params: vec![],
                    return_type: "System.Void".into(),
                    locals: vec![],
                    body: vec![
                        Instruction { offset: 0, op: CilOp::LdStr("hello".into()) },
                        Instruction { offset: 5, op: CilOp::Pop },
                        Instruction { offset: 6, op: CilOp::Ret },
                    ],
                    handlers: vec![],
                    sequence_points: vec![],
                    pinvoke: None,
                    generic_params: vec![],
                    overrides: vec![],
                }],
                enum_underlying: None,
                generic_params: vec![],
            }],
            external_enums: Default::default(),
        }
    }

    #[test]
    fn generates_a_coherent_translation_unit() {
        let source = tiny_module();
        let options = crate::config::CompilerOptions::with_default_runtime_types();
        let resolver = passes::build_resolver(&source, &options);
        let reachable = crate::reachability::analyze(&source);
        let mut module = passes::build_type_shells(&source, &reachable, &options, &resolver);
        passes::add_interface_proxies(&mut module, &resolver);
        passes::build_method_shells(&mut module, &source, &reachable, &resolver);
        passes::build_vtables(&mut module);
        let sink = DiagnosticSink::new();
        passes::lower_bodies(&mut module, &source, &resolver, &options, &sink);
        passes::disambiguate_overloads(&mut module);
        passes::fix_up_deferred_calls(&mut module).unwrap();
        passes::verify(&module).unwrap();

        let text = CppCodegen::new(&options).generate(&module, Some("App_Program_Main"));
        assert!(text.contains("#include \"cil2cpp_runtime.h\""));
        assert!(text.contains("static cil2cpp::StringLiteral __str_0{u\"hello\", 5};"));
        assert!(text.contains("void App_Program_Main()"));
        assert!(text.contains("TypeInfo App_Program_TypeInfo{\"App.Program\"};"));
        assert!(text.contains("int main(int argc, char** argv)"));
        assert!(text.contains("App_Program_Main();"));
    }

    #[test]
    fn labels_and_gotos_print_as_cpp() {
        let source = {
            let mut m = tiny_module();
            m.types[0].methods[0].body = vec![
                Instruction { offset: 0, op: CilOp::BrS(2) },
                Instruction { offset: 2, op: CilOp::Ret },
            ];
            m
        };
        let options = crate::config::CompilerOptions::with_default_runtime_types();
        let resolver = passes::build_resolver(&source, &options);
        let reachable = crate::reachability::analyze(&source);
        let mut module = passes::build_type_shells(&source, &reachable, &options, &resolver);
        passes::build_method_shells(&mut module, &source, &reachable, &resolver);
        passes::build_vtables(&mut module);
        let sink = DiagnosticSink::new();
        passes::lower_bodies(&mut module, &source, &resolver, &options, &sink);
        let text = CppCodegen::new(&options).generate(&module, None);
        assert!(text.contains("goto IL_0002;"));
        assert!(text.contains("IL_0002:;"));
    }
}
