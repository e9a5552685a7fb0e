/// Name mangling and type resolution
/// Rewrites IL type/method names into C++ identifiers and maps IL
/// signatures onto C++ types
use hashbrown::{HashMap, HashSet};

/// Fixed mapping from IL primitive full names to C++ fixed-width types.
pub fn cpp_primitive(il_name: &str) -> Option<&'static str> {
    Some(match il_name {
        "System.Void" => "void",
        "System.Boolean" => "bool",
        "System.Char" => "char16_t",
        "System.SByte" => "int8_t",
        "System.Byte" => "uint8_t",
        "System.Int16" => "int16_t",
        "System.UInt16" => "uint16_t",
        "System.Int32" => "int32_t",
        "System.UInt32" => "uint32_t",
        "System.Int64" => "int64_t",
        "System.UInt64" => "uint64_t",
        "System.Single" => "float",
        "System.Double" => "double",
        "System.IntPtr" => "intptr_t",
        "System.UIntPtr" => "uintptr_t",
        _ => return None,
    })
}

pub fn is_primitive(il_name: &str) -> bool {
    cpp_primitive(il_name).is_some()
}

/// Splits `Open`N<A,B<C,D>>` into the open name and its top-level type
/// arguments. Returns None when the name is not a generic instance.
pub fn split_generic_instance(il_name: &str) -> Option<(String, Vec<String>)> {
    let open_end = il_name.find('<')?;
    if !il_name.ends_with('>') {
        return None;
    }
    let open = il_name[..open_end].to_string();
    let body = &il_name[open_end + 1..il_name.len() - 1];

    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in body.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(body[start..i].trim().to_string());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = body[start..].trim();
    if !last.is_empty() {
        args.push(last.to_string());
    }
    Some((open, args))
}

/// Rewrites one name component into the C++ identifier space.
pub fn sanitize_identifier(name: &str) -> String {
    sanitize(name)
}

fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => out.push(c),
            '.' | '/' | '`' | '+' => out.push('_'),
            '&' => out.push_str("Ref"),
            '*' => out.push_str("Ptr"),
            ' ' => {}
            _ => out.push('_'),
        }
    }
    out
}

/// Mangles an IL type full name into a C++ identifier. Handles nested
/// types (`/`), generic arity markers (`` ` ``) and closed generic
/// instances (angle brackets with nested commas). Idempotent on names
/// already in the identifier space.
pub fn mangle_type_name(il_name: &str) -> String {
    let name = il_name.trim();
    let name = name.strip_suffix('&').unwrap_or(name);
    let name = name.strip_suffix('*').unwrap_or(name);

    if let Some(elem) = name.strip_suffix("[]") {
        return format!("{}_Array", mangle_type_name(elem));
    }
    if let Some((open, args)) = split_generic_instance(name) {
        return mangle_generic_instance(&open, &args);
    }
    sanitize(name)
}

/// Mangles a closed generic instance from its open name and argument
/// list, producing the monomorphized symbol.
pub fn mangle_generic_instance(open_name: &str, args: &[String]) -> String {
    let mut out = sanitize(open_name);
    for arg in args {
        out.push('_');
        out.push_str(&mangle_type_name(arg));
    }
    out
}

const RETURN_OVERLOADED_OPS: &[&str] = &[
    "op_Implicit",
    "op_Explicit",
    "op_CheckedImplicit",
    "op_CheckedExplicit",
];

/// Composes the mangled method symbol. Conversion operators are
/// return-type overloaded in IL, which C++ cannot express, so they get a
/// return-type suffix.
pub fn mangle_method_name(type_cpp: &str, method_name: &str, return_type_il: &str) -> String {
    let base = sanitize(method_name);
    if RETURN_OVERLOADED_OPS.contains(&method_name) {
        format!("{}_{}_ret_{}", type_cpp, base, mangle_type_name(return_type_il))
    } else {
        format!("{}_{}", type_cpp, base)
    }
}

pub fn mangle_field_name(type_cpp: &str, field_name: &str) -> String {
    format!("{}_{}", type_cpp, sanitize(field_name))
}

/// Suffix appended to colliding overloads, derived from IL parameter
/// types with `*`/`&` rendered as `Ptr`/`Ref`.
pub fn disambig_suffix(il_params: &[String]) -> String {
    il_params
        .iter()
        .map(|p| {
            let mut m = mangle_type_name(p);
            if p.ends_with('&') {
                m.push_str("Ref");
            } else if p.ends_with('*') {
                m.push_str("Ptr");
            }
            m
        })
        .collect::<Vec<_>>()
        .join("_")
}

/// Key under which a call is parked until the disambiguation pass has
/// renamed colliding overloads.
pub fn disambig_key(original_cpp_name: &str, il_params: &[String]) -> String {
    format!("{}|{}", original_cpp_name, il_params.join(","))
}

/// Generic method parameters left unresolved keep their sentinel names
/// and are substituted at specialization time.
pub fn substitute_generic_params(il_sig: &str, map: &HashMap<String, String>) -> String {
    if map.is_empty() {
        return il_sig.to_string();
    }
    let mut out = String::with_capacity(il_sig.len());
    let mut token = String::new();
    let flush = |token: &mut String, out: &mut String| {
        if token.is_empty() {
            return;
        }
        match map.get(token.as_str()) {
            Some(subst) => out.push_str(subst),
            None => out.push_str(token),
        }
        token.clear();
    };
    for c in il_sig.chars() {
        if c.is_alphanumeric() || c == '_' || c == '.' || c == '`' {
            token.push(c);
        } else {
            flush(&mut token, &mut out);
            out.push(c);
        }
    }
    flush(&mut token, &mut out);
    out
}

/// Resolves IL type names to C++ types for one module. Knows which types
/// are value types or enums, which the runtime provides under bare class
/// names, and the generic instantiation context in effect.
#[derive(Debug, Clone, Default)]
pub struct TypeResolver {
    value_types: HashSet<String>,
    enums: HashMap<String, String>,
    runtime_short: HashSet<String>,
    generic_context: HashMap<String, String>,
}

impl TypeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value_type(&mut self, il_name: &str) {
        self.value_types.insert(il_name.to_string());
    }

    pub fn add_enum(&mut self, il_name: &str, underlying: &str) {
        self.enums.insert(il_name.to_string(), underlying.to_string());
        self.value_types.insert(il_name.to_string());
    }

    pub fn add_runtime_short(&mut self, il_name: &str) {
        self.runtime_short.insert(il_name.to_string());
    }

    pub fn set_generic_context(&mut self, map: HashMap<String, String>) {
        self.generic_context = map;
    }

    pub fn clear_generic_context(&mut self) {
        self.generic_context.clear();
    }

    /// Resolves a signature-position generic parameter against the
    /// enclosing instantiation, or leaves the sentinel name in place.
    pub fn resolve_generic_param<'a>(&'a self, name: &'a str) -> &'a str {
        self.generic_context.get(name).map_or(name, |s| s.as_str())
    }

    pub fn enum_underlying(&self, il_name: &str) -> Option<&str> {
        self.enums.get(il_name).map(|s| s.as_str())
    }

    pub fn is_value_type(&self, il_name: &str) -> bool {
        let name = self.resolve_generic_param(il_name);
        if is_primitive(name) || self.value_types.contains(name) {
            return true;
        }
        // A closed Nullable<T> is always a value type even when the
        // instantiation was never loaded.
        if let Some((open, _)) = split_generic_instance(name) {
            if open == "System.Nullable`1" {
                return true;
            }
            if self.value_types.contains(&open) {
                return true;
            }
        }
        false
    }

    pub fn is_reference_type(&self, il_name: &str) -> bool {
        let name = self.resolve_generic_param(il_name);
        if name.ends_with('&') || name.ends_with('*') {
            return false;
        }
        if name.ends_with("[]") {
            return true;
        }
        !self.is_value_type(name) && !is_generic_sentinel(name)
    }

    /// Maps an IL type name to its C++ spelling: primitives through the
    /// fixed table, value types to `Mangled`, reference types to
    /// `Mangled*`, byrefs and pointers to pointers.
    pub fn cpp_type(&self, il_name: &str) -> String {
        let name = self.resolve_generic_param(il_name.trim());

        if let Some(inner) = name.strip_suffix('&') {
            return format!("{}*", self.cpp_value_spelling(inner));
        }
        if let Some(inner) = name.strip_suffix('*') {
            return format!("{}*", self.cpp_value_spelling(inner));
        }
        if name.ends_with("[]") {
            return "Array*".to_string();
        }
        if let Some(prim) = cpp_primitive(name) {
            return prim.to_string();
        }
        if is_generic_sentinel(name) {
            return name.to_string();
        }
        if self.is_value_type(name) {
            return self.mangled_or_short(name);
        }
        format!("{}*", self.mangled_or_short(name))
    }

    /// Spelling of the pointee for byref/pointer types: a byref to a
    /// value type points at the value, a byref to a reference type points
    /// at the object pointer's storage.
    fn cpp_value_spelling(&self, il_name: &str) -> String {
        let name = self.resolve_generic_param(il_name);
        if let Some(prim) = cpp_primitive(name) {
            return prim.to_string();
        }
        if name.ends_with("[]") {
            return "Array*".to_string();
        }
        if self.is_value_type(name) || is_generic_sentinel(name) {
            self.mangled_or_short(name)
        } else {
            format!("{}*", self.mangled_or_short(name))
        }
    }

    fn mangled_or_short(&self, il_name: &str) -> String {
        if self.runtime_short.contains(il_name) {
            return short_class_name(il_name);
        }
        mangle_type_name(il_name)
    }
}

/// Whether a name is an unresolved generic parameter sentinel (`T`,
/// `TKey`, `TValue`, ...).
pub fn is_generic_sentinel(name: &str) -> bool {
    let mut chars = name.chars();
    if chars.next() != Some('T') {
        return false;
    }
    match chars.next() {
        None => true,
        Some(second) => {
            second.is_ascii_uppercase() && name.chars().all(|c| c.is_alphanumeric())
        }
    }
}

/// Bare class name used for runtime-provided types (`System.Object` ->
/// `Object`).
pub fn short_class_name(il_name: &str) -> String {
    let tail = il_name
        .rsplit(|c| c == '.' || c == '/')
        .next()
        .unwrap_or(il_name);
    sanitize(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangles_plain_and_nested_names() {
        assert_eq!(mangle_type_name("System.Int32"), "System_Int32");
        assert_eq!(mangle_type_name("App.Outer/Inner"), "App_Outer_Inner");
    }

    #[test]
    fn mangles_generic_instances_with_nested_commas() {
        let name = "System.Collections.Generic.Dictionary`2<System.String,System.Collections.Generic.List`1<System.Int32>>";
        assert_eq!(
            mangle_type_name(name),
            "System_Collections_Generic_Dictionary_2_System_String_System_Collections_Generic_List_1_System_Int32"
        );
    }

    #[test]
    fn mangling_is_idempotent_on_identifiers() {
        let once = mangle_type_name("System.Collections.Generic.List`1<System.Int32>");
        assert_eq!(mangle_type_name(&once), once);
    }

    #[test]
    fn conversion_operators_get_return_suffix() {
        assert_eq!(
            mangle_method_name("App_Money", "op_Implicit", "System.Double"),
            "App_Money_op_Implicit_ret_System_Double"
        );
        assert_eq!(mangle_method_name("App_Money", "Add", "System.Double"), "App_Money_Add");
    }

    #[test]
    fn disambig_suffix_marks_byref_and_pointer() {
        let suffix = disambig_suffix(&[
            "System.Int32&".to_string(),
            "System.Byte*".to_string(),
            "System.String".to_string(),
        ]);
        assert_eq!(suffix, "System_Int32Ref_System_BytePtr_System_String");
    }

    #[test]
    fn resolver_maps_primitive_value_and_reference_types() {
        let mut resolver = TypeResolver::new();
        resolver.add_value_type("App.Point");
        resolver.add_runtime_short("System.Object");
        resolver.add_runtime_short("System.String");

        assert_eq!(resolver.cpp_type("System.Int32"), "int32_t");
        assert_eq!(resolver.cpp_type("App.Point"), "App_Point");
        assert_eq!(resolver.cpp_type("App.Widget"), "App_Widget*");
        assert_eq!(resolver.cpp_type("System.Object"), "Object*");
        assert_eq!(resolver.cpp_type("System.String"), "String*");
        assert_eq!(resolver.cpp_type("System.Int32&"), "int32_t*");
        assert_eq!(resolver.cpp_type("System.Byte*"), "uint8_t*");
        assert_eq!(resolver.cpp_type("System.Int32[]"), "Array*");
    }

    #[test]
    fn resolver_substitutes_generic_context() {
        let mut resolver = TypeResolver::new();
        let mut ctx = HashMap::new();
        ctx.insert("T".to_string(), "System.Int32".to_string());
        resolver.set_generic_context(ctx);
        assert_eq!(resolver.cpp_type("T"), "int32_t");
        assert_eq!(resolver.cpp_type("T&"), "int32_t*");
        resolver.clear_generic_context();
        assert_eq!(resolver.cpp_type("T"), "T");
    }

    #[test]
    fn placeholder_substitution_reaches_inside_signatures() {
        let mut map = HashMap::new();
        map.insert("T".to_string(), "System.Int32".to_string());
        assert_eq!(
            substitute_generic_params("System.Collections.Generic.IEnumerator`1<T>", &map),
            "System.Collections.Generic.IEnumerator`1<System.Int32>"
        );
        assert_eq!(substitute_generic_params("T[]", &map), "System.Int32[]");
        assert_eq!(substitute_generic_params("T&", &map), "System.Int32&");
    }

    #[test]
    fn nullable_instances_are_value_types() {
        let resolver = TypeResolver::new();
        assert!(resolver.is_value_type("System.Nullable`1<System.Int32>"));
        assert!(!resolver.is_reference_type("System.Nullable`1<System.Int32>"));
    }
}
