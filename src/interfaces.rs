/// Well-known BCL interface proxies
/// Synthesizes minimal IR types for closed interface forms the module
/// references but never loaded
use hashbrown::HashMap;

use crate::ir::{IRMethod, IRParam, IRType, TypeFlags, VtableSlot};
use crate::mangle::{
    mangle_method_name, mangle_type_name, split_generic_instance, substitute_generic_params,
    TypeResolver,
};

struct ProxyMethod {
    name: &'static str,
    params: &'static [&'static str],
    ret: &'static str,
}

struct ProxyDef {
    open_name: &'static str,
    type_params: &'static [&'static str],
    parents: &'static [&'static str],
    methods: &'static [ProxyMethod],
}

static PROXIES: &[ProxyDef] = &[
    ProxyDef {
        open_name: "System.IDisposable",
        type_params: &[],
        parents: &[],
        methods: &[ProxyMethod { name: "Dispose", params: &[], ret: "System.Void" }],
    },
    ProxyDef {
        open_name: "System.IAsyncDisposable",
        type_params: &[],
        parents: &[],
        methods: &[ProxyMethod {
            name: "DisposeAsync",
            params: &[],
            ret: "System.Threading.Tasks.ValueTask",
        }],
    },
    ProxyDef {
        open_name: "System.ICloneable",
        type_params: &[],
        parents: &[],
        methods: &[ProxyMethod { name: "Clone", params: &[], ret: "System.Object" }],
    },
    ProxyDef {
        open_name: "System.IComparable",
        type_params: &[],
        parents: &[],
        methods: &[ProxyMethod {
            name: "CompareTo",
            params: &["System.Object"],
            ret: "System.Int32",
        }],
    },
    ProxyDef {
        open_name: "System.IComparable`1",
        type_params: &["T"],
        parents: &[],
        methods: &[ProxyMethod { name: "CompareTo", params: &["T"], ret: "System.Int32" }],
    },
    ProxyDef {
        open_name: "System.IEquatable`1",
        type_params: &["T"],
        parents: &[],
        methods: &[ProxyMethod { name: "Equals", params: &["T"], ret: "System.Boolean" }],
    },
    ProxyDef {
        open_name: "System.Collections.IEnumerable",
        type_params: &[],
        parents: &[],
        methods: &[ProxyMethod {
            name: "GetEnumerator",
            params: &[],
            ret: "System.Collections.IEnumerator",
        }],
    },
    ProxyDef {
        open_name: "System.Collections.IEnumerator",
        type_params: &[],
        parents: &[],
        methods: &[
            ProxyMethod { name: "get_Current", params: &[], ret: "System.Object" },
            ProxyMethod { name: "MoveNext", params: &[], ret: "System.Boolean" },
            ProxyMethod { name: "Reset", params: &[], ret: "System.Void" },
        ],
    },
    ProxyDef {
        open_name: "System.Collections.ICollection",
        type_params: &[],
        parents: &["System.Collections.IEnumerable"],
        methods: &[
            ProxyMethod { name: "get_Count", params: &[], ret: "System.Int32" },
            ProxyMethod { name: "get_IsSynchronized", params: &[], ret: "System.Boolean" },
            ProxyMethod { name: "get_SyncRoot", params: &[], ret: "System.Object" },
            ProxyMethod {
                name: "CopyTo",
                params: &["System.Array", "System.Int32"],
                ret: "System.Void",
            },
        ],
    },
    ProxyDef {
        open_name: "System.Collections.Generic.IEnumerable`1",
        type_params: &["T"],
        parents: &["System.Collections.IEnumerable"],
        methods: &[ProxyMethod {
            name: "GetEnumerator",
            params: &[],
            ret: "System.Collections.Generic.IEnumerator`1<T>",
        }],
    },
    ProxyDef {
        open_name: "System.Collections.Generic.IEnumerator`1",
        type_params: &["T"],
        parents: &["System.Collections.IEnumerator", "System.IDisposable"],
        methods: &[ProxyMethod { name: "get_Current", params: &[], ret: "T" }],
    },
    ProxyDef {
        open_name: "System.Collections.Generic.ICollection`1",
        type_params: &["T"],
        parents: &[
            "System.Collections.Generic.IEnumerable`1<T>",
            "System.Collections.IEnumerable",
        ],
        methods: &[
            ProxyMethod { name: "get_Count", params: &[], ret: "System.Int32" },
            ProxyMethod { name: "get_IsReadOnly", params: &[], ret: "System.Boolean" },
            ProxyMethod { name: "Add", params: &["T"], ret: "System.Void" },
            ProxyMethod { name: "Clear", params: &[], ret: "System.Void" },
            ProxyMethod { name: "Contains", params: &["T"], ret: "System.Boolean" },
            ProxyMethod { name: "CopyTo", params: &["T[]", "System.Int32"], ret: "System.Void" },
            ProxyMethod { name: "Remove", params: &["T"], ret: "System.Boolean" },
        ],
    },
    ProxyDef {
        open_name: "System.Collections.Generic.IList`1",
        type_params: &["T"],
        parents: &[
            "System.Collections.Generic.ICollection`1<T>",
            "System.Collections.Generic.IEnumerable`1<T>",
            "System.Collections.IEnumerable",
        ],
        methods: &[
            ProxyMethod { name: "get_Item", params: &["System.Int32"], ret: "T" },
            ProxyMethod { name: "set_Item", params: &["System.Int32", "T"], ret: "System.Void" },
            ProxyMethod { name: "IndexOf", params: &["T"], ret: "System.Int32" },
            ProxyMethod { name: "Insert", params: &["System.Int32", "T"], ret: "System.Void" },
            ProxyMethod { name: "RemoveAt", params: &["System.Int32"], ret: "System.Void" },
        ],
    },
    ProxyDef {
        open_name: "System.Collections.Generic.IReadOnlyCollection`1",
        type_params: &["T"],
        parents: &[
            "System.Collections.Generic.IEnumerable`1<T>",
            "System.Collections.IEnumerable",
        ],
        methods: &[ProxyMethod { name: "get_Count", params: &[], ret: "System.Int32" }],
    },
    ProxyDef {
        open_name: "System.Collections.Generic.IReadOnlyList`1",
        type_params: &["T"],
        parents: &[
            "System.Collections.Generic.IReadOnlyCollection`1<T>",
            "System.Collections.Generic.IEnumerable`1<T>",
            "System.Collections.IEnumerable",
        ],
        methods: &[ProxyMethod { name: "get_Item", params: &["System.Int32"], ret: "T" }],
    },
    ProxyDef {
        open_name: "System.Collections.Generic.IDictionary`2",
        type_params: &["TKey", "TValue"],
        parents: &[
            "System.Collections.Generic.ICollection`1<System.Collections.Generic.KeyValuePair`2<TKey,TValue>>",
            "System.Collections.IEnumerable",
        ],
        methods: &[
            ProxyMethod { name: "get_Item", params: &["TKey"], ret: "TValue" },
            ProxyMethod { name: "set_Item", params: &["TKey", "TValue"], ret: "System.Void" },
            ProxyMethod { name: "ContainsKey", params: &["TKey"], ret: "System.Boolean" },
            ProxyMethod { name: "Add", params: &["TKey", "TValue"], ret: "System.Void" },
            ProxyMethod { name: "Remove", params: &["TKey"], ret: "System.Boolean" },
            ProxyMethod {
                name: "TryGetValue",
                params: &["TKey", "TValue&"],
                ret: "System.Boolean",
            },
        ],
    },
];

fn find_proxy(open_name: &str) -> Option<&'static ProxyDef> {
    PROXIES.iter().find(|p| p.open_name == open_name)
}

/// Whether `il_name` (open or closed form) belongs to the proxy
/// catalogue.
pub fn is_known_bcl_interface(il_name: &str) -> bool {
    let open = match split_generic_instance(il_name) {
        Some((open, _)) => open,
        None => il_name.to_string(),
    };
    find_proxy(&open).is_some()
}

/// Builds the minimal IR type for a referenced-but-unloaded BCL
/// interface, substituting the closed form's type arguments into method
/// signatures and parent-interface edges.
pub fn synthesize_proxy(il_name: &str, resolver: &TypeResolver) -> Option<IRType> {
    let (open, args) = match split_generic_instance(il_name) {
        Some((open, args)) => (open, args),
        None => (il_name.to_string(), Vec::new()),
    };
    let def = find_proxy(&open)?;
    if args.len() != def.type_params.len() {
        return None;
    }

    let mut subst: HashMap<String, String> = HashMap::new();
    for (param, arg) in def.type_params.iter().zip(&args) {
        subst.insert((*param).to_string(), arg.clone());
    }

    let cpp_name = mangle_type_name(il_name);
    let mut ty = IRType::new(il_name, cpp_name.clone());
    ty.namespace = open.rsplit_once('.').map(|(ns, _)| ns.to_string()).unwrap_or_default();
    ty.flags = TypeFlags::INTERFACE | TypeFlags::ABSTRACT | TypeFlags::RUNTIME_PROVIDED;
    if !args.is_empty() {
        ty.flags |= TypeFlags::GENERIC_INSTANCE;
        ty.generic_args = args;
    }
    ty.interfaces = def
        .parents
        .iter()
        .map(|p| substitute_generic_params(p, &subst))
        .collect();

    for (slot, pm) in def.methods.iter().enumerate() {
        let il_params: Vec<String> = pm
            .params
            .iter()
            .map(|p| substitute_generic_params(p, &subst))
            .collect();
        let il_ret = substitute_generic_params(pm.ret, &subst);

        let mut method = IRMethod::new(pm.name, mangle_method_name(&cpp_name, pm.name, &il_ret));
        method.declaring_type = ty.il_name.clone();
        method.is_virtual = true;
        method.is_abstract = true;
        method.return_type = resolver.cpp_type(&il_ret);
        method.params = il_params
            .iter()
            .enumerate()
            .map(|(i, p)| IRParam {
                name: format!("a{}", i),
                cpp_type: resolver.cpp_type(p),
                il_type: p.clone(),
            })
            .collect();
        method.il_params = il_params;

        ty.vtable.push(VtableSlot {
            slot,
            il_name: pm.name.to_string(),
            cpp_name: method.cpp_name.clone(),
            arg_count: method.params.len(),
        });
        ty.methods.push(method);
    }

    Some(ty)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_open_and_closed_forms() {
        assert!(is_known_bcl_interface("System.IDisposable"));
        assert!(is_known_bcl_interface(
            "System.Collections.Generic.IEnumerator`1<System.Int32>"
        ));
        assert!(!is_known_bcl_interface("App.IWidget"));
    }

    #[test]
    fn enumerator_proxy_substitutes_and_links_parents() {
        let resolver = TypeResolver::new();
        let ty = synthesize_proxy(
            "System.Collections.Generic.IEnumerator`1<System.Int32>",
            &resolver,
        )
        .unwrap();

        assert!(ty.is_interface());
        assert_eq!(
            ty.interfaces,
            vec!["System.Collections.IEnumerator".to_string(), "System.IDisposable".to_string()]
        );
        let current = &ty.methods[0];
        assert_eq!(current.il_name, "get_Current");
        assert_eq!(current.return_type, "int32_t");
    }

    #[test]
    fn readonly_list_extends_readonly_collection() {
        let resolver = TypeResolver::new();
        let ty = synthesize_proxy(
            "System.Collections.Generic.IReadOnlyList`1<System.String>",
            &resolver,
        )
        .unwrap();
        assert!(ty
            .interfaces
            .contains(&"System.Collections.Generic.IReadOnlyCollection`1<System.String>".to_string()));
        assert!(ty.interfaces.contains(&"System.Collections.IEnumerable".to_string()));
    }

    #[test]
    fn byref_placeholder_substitution_in_dictionary() {
        let resolver = TypeResolver::new();
        let ty = synthesize_proxy(
            "System.Collections.Generic.IDictionary`2<System.String,System.Int32>",
            &resolver,
        )
        .unwrap();
        let try_get = ty.methods.iter().find(|m| m.il_name == "TryGetValue").unwrap();
        assert_eq!(try_get.il_params[1], "System.Int32&");
        assert_eq!(try_get.params[1].cpp_type, "int32_t*");
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let resolver = TypeResolver::new();
        assert!(synthesize_proxy("System.Collections.Generic.IEnumerator`1", &resolver).is_none());
    }
}
