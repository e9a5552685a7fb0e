/// Nullable<T> interception
/// Members of any Nullable instantiation are lowered inline instead of
/// through method dispatch
use crate::ir::{InstKind, StackEntry};
use crate::mangle::split_generic_instance;

pub const NULLABLE_OPEN: &str = "System.Nullable`1";

pub fn is_nullable_type(il_name: &str) -> bool {
    match split_generic_instance(il_name) {
        Some((open, _)) => open == NULLABLE_OPEN,
        None => il_name == NULLABLE_OPEN,
    }
}

/// Inner type argument of a closed `Nullable<T>` name.
pub fn nullable_inner(il_name: &str) -> Option<String> {
    let (open, mut args) = split_generic_instance(il_name)?;
    if open != NULLABLE_OPEN || args.len() != 1 {
        return None;
    }
    Some(args.remove(0))
}

/// Receiver spelling: always a `->` access; address-of receivers are
/// parenthesized so the arrow binds to the whole expression.
fn receiver(this: &StackEntry) -> String {
    if this.is_address_of() {
        format!("({})", this.expr)
    } else {
        this.expr.clone()
    }
}

/// Lowers one intercepted `Nullable<T>` member. `args` excludes the
/// receiver. Returns the instructions to emit and the value to push, or
/// None when the member is not intercepted.
pub fn lower_nullable_call(
    method_name: &str,
    this: &StackEntry,
    args: &[StackEntry],
    inner_cpp: &str,
) -> Option<(Vec<InstKind>, Option<StackEntry>)> {
    let recv = receiver(this);
    match (method_name, args.len()) {
        (".ctor", 0) => Some((
            vec![
                InstKind::Assign {
                    target: format!("{}->hasValue", recv),
                    value: "false".into(),
                },
                InstKind::Assign {
                    target: format!("{}->value", recv),
                    value: format!("{}{{}}", inner_cpp),
                },
            ],
            None,
        )),
        (".ctor", 1) => Some((
            vec![
                InstKind::Assign {
                    target: format!("{}->hasValue", recv),
                    value: "true".into(),
                },
                InstKind::Assign {
                    target: format!("{}->value", recv),
                    value: args[0].expr.clone(),
                },
            ],
            None,
        )),
        ("get_HasValue", 0) => Some((
            Vec::new(),
            Some(StackEntry::typed(format!("{}->hasValue", recv), "bool")),
        )),
        ("get_Value", 0) => Some((
            vec![InstKind::RawCpp {
                code: format!(
                    "if (!{}->hasValue) {{ cil2cpp::throw_invalid_operation(); }}",
                    recv
                ),
                result: None,
                result_type: None,
            }],
            Some(StackEntry::typed(format!("{}->value", recv), inner_cpp)),
        )),
        ("GetValueOrDefault", 0) => Some((
            Vec::new(),
            Some(StackEntry::typed(format!("{}->value", recv), inner_cpp)),
        )),
        ("GetValueOrDefault", 1) => Some((
            Vec::new(),
            Some(StackEntry::typed(
                format!("({r}->hasValue ? {r}->value : {d})", r = recv, d = args[0].expr),
                inner_cpp,
            )),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_nullable_instantiations() {
        assert!(is_nullable_type("System.Nullable`1<System.Int32>"));
        assert!(is_nullable_type("System.Nullable`1"));
        assert!(!is_nullable_type("System.Collections.Generic.List`1<System.Int32>"));
        assert_eq!(
            nullable_inner("System.Nullable`1<System.Int32>").as_deref(),
            Some("System.Int32")
        );
    }

    #[test]
    fn default_ctor_zero_initializes() {
        let this = StackEntry::typed("&loc0", "System_Nullable_1_System_Int32*");
        let (insts, value) = lower_nullable_call(".ctor", &this, &[], "int32_t").unwrap();
        assert!(value.is_none());
        assert_eq!(
            insts[0],
            InstKind::Assign { target: "(&loc0)->hasValue".into(), value: "false".into() }
        );
        assert_eq!(
            insts[1],
            InstKind::Assign { target: "(&loc0)->value".into(), value: "int32_t{}".into() }
        );
    }

    #[test]
    fn value_ctor_sets_flag_and_payload() {
        let this = StackEntry::untyped("p");
        let arg = StackEntry::typed("42", "int32_t");
        let (insts, _) = lower_nullable_call(".ctor", &this, &[arg], "int32_t").unwrap();
        assert_eq!(
            insts,
            vec![
                InstKind::Assign { target: "p->hasValue".into(), value: "true".into() },
                InstKind::Assign { target: "p->value".into(), value: "42".into() },
            ]
        );
    }

    #[test]
    fn get_value_guards_before_reading() {
        let this = StackEntry::untyped("&n");
        let (insts, value) = lower_nullable_call("get_Value", &this, &[], "double").unwrap();
        match &insts[0] {
            InstKind::RawCpp { code, .. } => {
                assert!(code.contains("(&n)->hasValue"));
                assert!(code.contains("throw_invalid_operation"));
            }
            other => panic!("expected RawCpp guard, got {:?}", other),
        }
        assert_eq!(value.unwrap().expr, "(&n)->value");
    }

    #[test]
    fn get_value_or_default_with_fallback() {
        let this = StackEntry::untyped("n");
        let arg = StackEntry::typed("7", "int32_t");
        let (insts, value) =
            lower_nullable_call("GetValueOrDefault", &this, &[arg], "int32_t").unwrap();
        assert!(insts.is_empty());
        assert_eq!(value.unwrap().expr, "(n->hasValue ? n->value : 7)");
    }

    #[test]
    fn unknown_members_fall_through() {
        let this = StackEntry::untyped("n");
        assert!(lower_nullable_call("ToString", &this, &[], "int32_t").is_none());
    }
}
