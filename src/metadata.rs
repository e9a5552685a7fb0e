/// Assembly metadata model
/// The shape the metadata extractor hands us: module -> types -> methods -> instructions
use crate::opcodes::{CilOp, MethodRef};
use anyhow::{Context, Result};
use bitflags::bitflags;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TypeAttrs: u32 {
        const INTERFACE   = 1 << 0;
        const ABSTRACT    = 1 << 1;
        const SEALED      = 1 << 2;
        const VALUE_TYPE  = 1 << 3;
        const ENUM        = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct MethodAttrs: u32 {
        const STATIC        = 1 << 0;
        const VIRTUAL       = 1 << 1;
        const ABSTRACT      = 1 << 2;
        const NEWSLOT       = 1 << 3;
        const CTOR          = 1 << 4;
        const CCTOR         = 1 << 5;
        const INTERNAL_CALL = 1 << 6;
        const PINVOKE       = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct FieldAttrs: u32 {
        const STATIC  = 1 << 0;
        const LITERAL = 1 << 1;
        const HAS_RVA = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PInvokeInfo {
    pub module: String,
    pub entry_point: String,
    #[serde(default)]
    pub calling_convention: String,
}

/// Debug sequence point, sorted by `offset` before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencePoint {
    pub offset: u32,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandlerKind {
    Catch,
    Filter,
    Finally,
    Fault,
}

/// One protected region from the method's exception handler table.
/// Offsets are bytecode offsets; `catch_type` is set for `Catch`,
/// `filter_start` for `Filter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionHandler {
    pub kind: HandlerKind,
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    #[serde(default)]
    pub catch_type: Option<String>,
    #[serde(default)]
    pub filter_start: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub offset: u32,
    pub op: CilOp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamInfo {
    pub name: String,
    pub param_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalInfo {
    #[serde(default)]
    pub name: Option<String>,
    pub local_type: String,
}

/// Explicit interface implementation record (MethodImpl row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub interface_type: String,
    pub method_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodInfo {
    pub name: String,
    #[serde(default)]
    pub attrs: MethodAttrs,
    #[serde(default)]
    pub params: Vec<ParamInfo>,
    pub return_type: String,
    #[serde(default)]
    pub locals: Vec<LocalInfo>,
    #[serde(default)]
    pub body: Vec<Instruction>,
    #[serde(default)]
    pub handlers: Vec<ExceptionHandler>,
    #[serde(default)]
    pub sequence_points: Vec<SequencePoint>,
    #[serde(default)]
    pub pinvoke: Option<PInvokeInfo>,
    #[serde(default)]
    pub generic_params: Vec<String>,
    #[serde(default)]
    pub overrides: Vec<OverrideRecord>,
}

impl MethodInfo {
    pub fn is_static(&self) -> bool {
        self.attrs.contains(MethodAttrs::STATIC)
    }

    pub fn is_virtual(&self) -> bool {
        self.attrs.contains(MethodAttrs::VIRTUAL)
    }

    pub fn is_ctor(&self) -> bool {
        self.attrs.contains(MethodAttrs::CTOR)
    }

    pub fn is_cctor(&self) -> bool {
        self.attrs.contains(MethodAttrs::CCTOR)
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: String,
    #[serde(default)]
    pub attrs: FieldAttrs,
    /// Initial data for fields with an RVA (array initializer blobs).
    #[serde(default)]
    pub rva_data: Option<Vec<u8>>,
}

impl FieldInfo {
    pub fn is_static(&self) -> bool {
        self.attrs.contains(FieldAttrs::STATIC)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    /// IL full name, nested types separated by `/`.
    pub full_name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub attrs: TypeAttrs,
    #[serde(default)]
    pub base_type: Option<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldInfo>,
    #[serde(default)]
    pub methods: Vec<MethodInfo>,
    /// Underlying primitive when this is an enum.
    #[serde(default)]
    pub enum_underlying: Option<String>,
    #[serde(default)]
    pub generic_params: Vec<String>,
}

impl TypeDef {
    pub fn is_interface(&self) -> bool {
        self.attrs.contains(TypeAttrs::INTERFACE)
    }

    pub fn is_value_type(&self) -> bool {
        self.attrs.contains(TypeAttrs::VALUE_TYPE)
    }

    pub fn is_enum(&self) -> bool {
        self.attrs.contains(TypeAttrs::ENUM)
    }

    pub fn get_method(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    #[serde(default)]
    pub entry_point: Option<MethodRef>,
    pub types: Vec<TypeDef>,
    /// Underlying types for enums defined in referenced assemblies.
    #[serde(default)]
    pub external_enums: HashMap<String, String>,
}

impl Module {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("malformed module description")
    }

    pub fn get_type(&self, full_name: &str) -> Option<&TypeDef> {
        self.types.iter().find(|t| t.full_name == full_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::CilOp;

    #[test]
    fn module_round_trips_through_json() {
        let module = Module {
            name: "app".into(),
            entry_point: None,
            types: vec![TypeDef {
                full_name: "App.Program".into(),
                namespace: "App".into(),
                attrs: TypeAttrs::SEALED,
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
                        Instruction { offset: 0, op: CilOp::Nop },
                        Instruction { offset: 1, op: CilOp::Ret },
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
            external_enums: HashMap::new(),
        };

        let text = serde_json::to_string(&module).unwrap();
        let back = Module::from_json(&text).unwrap();
        assert_eq!(back, module);
    }

    #[test]
    fn missing_optional_fields_default() {
        let text = r#"{
            "name": "m",
            "types": [{
                "full_name": "N.T",
                "methods": [{
                    "name": "F",
                    "return_type": "System.Void"
                }]
            }]
        }"#;
        let module = Module::from_json(text).unwrap();
        let ty = module.get_type("N.T").unwrap();
        assert!(!ty.is_interface());
        let method = ty.get_method("F").unwrap();
        assert!(!method.has_body());
        assert!(method.pinvoke.is_none());
    }
}
