/// Intermediate Representation (IR)
/// Typed expression-level representation between CIL and the C++ backend
use bitflags::bitflags;
use hashbrown::HashMap;

use crate::metadata::PInvokeInfo;

/// A value on the simulated evaluation stack: a printable C++ expression
/// plus an optional inferred C++ type.
#[derive(Debug, Clone, PartialEq)]
pub struct StackEntry {
    pub expr: String,
    pub ty: Option<String>,
}

impl StackEntry {
    pub fn typed(expr: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            ty: Some(ty.into()),
        }
    }

    pub fn untyped(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            ty: None,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.ty.as_deref().is_some_and(|t| t.ends_with('*'))
    }

    pub fn is_address_of(&self) -> bool {
        self.expr.starts_with('&')
    }

    pub fn is_null(&self) -> bool {
        self.expr == "nullptr"
    }
}

/// Source location attached to emitted instructions in debug builds.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub il_offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IRInstruction {
    pub kind: InstKind,
    pub loc: Option<SourceLoc>,
}

impl IRInstruction {
    pub fn new(kind: InstKind) -> Self {
        Self { kind, loc: None }
    }

    pub fn at(kind: InstKind, loc: Option<SourceLoc>) -> Self {
        Self { kind, loc }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Assign {
        target: String,
        value: String,
    },
    Label {
        name: String,
    },
    Branch {
        target: String,
    },
    ConditionalBranch {
        cond: String,
        true_label: String,
    },
    Switch {
        value: String,
        cases: Vec<String>,
    },
    Return {
        value: Option<String>,
    },
    Throw {
        expr: String,
    },
    Rethrow,
    TryBegin,
    CatchBegin {
        exc_type: Option<String>,
    },
    FilterBegin,
    FilterHandlerBegin,
    FinallyBegin,
    TryEnd,
    EndFilter,

    BinaryOp {
        op: String,
        a: String,
        b: String,
        result: String,
        result_type: Option<String>,
    },
    UnaryOp {
        op: String,
        x: String,
        result: String,
        result_type: Option<String>,
    },
    Conversion {
        src: String,
        target_type: String,
        result: String,
    },
    Cast {
        src: String,
        target_type: String,
        result: String,
        safe: bool,
        type_info_name: Option<String>,
    },

    FieldAccess {
        object: String,
        field: String,
        is_store: bool,
        store_value: Option<String>,
        /// Access through a value (`.`) rather than a pointer (`->`).
        is_value_access: bool,
        cast_to_type: Option<String>,
        result: Option<String>,
        result_type: Option<String>,
    },
    StaticFieldAccess {
        field: String,
        is_store: bool,
        store_value: Option<String>,
        result: Option<String>,
        result_type: Option<String>,
    },
    ArrayAccess {
        array: String,
        index: String,
        element_type: String,
        is_store: bool,
        store_value: Option<String>,
        result: Option<String>,
    },

    Box {
        value: String,
        value_type: String,
        type_info_name: Option<String>,
        result: String,
    },
    Unbox {
        object: String,
        value_type: String,
        result: String,
        is_unbox_any: bool,
        result_type: Option<String>,
    },
    InitObj {
        address: String,
        type_name: String,
        is_reference_type: bool,
    },
    NewObj {
        ctor_name: String,
        args: Vec<String>,
        result: String,
        result_type: Option<String>,
    },

    Call {
        function_name: String,
        args: Vec<String>,
        result: Option<String>,
        result_type: Option<String>,
        /// Non-empty when the callee's final name may change in the
        /// disambiguation pass; resolved by the fix-up pass.
        deferred_disambig_key: String,
    },
    LoadFunctionPointer {
        method_name: String,
        result: String,
        is_virtual: bool,
        object: Option<String>,
        vtable_slot: Option<usize>,
    },
    DelegateCreate {
        delegate_type: String,
        object: String,
        method_name: String,
        result: String,
    },
    DelegateInvoke {
        delegate: String,
        args: Vec<String>,
        result: Option<String>,
        result_type: Option<String>,
    },
    DeclareLocal {
        name: String,
        ty: String,
    },
    Comment {
        text: String,
    },
    RawCpp {
        code: String,
        result: Option<String>,
        result_type: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IRBasicBlock {
    pub id: usize,
    pub instructions: Vec<IRInstruction>,
}

impl IRBasicBlock {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            instructions: Vec::new(),
        }
    }

    pub fn push(&mut self, inst: IRInstruction) {
        self.instructions.push(inst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IRParam {
    pub name: String,
    pub cpp_type: String,
    pub il_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IRLocal {
    pub name: String,
    pub cpp_type: String,
    pub il_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VtableSlot {
    pub slot: usize,
    pub il_name: String,
    pub cpp_name: String,
    pub arg_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplicitOverride {
    pub interface_type: String,
    pub method_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IRMethod {
    pub il_name: String,
    pub cpp_name: String,
    pub declaring_type: String,
    pub params: Vec<IRParam>,
    pub il_params: Vec<String>,
    pub locals: Vec<IRLocal>,
    pub return_type: String,
    pub blocks: Vec<IRBasicBlock>,
    /// Inferred C++ type for every temporary that crosses a label.
    pub temp_var_types: HashMap<String, String>,
    pub is_static: bool,
    pub is_virtual: bool,
    pub is_newslot: bool,
    pub is_abstract: bool,
    pub is_ctor: bool,
    pub has_icall_mapping: bool,
    pub pinvoke: Option<PInvokeInfo>,
    pub overrides: Vec<ExplicitOverride>,
}

impl IRMethod {
    pub fn new(il_name: impl Into<String>, cpp_name: impl Into<String>) -> Self {
        Self {
            il_name: il_name.into(),
            cpp_name: cpp_name.into(),
            declaring_type: String::new(),
            params: Vec::new(),
            il_params: Vec::new(),
            locals: Vec::new(),
            return_type: "void".into(),
            blocks: vec![IRBasicBlock::new(0)],
            temp_var_types: HashMap::new(),
            is_static: false,
            is_virtual: false,
            is_newslot: false,
            is_abstract: false,
            is_ctor: false,
            has_icall_mapping: false,
            pinvoke: None,
            overrides: Vec::new(),
        }
    }

    pub fn instructions(&self) -> impl Iterator<Item = &IRInstruction> {
        self.blocks.iter().flat_map(|b| b.instructions.iter())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IRField {
    pub il_name: String,
    pub cpp_name: String,
    pub cpp_type: String,
    pub is_static: bool,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u32 {
        const INTERFACE        = 1 << 0;
        const ABSTRACT         = 1 << 1;
        const ENUM             = 1 << 2;
        const VALUE_TYPE       = 1 << 3;
        const GENERIC_INSTANCE = 1 << 4;
        const RUNTIME_PROVIDED = 1 << 5;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IRType {
    pub il_name: String,
    pub cpp_name: String,
    pub namespace: String,
    pub flags: TypeFlags,
    pub base_type: Option<String>,
    pub methods: Vec<IRMethod>,
    pub fields: Vec<IRField>,
    pub interfaces: Vec<String>,
    pub vtable: Vec<VtableSlot>,
    pub enum_underlying: Option<String>,
    pub generic_args: Vec<String>,
}

impl IRType {
    pub fn new(il_name: impl Into<String>, cpp_name: impl Into<String>) -> Self {
        Self {
            il_name: il_name.into(),
            cpp_name: cpp_name.into(),
            namespace: String::new(),
            flags: TypeFlags::empty(),
            base_type: None,
            methods: Vec::new(),
            fields: Vec::new(),
            interfaces: Vec::new(),
            vtable: Vec::new(),
            enum_underlying: None,
            generic_args: Vec::new(),
        }
    }

    pub fn is_value_type(&self) -> bool {
        self.flags.contains(TypeFlags::VALUE_TYPE)
    }

    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeFlags::INTERFACE)
    }

    /// Vtable slot for a virtual method, matched by IL name and argument
    /// count the way `ldvirtftn` resolves its target.
    pub fn find_vtable_slot(&self, il_name: &str, arg_count: usize) -> Option<&VtableSlot> {
        self.vtable
            .iter()
            .find(|s| s.il_name == il_name && s.arg_count == arg_count)
    }
}

/// Interned string literals. Identifiers are stable for the module's
/// lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StringPool {
    entries: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringPool {
    pub fn intern(&mut self, literal: &str) -> String {
        let id = match self.index.get(literal) {
            Some(&id) => id,
            None => {
                let id = self.entries.len();
                self.entries.push(literal.to_string());
                self.index.insert(literal.to_string(), id);
                id
            }
        };
        format!("__str_{}", id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.entries.iter().enumerate().map(|(i, s)| (i, s.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Interned array-initializer blobs (field RVA data).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArrayInitPool {
    blobs: Vec<Vec<u8>>,
    index: HashMap<Vec<u8>, usize>,
}

impl ArrayInitPool {
    pub fn intern(&mut self, bytes: &[u8]) -> String {
        let id = match self.index.get(bytes) {
            Some(&id) => id,
            None => {
                let id = self.blobs.len();
                self.blobs.push(bytes.to_vec());
                self.index.insert(bytes.to_vec(), id);
                id
            }
        };
        format!("__blob_{}", id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[u8])> {
        self.blobs.iter().enumerate().map(|(i, b)| (i, b.as_slice()))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IRModule {
    pub name: String,
    types: Vec<IRType>,
    type_index: HashMap<String, usize>,
    pub string_pool: StringPool,
    pub array_inits: ArrayInitPool,
    /// IL names of primitives whose TypeInfo singleton the emitted code
    /// references. Grows monotonically; insertion order is emission order.
    primitive_type_infos: Vec<String>,
    pub external_enums: HashMap<String, String>,
    /// `"original_cpp_name|il_param_list"` -> renamed method.
    pub disambiguated_methods: HashMap<String, String>,
    /// Generic method specialization key -> mangled name.
    pub method_instantiations: HashMap<String, String>,
}

impl IRModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_type(&mut self, ty: IRType) -> usize {
        let idx = self.types.len();
        self.type_index.insert(ty.il_name.clone(), idx);
        self.types.push(ty);
        idx
    }

    pub fn types(&self) -> &[IRType] {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut [IRType] {
        &mut self.types
    }

    pub fn type_by_name(&self, il_name: &str) -> Option<&IRType> {
        self.type_index.get(il_name).map(|&i| &self.types[i])
    }

    pub fn type_by_name_mut(&mut self, il_name: &str) -> Option<&mut IRType> {
        let idx = *self.type_index.get(il_name)?;
        Some(&mut self.types[idx])
    }

    pub fn has_type(&self, il_name: &str) -> bool {
        self.type_index.contains_key(il_name)
    }

    pub fn register_primitive_type_info(&mut self, il_name: &str) {
        if !self.primitive_type_infos.iter().any(|n| n == il_name) {
            self.primitive_type_infos.push(il_name.to_string());
        }
    }

    pub fn primitive_type_infos(&self) -> &[String] {
        &self.primitive_type_infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_entry_predicates() {
        assert!(StackEntry::typed("p", "int32_t*").is_pointer());
        assert!(!StackEntry::typed("v", "int32_t").is_pointer());
        assert!(StackEntry::untyped("&loc0").is_address_of());
        assert!(StackEntry::untyped("nullptr").is_null());
        assert!(!StackEntry::untyped("x").is_null());
    }

    #[test]
    fn string_pool_ids_are_stable() {
        let mut pool = StringPool::default();
        let a = pool.intern("hello");
        let b = pool.intern("world");
        let a2 = pool.intern("hello");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn array_init_pool_dedupes() {
        let mut pool = ArrayInitPool::default();
        let a = pool.intern(&[1, 2, 3]);
        let b = pool.intern(&[1, 2, 3]);
        let c = pool.intern(&[4]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn module_type_lookup() {
        let mut module = IRModule::new("m");
        module.add_type(IRType::new("App.A", "App_A"));
        module.add_type(IRType::new("App.B", "App_B"));
        assert!(module.type_by_name("App.A").is_some());
        assert!(module.type_by_name("App.C").is_none());
        module.type_by_name_mut("App.B").unwrap().flags |= TypeFlags::VALUE_TYPE;
        assert!(module.type_by_name("App.B").unwrap().is_value_type());
    }

    #[test]
    fn primitive_type_info_registry_is_monotonic() {
        let mut module = IRModule::new("m");
        module.register_primitive_type_info("System.Int32");
        module.register_primitive_type_info("System.Double");
        module.register_primitive_type_info("System.Int32");
        assert_eq!(module.primitive_type_infos().len(), 2);
        assert_eq!(module.primitive_type_infos()[0], "System.Int32");
    }
}
