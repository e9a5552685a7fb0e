/// CIL instruction stream model
/// Structured opcodes with operands already resolved by the metadata extractor
use serde::{Deserialize, Serialize};

/// A resolved method reference as it appears in call-site operands.
///
/// `declaring_type` and the signature strings use IL full names; closed
/// generic instances keep their argument list in angle brackets
/// (`System.Collections.Generic.List`1<System.Int32>`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring_type: String,
    pub name: String,
    pub params: Vec<String>,
    pub return_type: String,
    pub has_this: bool,
    /// Type arguments when this reference is a generic method instantiation.
    #[serde(default)]
    pub generic_args: Vec<String>,
}

impl MethodRef {
    pub fn is_generic_instance(&self) -> bool {
        !self.generic_args.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRef {
    pub declaring_type: String,
    pub name: String,
    pub field_type: String,
}

/// Stand-alone signature operand of `calli`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSig {
    pub params: Vec<String>,
    pub return_type: String,
    pub has_this: bool,
}

/// `ldtoken` operand: a type, field or method handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenRef {
    Type(String),
    Field(FieldRef),
    Method(MethodRef),
}

/// Width selector shared by `conv.*`, `ldind.*`/`stind.*` and the typed
/// element-access opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumKind {
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    I,
    U,
    R4,
    R8,
    Ref,
}

/// One CIL opcode. Branch targets are absolute bytecode offsets; the
/// extractor resolves the relative displacement of both encodings but the
/// short forms are kept distinct so the stream mirrors the assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CilOp {
    Nop,
    Break,
    Dup,
    Pop,

    // Constants
    LdcI4(i32),
    LdcI8(i64),
    LdcR4(f32),
    LdcR8(f64),
    LdNull,
    LdStr(String),

    // Arguments and locals
    LdArg(u16),
    LdArgA(u16),
    StArg(u16),
    LdLoc(u16),
    LdLocA(u16),
    StLoc(u16),

    // Arithmetic and bitwise
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,
    Neg,
    Not,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,

    // Comparison
    Ceq,
    Cgt,
    CgtUn,
    Clt,
    CltUn,

    // Branches
    Br(u32),
    BrS(u32),
    BrFalse(u32),
    BrFalseS(u32),
    BrTrue(u32),
    BrTrueS(u32),
    Beq(u32),
    BeqS(u32),
    Bge(u32),
    BgeS(u32),
    Bgt(u32),
    BgtS(u32),
    Ble(u32),
    BleS(u32),
    Blt(u32),
    BltS(u32),
    BneUn(u32),
    BneUnS(u32),
    BgeUn(u32),
    BgeUnS(u32),
    BgtUn(u32),
    BgtUnS(u32),
    BleUn(u32),
    BleUnS(u32),
    BltUn(u32),
    BltUnS(u32),
    Switch(Vec<u32>),

    // Conversions
    Conv(NumKind),
    ConvOvf(NumKind),
    ConvOvfUn(NumKind),
    ConvRUn,

    // Fields
    LdFld(FieldRef),
    LdFldA(FieldRef),
    StFld(FieldRef),
    LdsFld(FieldRef),
    LdsFldA(FieldRef),
    StsFld(FieldRef),

    // Indirect access
    LdInd(NumKind),
    StInd(NumKind),
    LdObj(String),
    StObj(String),
    CpObj(String),

    // Arrays
    NewArr(String),
    LdLen,
    LdElem(NumKind),
    LdElemAny(String),
    StElem(NumKind),
    StElemAny(String),
    LdElemA(String),

    // Object model
    CastClass(String),
    IsInst(String),
    Box(String),
    Unbox(String),
    UnboxAny(String),
    InitObj(String),
    MkRefAny(String),
    RefAnyVal(String),
    RefAnyType,
    ArgList,
    SizeOf(String),
    LdToken(TokenRef),

    // Exception control
    Throw,
    Rethrow,
    Leave(u32),
    LeaveS(u32),
    EndFinally,
    EndFilter,

    // Calls
    Call(MethodRef),
    CallVirt(MethodRef),
    Calli(CallSig),
    NewObj(MethodRef),
    Jmp(MethodRef),
    LdFtn(MethodRef),
    LdVirtFtn(MethodRef),
    Ret,

    // Prefixes
    Constrained(String),
    Volatile,
    Tail,
    Readonly,
    Unaligned(u8),
    NoCheck(u8),

    // Block operations
    CpBlk,
    InitBlk,
    CkFinite,
    LocAlloc,
}

impl CilOp {
    /// Mnemonic without operands, for diagnostics.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CilOp::Nop => "nop",
            CilOp::Break => "break",
            CilOp::Dup => "dup",
            CilOp::Pop => "pop",
            CilOp::LdcI4(_) => "ldc.i4",
            CilOp::LdcI8(_) => "ldc.i8",
            CilOp::LdcR4(_) => "ldc.r4",
            CilOp::LdcR8(_) => "ldc.r8",
            CilOp::LdNull => "ldnull",
            CilOp::LdStr(_) => "ldstr",
            CilOp::LdArg(_) => "ldarg",
            CilOp::LdArgA(_) => "ldarga",
            CilOp::StArg(_) => "starg",
            CilOp::LdLoc(_) => "ldloc",
            CilOp::LdLocA(_) => "ldloca",
            CilOp::StLoc(_) => "stloc",
            CilOp::Add => "add",
            CilOp::Sub => "sub",
            CilOp::Mul => "mul",
            CilOp::Div => "div",
            CilOp::DivUn => "div.un",
            CilOp::Rem => "rem",
            CilOp::RemUn => "rem.un",
            CilOp::AddOvf => "add.ovf",
            CilOp::AddOvfUn => "add.ovf.un",
            CilOp::SubOvf => "sub.ovf",
            CilOp::SubOvfUn => "sub.ovf.un",
            CilOp::MulOvf => "mul.ovf",
            CilOp::MulOvfUn => "mul.ovf.un",
            CilOp::Neg => "neg",
            CilOp::Not => "not",
            CilOp::And => "and",
            CilOp::Or => "or",
            CilOp::Xor => "xor",
            CilOp::Shl => "shl",
            CilOp::Shr => "shr",
            CilOp::ShrUn => "shr.un",
            CilOp::Ceq => "ceq",
            CilOp::Cgt => "cgt",
            CilOp::CgtUn => "cgt.un",
            CilOp::Clt => "clt",
            CilOp::CltUn => "clt.un",
            CilOp::Br(_) => "br",
            CilOp::BrS(_) => "br.s",
            CilOp::BrFalse(_) => "brfalse",
            CilOp::BrFalseS(_) => "brfalse.s",
            CilOp::BrTrue(_) => "brtrue",
            CilOp::BrTrueS(_) => "brtrue.s",
            CilOp::Beq(_) => "beq",
            CilOp::BeqS(_) => "beq.s",
            CilOp::Bge(_) => "bge",
            CilOp::BgeS(_) => "bge.s",
            CilOp::Bgt(_) => "bgt",
            CilOp::BgtS(_) => "bgt.s",
            CilOp::Ble(_) => "ble",
            CilOp::BleS(_) => "ble.s",
            CilOp::Blt(_) => "blt",
            CilOp::BltS(_) => "blt.s",
            CilOp::BneUn(_) => "bne.un",
            CilOp::BneUnS(_) => "bne.un.s",
            CilOp::BgeUn(_) => "bge.un",
            CilOp::BgeUnS(_) => "bge.un.s",
            CilOp::BgtUn(_) => "bgt.un",
            CilOp::BgtUnS(_) => "bgt.un.s",
            CilOp::BleUn(_) => "ble.un",
            CilOp::BleUnS(_) => "ble.un.s",
            CilOp::BltUn(_) => "blt.un",
            CilOp::BltUnS(_) => "blt.un.s",
            CilOp::Switch(_) => "switch",
            CilOp::Conv(k) => conv_mnemonic(*k),
            CilOp::ConvOvf(k) => conv_ovf_mnemonic(*k),
            CilOp::ConvOvfUn(k) => conv_ovf_un_mnemonic(*k),
            CilOp::ConvRUn => "conv.r.un",
            CilOp::LdFld(_) => "ldfld",
            CilOp::LdFldA(_) => "ldflda",
            CilOp::StFld(_) => "stfld",
            CilOp::LdsFld(_) => "ldsfld",
            CilOp::LdsFldA(_) => "ldsflda",
            CilOp::StsFld(_) => "stsfld",
            CilOp::LdInd(_) => "ldind",
            CilOp::StInd(_) => "stind",
            CilOp::LdObj(_) => "ldobj",
            CilOp::StObj(_) => "stobj",
            CilOp::CpObj(_) => "cpobj",
            CilOp::NewArr(_) => "newarr",
            CilOp::LdLen => "ldlen",
            CilOp::LdElem(_) => "ldelem",
            CilOp::LdElemAny(_) => "ldelem.any",
            CilOp::StElem(_) => "stelem",
            CilOp::StElemAny(_) => "stelem.any",
            CilOp::LdElemA(_) => "ldelema",
            CilOp::CastClass(_) => "castclass",
            CilOp::IsInst(_) => "isinst",
            CilOp::Box(_) => "box",
            CilOp::Unbox(_) => "unbox",
            CilOp::UnboxAny(_) => "unbox.any",
            CilOp::InitObj(_) => "initobj",
            CilOp::MkRefAny(_) => "mkrefany",
            CilOp::RefAnyVal(_) => "refanyval",
            CilOp::RefAnyType => "refanytype",
            CilOp::ArgList => "arglist",
            CilOp::SizeOf(_) => "sizeof",
            CilOp::LdToken(_) => "ldtoken",
            CilOp::Throw => "throw",
            CilOp::Rethrow => "rethrow",
            CilOp::Leave(_) => "leave",
            CilOp::LeaveS(_) => "leave.s",
            CilOp::EndFinally => "endfinally",
            CilOp::EndFilter => "endfilter",
            CilOp::Call(_) => "call",
            CilOp::CallVirt(_) => "callvirt",
            CilOp::Calli(_) => "calli",
            CilOp::NewObj(_) => "newobj",
            CilOp::Jmp(_) => "jmp",
            CilOp::LdFtn(_) => "ldftn",
            CilOp::LdVirtFtn(_) => "ldvirtftn",
            CilOp::Ret => "ret",
            CilOp::Constrained(_) => "constrained.",
            CilOp::Volatile => "volatile.",
            CilOp::Tail => "tail.",
            CilOp::Readonly => "readonly.",
            CilOp::Unaligned(_) => "unaligned.",
            CilOp::NoCheck(_) => "no.",
            CilOp::CpBlk => "cpblk",
            CilOp::InitBlk => "initblk",
            CilOp::CkFinite => "ckfinite",
            CilOp::LocAlloc => "localloc",
        }
    }
}

fn conv_mnemonic(kind: NumKind) -> &'static str {
    match kind {
        NumKind::I1 => "conv.i1",
        NumKind::U1 => "conv.u1",
        NumKind::I2 => "conv.i2",
        NumKind::U2 => "conv.u2",
        NumKind::I4 => "conv.i4",
        NumKind::U4 => "conv.u4",
        NumKind::I8 => "conv.i8",
        NumKind::U8 => "conv.u8",
        NumKind::I => "conv.i",
        NumKind::U => "conv.u",
        NumKind::R4 => "conv.r4",
        NumKind::R8 => "conv.r8",
        NumKind::Ref => "conv.ref",
    }
}

fn conv_ovf_mnemonic(kind: NumKind) -> &'static str {
    match kind {
        NumKind::I1 => "conv.ovf.i1",
        NumKind::U1 => "conv.ovf.u1",
        NumKind::I2 => "conv.ovf.i2",
        NumKind::U2 => "conv.ovf.u2",
        NumKind::I4 => "conv.ovf.i4",
        NumKind::U4 => "conv.ovf.u4",
        NumKind::I8 => "conv.ovf.i8",
        NumKind::U8 => "conv.ovf.u8",
        NumKind::I => "conv.ovf.i",
        NumKind::U => "conv.ovf.u",
        NumKind::R4 => "conv.ovf.r4",
        NumKind::R8 => "conv.ovf.r8",
        NumKind::Ref => "conv.ovf.ref",
    }
}

fn conv_ovf_un_mnemonic(kind: NumKind) -> &'static str {
    match kind {
        NumKind::I1 => "conv.ovf.i1.un",
        NumKind::U1 => "conv.ovf.u1.un",
        NumKind::I2 => "conv.ovf.i2.un",
        NumKind::U2 => "conv.ovf.u2.un",
        NumKind::I4 => "conv.ovf.i4.un",
        NumKind::U4 => "conv.ovf.u4.un",
        NumKind::I8 => "conv.ovf.i8.un",
        NumKind::U8 => "conv.ovf.u8.un",
        NumKind::I => "conv.ovf.i.un",
        NumKind::U => "conv.ovf.u.un",
        NumKind::R4 => "conv.ovf.r4.un",
        NumKind::R8 => "conv.ovf.r8.un",
        NumKind::Ref => "conv.ovf.ref.un",
    }
}
