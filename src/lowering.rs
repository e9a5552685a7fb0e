/// Instruction lowering
/// Walks one method's CIL stream, simulates the evaluation stack and
/// appends typed IR to the method body
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::config::CompilerOptions;
use crate::diagnostics::DiagnosticSink;
use crate::icall::{ICallQuery, ICALLS};
use crate::ir::{
    ArrayInitPool, IRInstruction, IRMethod, IRModule, InstKind, SourceLoc, StackEntry, StringPool,
};
use crate::mangle::{
    disambig_key, disambig_suffix, is_generic_sentinel, mangle_method_name, mangle_type_name,
    TypeResolver,
};
use crate::metadata::{MethodInfo, Module, SequencePoint};
use crate::nullable::{is_nullable_type, lower_nullable_call, nullable_inner};
use crate::opcodes::{CallSig, CilOp, FieldRef, MethodRef, NumKind, TokenRef};
use crate::regions::{
    collect_branch_targets, is_valid_merge_target, label_name, RegionEvent, RegionModel,
};

/// Module-level collections mutated during the method-parallel body
/// pass. Everything else the pass touches is read-only.
#[derive(Debug, Default)]
pub struct SharedPools {
    pub strings: Mutex<StringPool>,
    pub array_inits: Mutex<ArrayInitPool>,
    pub instantiations: Mutex<HashMap<String, String>>,
    pub primitive_type_infos: Mutex<Vec<String>>,
    /// Methods whose call sites hit the ICall registry; their IL bodies
    /// are dead in emission. `(declaring type, method name, arity)`.
    pub icall_flagged: Mutex<HashSet<(String, String, usize)>>,
}

impl SharedPools {
    pub fn register_primitive(&self, il_name: &str) {
        let mut infos = self.primitive_type_infos.lock();
        if !infos.iter().any(|n| n == il_name) {
            infos.push(il_name.to_string());
        }
    }
}

#[derive(Debug, Default)]
pub struct LoweredBody {
    pub instructions: Vec<IRInstruction>,
    pub temp_var_types: HashMap<String, String>,
}

pub fn lower_method_body(
    source: &Module,
    module: &IRModule,
    resolver: &TypeResolver,
    pools: &SharedPools,
    options: &CompilerOptions,
    sink: &DiagnosticSink,
    shell: &IRMethod,
    method: &MethodInfo,
) -> LoweredBody {
    MethodLowering::new(source, module, resolver, pools, options, sink, shell, method).run()
}

struct MethodLowering<'a> {
    source: &'a Module,
    module: &'a IRModule,
    resolver: &'a TypeResolver,
    pools: &'a SharedPools,
    options: &'a CompilerOptions,
    sink: &'a DiagnosticSink,
    shell: &'a IRMethod,
    method: &'a MethodInfo,

    out: Vec<IRInstruction>,
    stack: Vec<StackEntry>,
    temp_counter: usize,
    temp_var_types: HashMap<String, String>,

    pending_volatile: bool,
    constrained_type: Option<String>,
    unreachable: bool,

    branch_targets: HashSet<u32>,
    regions: RegionModel,
    merge_vars: HashMap<u32, StackEntry>,
    ternary_temps: HashSet<String>,
    stack_snapshots: HashMap<u32, Vec<StackEntry>>,
    pushed_since_cond_branch: usize,

    seq_points: Vec<SequencePoint>,
    current_loc: Option<SourceLoc>,
}

impl<'a> MethodLowering<'a> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        source: &'a Module,
        module: &'a IRModule,
        resolver: &'a TypeResolver,
        pools: &'a SharedPools,
        options: &'a CompilerOptions,
        sink: &'a DiagnosticSink,
        shell: &'a IRMethod,
        method: &'a MethodInfo,
    ) -> Self {
        let mut seq_points = if options.is_debug {
            method.sequence_points.clone()
        } else {
            Vec::new()
        };
        seq_points.sort_by_key(|sp| sp.offset);

        Self {
            source,
            module,
            resolver,
            pools,
            options,
            sink,
            shell,
            method,
            out: Vec::new(),
            stack: Vec::new(),
            temp_counter: 0,
            temp_var_types: HashMap::new(),
            pending_volatile: false,
            constrained_type: None,
            unreachable: false,
            branch_targets: collect_branch_targets(&method.body),
            regions: RegionModel::build(&method.handlers),
            merge_vars: HashMap::new(),
            ternary_temps: HashSet::new(),
            stack_snapshots: HashMap::new(),
            pushed_since_cond_branch: 0,
            seq_points,
            current_loc: None,
        }
    }

    fn run(mut self) -> LoweredBody {
        for local in &self.shell.locals {
            let kind = InstKind::DeclareLocal {
                name: local.name.clone(),
                ty: local.cpp_type.clone(),
            };
            self.out.push(IRInstruction::new(kind));
        }

        let body = self.method.body.clone();
        for ins in &body {
            self.update_loc(ins.offset);
            self.process_events(ins.offset);
            if self.branch_targets.contains(&ins.offset) {
                self.on_label(ins.offset);
            }
            if self.unreachable {
                continue;
            }
            match &ins.op {
                CilOp::Volatile => {
                    self.pending_volatile = true;
                    continue;
                }
                CilOp::Constrained(ty) => {
                    self.constrained_type = Some(ty.clone());
                    continue;
                }
                CilOp::Tail | CilOp::Readonly | CilOp::Unaligned(_) | CilOp::NoCheck(_) => {
                    continue;
                }
                op => self.dispatch(ins.offset, op),
            }
        }

        // Ternary merge temporaries default to a pointer-wide integer
        // when neither path produced a known type.
        for temp in &self.ternary_temps {
            self.temp_var_types
                .entry(temp.clone())
                .or_insert_with(|| "intptr_t".to_string());
        }

        LoweredBody {
            instructions: self.out,
            temp_var_types: self.temp_var_types,
        }
    }

    // ---- driver state helpers ----

    fn emit(&mut self, kind: InstKind) {
        self.out.push(IRInstruction::at(kind, self.current_loc.clone()));
    }

    fn push(&mut self, entry: StackEntry) {
        self.pushed_since_cond_branch += 1;
        self.stack.push(entry);
    }

    fn pop(&mut self) -> StackEntry {
        self.stack.pop().unwrap_or_else(|| {
            self.sink.warn(format!(
                "{}: evaluation stack underflow",
                self.shell.cpp_name
            ));
            StackEntry::untyped("0")
        })
    }

    fn temp(&mut self) -> String {
        let name = format!("__t{}", self.temp_counter);
        self.temp_counter += 1;
        name
    }

    fn typed_temp(&mut self, ty: &str) -> String {
        let name = self.temp();
        self.temp_var_types.insert(name.clone(), ty.to_string());
        name
    }

    fn update_loc(&mut self, offset: u32) {
        if self.seq_points.is_empty() {
            return;
        }
        // Last sequence point at or below the current offset.
        let idx = self.seq_points.partition_point(|sp| sp.offset <= offset);
        self.current_loc = idx.checked_sub(1).map(|i| {
            let sp = &self.seq_points[i];
            SourceLoc {
                file: sp.file.clone(),
                line: sp.line,
                column: sp.column,
                il_offset: offset,
            }
        });
    }

    // ---- region events, labels, merges ----

    fn process_events(&mut self, offset: u32) {
        let events: Vec<RegionEvent> = self.regions.events_at(offset).to_vec();
        for event in events {
            match event {
                RegionEvent::HandlerEnd => {
                    self.emit(InstKind::TryEnd);
                    self.stack.clear();
                    self.unreachable = true;
                }
                RegionEvent::TryBegin => {
                    self.emit(InstKind::TryBegin);
                    self.stack.clear();
                    self.unreachable = false;
                }
                RegionEvent::CatchBegin { exc_type } => {
                    let cpp = exc_type
                        .as_deref()
                        .map(|t| self.resolver.cpp_type(t))
                        .unwrap_or_else(|| "Object*".to_string());
                    self.emit(InstKind::CatchBegin {
                        exc_type: exc_type.map(|t| self.resolver.cpp_type(&t)),
                    });
                    self.stack.clear();
                    self.stack.push(StackEntry::typed("__exc", cpp));
                    self.unreachable = false;
                }
                RegionEvent::FilterBegin => {
                    self.emit(InstKind::FilterBegin);
                    self.stack.clear();
                    self.stack.push(StackEntry::typed("__exc", "Object*"));
                    self.unreachable = false;
                }
                RegionEvent::FilterHandlerBegin => {
                    self.emit(InstKind::FilterHandlerBegin);
                    self.stack.clear();
                    self.stack.push(StackEntry::typed("__exc", "Object*"));
                    self.unreachable = false;
                }
                RegionEvent::FinallyBegin => {
                    self.emit(InstKind::FinallyBegin);
                    self.stack.clear();
                    self.unreachable = false;
                }
            }
        }
    }

    fn on_label(&mut self, offset: u32) {
        if !self.unreachable {
            // Fall-through arrival at a merge label unifies the incoming
            // value with the recorded merge variable.
            if let Some(var) = self.merge_vars.get(&offset).cloned() {
                if let Some(top) = self.stack.last().cloned() {
                    if top.expr != var.expr {
                        let value = match (&var.ty, &top.ty) {
                            (Some(want), got) if want.ends_with('*') && got.as_ref() != Some(want) => {
                                format!("({})({})", want, top.expr)
                            }
                            _ => top.expr.clone(),
                        };
                        self.emit(InstKind::Assign {
                            target: var.expr.clone(),
                            value,
                        });
                        if self.ternary_temps.contains(&var.expr) {
                            if let Some(ty) = &top.ty {
                                self.temp_var_types
                                    .entry(var.expr.clone())
                                    .or_insert_with(|| ty.clone());
                            }
                        }
                        if let Some(slot) = self.stack.last_mut() {
                            *slot = var;
                        }
                    }
                } else {
                    self.stack.push(var);
                }
            }
        }

        self.emit(InstKind::Label {
            name: label_name(offset),
        });

        if self.unreachable {
            match self.stack_snapshots.get(&offset) {
                Some(snapshot) => self.stack = snapshot.clone(),
                None => self.stack.clear(),
            }
            self.unreachable = false;
        }
    }

    fn save_snapshot(&mut self, target: u32) {
        self.stack_snapshots
            .entry(target)
            .or_insert_with(|| self.stack.clone());
    }

    fn branch_unconditional(&mut self, target: u32) {
        if let Some(var) = self.merge_vars.get(&target).cloned() {
            // A later path joining an already-recorded merge variable.
            if let Some(top) = self.stack.last().cloned() {
                if top.expr != var.expr {
                    self.emit(InstKind::Assign {
                        target: var.expr.clone(),
                        value: top.expr,
                    });
                    if let Some(slot) = self.stack.last_mut() {
                        *slot = var;
                    }
                }
            }
        } else if self.pushed_since_cond_branch == 1 && !self.stack.is_empty() {
            // Ternary shape: carry the single pushed value across the
            // join in a fresh temporary.
            let top = self.pop();
            let temp = self.temp();
            if let Some(ty) = &top.ty {
                self.temp_var_types.insert(temp.clone(), ty.clone());
            }
            self.ternary_temps.insert(temp.clone());
            self.emit(InstKind::Assign {
                target: temp.clone(),
                value: top.expr,
            });
            let entry = StackEntry {
                expr: temp,
                ty: top.ty,
            };
            self.stack.push(entry.clone());
            self.merge_vars.insert(target, entry);
        }
        self.save_snapshot(target);
        self.emit(InstKind::Branch {
            target: label_name(target),
        });
        self.stack.clear();
        self.unreachable = true;
    }

    fn branch_conditional(&mut self, cond: String, target: u32) {
        self.emit(InstKind::ConditionalBranch {
            cond,
            true_label: label_name(target),
        });
        // A valid lvalue left behind (the dup pattern) becomes the merge
        // variable for the branch target.
        if let Some(top) = self.stack.last() {
            if is_valid_merge_target(top) && !self.merge_vars.contains_key(&target) {
                self.merge_vars.insert(target, top.clone());
            }
        }
        self.save_snapshot(target);
        self.pushed_since_cond_branch = 0;
    }

    // ---- expression helpers ----

    fn coerce(&self, entry: &StackEntry, want: &str) -> String {
        if entry.is_null() || entry.ty.as_deref() == Some(want) {
            return entry.expr.clone();
        }
        if want.ends_with('*') {
            return format!("({})({})", want, entry.expr);
        }
        entry.expr.clone()
    }

    fn un_wrap(expr: &str) -> String {
        format!("cil2cpp::to_unsigned({})", expr)
    }

    /// `&Mangled_TypeInfo` expression; array types collapse to the shared
    /// Array TypeInfo and primitives are registered with the module.
    fn type_info_expr(&self, il_name: &str) -> String {
        if il_name.ends_with("[]") {
            return "&Array_TypeInfo".to_string();
        }
        if crate::mangle::is_primitive(il_name) {
            self.pools.register_primitive(il_name);
        }
        format!("&{}_TypeInfo", self.type_cpp_base(il_name))
    }

    fn type_cpp_base(&self, il_name: &str) -> String {
        if self.options.is_runtime_provided(il_name) {
            crate::mangle::short_class_name(il_name)
        } else {
            mangle_type_name(il_name)
        }
    }

    fn num_cpp(kind: NumKind) -> &'static str {
        match kind {
            NumKind::I1 => "int8_t",
            NumKind::U1 => "uint8_t",
            NumKind::I2 => "int16_t",
            NumKind::U2 => "uint16_t",
            NumKind::I4 => "int32_t",
            NumKind::U4 => "uint32_t",
            NumKind::I8 => "int64_t",
            NumKind::U8 => "uint64_t",
            NumKind::I => "intptr_t",
            NumKind::U => "uintptr_t",
            NumKind::R4 => "float",
            NumKind::R8 => "double",
            NumKind::Ref => "Object*",
        }
    }

    // ---- opcode dispatch ----

    fn dispatch(&mut self, offset: u32, op: &CilOp) {
        match op {
            CilOp::Nop => {}
            CilOp::Break => {
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::debugger_break".into(),
                    args: vec![],
                    result: None,
                    result_type: None,
                    deferred_disambig_key: String::new(),
                });
            }
            CilOp::Dup => {
                let top = self.pop();
                self.stack.push(top.clone());
                self.push(top);
            }
            CilOp::Pop => {
                self.pop();
            }

            // -- constants --
            CilOp::LdcI4(v) => {
                // INT32_MIN has no literal spelling; emit the
                // subtraction form so the C++ parser keeps the type.
                let expr = if *v == i32::MIN {
                    "(-2147483647 - 1)".to_string()
                } else {
                    v.to_string()
                };
                self.push(StackEntry::typed(expr, "int32_t"));
            }
            CilOp::LdcI8(v) => {
                let expr = if *v == i64::MIN {
                    "(-9223372036854775807LL - 1)".to_string()
                } else {
                    format!("{}LL", v)
                };
                self.push(StackEntry::typed(expr, "int64_t"));
            }
            CilOp::LdcR4(v) => {
                self.push(StackEntry::typed(format!("{:?}f", v), "float"));
            }
            CilOp::LdcR8(v) => {
                self.push(StackEntry::typed(format!("{:?}", v), "double"));
            }
            CilOp::LdNull => {
                self.push(StackEntry::untyped("nullptr"));
            }
            CilOp::LdStr(s) => {
                let id = self.pools.strings.lock().intern(s);
                self.push(StackEntry::typed(
                    format!("cil2cpp::string_literal({})", id),
                    "String*",
                ));
            }

            // -- arguments and locals --
            CilOp::LdArg(i) => match self.shell.params.get(*i as usize) {
                Some(p) => {
                    let entry = StackEntry::typed(p.name.clone(), p.cpp_type.clone());
                    self.push(entry);
                }
                None => self.soft_fail(offset, op, "argument index out of range"),
            },
            CilOp::LdArgA(i) => match self.shell.params.get(*i as usize) {
                Some(p) => {
                    let entry = StackEntry::typed(
                        format!("&{}", p.name),
                        format!("{}*", p.cpp_type),
                    );
                    self.push(entry);
                }
                None => self.soft_fail(offset, op, "argument index out of range"),
            },
            CilOp::StArg(i) => {
                let value = self.pop();
                match self.shell.params.get(*i as usize) {
                    Some(p) => {
                        let coerced = self.coerce(&value, &p.cpp_type);
                        self.emit(InstKind::Assign {
                            target: p.name.clone(),
                            value: coerced,
                        });
                    }
                    None => self.soft_fail(offset, op, "argument index out of range"),
                }
            }
            CilOp::LdLoc(i) => match self.shell.locals.get(*i as usize) {
                Some(l) => {
                    let entry = StackEntry::typed(l.name.clone(), l.cpp_type.clone());
                    self.push(entry);
                }
                None => self.soft_fail(offset, op, "local index out of range"),
            },
            CilOp::LdLocA(i) => match self.shell.locals.get(*i as usize) {
                Some(l) => {
                    let entry = StackEntry::typed(
                        format!("&{}", l.name),
                        format!("{}*", l.cpp_type),
                    );
                    self.push(entry);
                }
                None => self.soft_fail(offset, op, "local index out of range"),
            },
            CilOp::StLoc(i) => {
                let value = self.pop();
                match self.shell.locals.get(*i as usize) {
                    Some(l) => {
                        let coerced = self.coerce(&value, &l.cpp_type);
                        self.emit(InstKind::Assign {
                            target: l.name.clone(),
                            value: coerced,
                        });
                    }
                    None => self.soft_fail(offset, op, "local index out of range"),
                }
            }

            // -- arithmetic and bitwise --
            CilOp::Add => self.binary_maybe_pointer("+"),
            CilOp::Sub => self.binary_maybe_pointer("-"),
            CilOp::Mul => self.binary("*", false),
            CilOp::Div => self.binary("/", false),
            CilOp::DivUn => self.binary("/", true),
            CilOp::Rem => self.binary("%", false),
            CilOp::RemUn => self.binary("%", true),
            CilOp::And => self.binary("&", false),
            CilOp::Or => self.binary("|", false),
            CilOp::Xor => self.binary("^", false),
            CilOp::Shl => self.binary("<<", false),
            CilOp::Shr => self.binary(">>", false),
            CilOp::ShrUn => {
                // Logical shift: coerce the shifted value to unsigned.
                let b = self.pop();
                let a = self.pop();
                let ty = a.ty.clone();
                let temp = self.temp();
                if let Some(t) = &ty {
                    self.temp_var_types.insert(temp.clone(), t.clone());
                }
                self.emit(InstKind::BinaryOp {
                    op: ">>".into(),
                    a: Self::un_wrap(&a.expr),
                    b: b.expr,
                    result: temp.clone(),
                    result_type: ty.clone(),
                });
                self.stack.push(StackEntry { expr: temp, ty });
                self.pushed_since_cond_branch += 1;
            }
            CilOp::AddOvf => self.checked_binary("cil2cpp::checked_add", false),
            CilOp::AddOvfUn => self.checked_binary("cil2cpp::checked_add_un", true),
            CilOp::SubOvf => self.checked_binary("cil2cpp::checked_sub", false),
            CilOp::SubOvfUn => self.checked_binary("cil2cpp::checked_sub_un", true),
            CilOp::MulOvf => self.checked_binary("cil2cpp::checked_mul", false),
            CilOp::MulOvfUn => self.checked_binary("cil2cpp::checked_mul_un", true),
            CilOp::Neg => self.unary("-"),
            CilOp::Not => self.unary("~"),

            // -- comparison --
            CilOp::Ceq => self.compare("==", false),
            CilOp::Cgt => self.compare(">", false),
            CilOp::CgtUn => {
                // cgt.un against null is the canonical `!= null` test.
                if self.stack.last().is_some_and(StackEntry::is_null) {
                    self.compare("!=", false);
                } else {
                    self.compare(">", true);
                }
            }
            CilOp::Clt => self.compare("<", false),
            CilOp::CltUn => self.compare("<", true),

            // -- branches --
            CilOp::Br(t) | CilOp::BrS(t) => self.branch_unconditional(*t),
            CilOp::BrTrue(t) | CilOp::BrTrueS(t) => {
                let cond = self.pop();
                self.branch_conditional(cond.expr, *t);
            }
            CilOp::BrFalse(t) | CilOp::BrFalseS(t) => {
                let cond = self.pop();
                self.branch_conditional(format!("!({})", cond.expr), *t);
            }
            CilOp::Beq(t) | CilOp::BeqS(t) => self.compare_branch("==", false, *t),
            CilOp::Bge(t) | CilOp::BgeS(t) => self.compare_branch(">=", false, *t),
            CilOp::Bgt(t) | CilOp::BgtS(t) => self.compare_branch(">", false, *t),
            CilOp::Ble(t) | CilOp::BleS(t) => self.compare_branch("<=", false, *t),
            CilOp::Blt(t) | CilOp::BltS(t) => self.compare_branch("<", false, *t),
            CilOp::BneUn(t) | CilOp::BneUnS(t) => self.compare_branch("!=", false, *t),
            CilOp::BgeUn(t) | CilOp::BgeUnS(t) => self.compare_branch(">=", true, *t),
            CilOp::BgtUn(t) | CilOp::BgtUnS(t) => self.compare_branch(">", true, *t),
            CilOp::BleUn(t) | CilOp::BleUnS(t) => self.compare_branch("<=", true, *t),
            CilOp::BltUn(t) | CilOp::BltUnS(t) => self.compare_branch("<", true, *t),
            CilOp::Switch(targets) => {
                let value = self.pop();
                let cases: Vec<String> = targets.iter().map(|t| label_name(*t)).collect();
                for t in targets {
                    self.save_snapshot(*t);
                }
                self.emit(InstKind::Switch {
                    value: value.expr,
                    cases,
                });
                self.pushed_since_cond_branch = 0;
            }

            // -- conversions --
            CilOp::Conv(kind) => self.conversion(*kind),
            CilOp::ConvRUn => {
                // Reinterpret at the source width before the float
                // conversion: int32 stays uint32, int64 stays uint64.
                let x = self.pop();
                let temp = self.typed_temp("double");
                self.emit(InstKind::Conversion {
                    src: Self::un_wrap(&x.expr),
                    target_type: "double".into(),
                    result: temp.clone(),
                });
                self.stack.push(StackEntry::typed(temp, "double"));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::ConvOvf(kind) => self.checked_conversion(*kind, false),
            CilOp::ConvOvfUn(kind) => self.checked_conversion(*kind, true),

            // -- fields --
            CilOp::LdFld(f) => self.field_load(f),
            CilOp::LdFldA(f) => self.field_address(f),
            CilOp::StFld(f) => self.field_store(f),
            CilOp::LdsFld(f) => self.static_field_load(f),
            CilOp::LdsFldA(f) => {
                let name = self.static_field_name(f);
                let ty = self.resolver.cpp_type(&f.field_type);
                let entry = StackEntry::typed(format!("&{}", name), format!("{}*", ty));
                self.push(entry);
            }
            CilOp::StsFld(f) => self.static_field_store(f),

            // -- indirect access --
            CilOp::LdInd(kind) => {
                let ty = Self::num_cpp(*kind);
                self.indirect_load(ty.to_string());
            }
            CilOp::StInd(kind) => {
                let ty = Self::num_cpp(*kind);
                self.indirect_store(ty.to_string());
            }
            CilOp::LdObj(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                self.indirect_load(cpp);
            }
            CilOp::StObj(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                self.indirect_store(cpp);
            }
            CilOp::CpObj(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                let src = self.pop();
                let dst = self.pop();
                self.emit(InstKind::RawCpp {
                    code: format!(
                        "*({ty}*)({dst}) = *({ty}*)({src});",
                        ty = cpp,
                        dst = dst.expr,
                        src = src.expr
                    ),
                    result: None,
                    result_type: None,
                });
            }

            // -- arrays --
            CilOp::NewArr(elem) => {
                let len = self.pop();
                let info = self.type_info_expr(elem);
                let temp = self.typed_temp("Array*");
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::array_new".into(),
                    args: vec![info, len.expr],
                    result: Some(temp.clone()),
                    result_type: Some("Array*".into()),
                    deferred_disambig_key: String::new(),
                });
                self.stack.push(StackEntry::typed(temp, "Array*"));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::LdLen => {
                let arr = self.pop();
                let temp = self.typed_temp("intptr_t");
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::array_get_length".into(),
                    args: vec![arr.expr],
                    result: Some(temp.clone()),
                    result_type: Some("intptr_t".into()),
                    deferred_disambig_key: String::new(),
                });
                self.stack.push(StackEntry::typed(temp, "intptr_t"));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::LdElem(kind) => {
                let ty = Self::num_cpp(*kind).to_string();
                self.element_load(ty);
            }
            CilOp::LdElemAny(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                self.element_load(cpp);
            }
            CilOp::StElem(kind) => {
                let ty = Self::num_cpp(*kind).to_string();
                let forced_cast = matches!(kind, NumKind::Ref);
                self.element_store(ty, forced_cast);
            }
            CilOp::StElemAny(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                self.element_store(cpp, false);
            }
            CilOp::LdElemA(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                let index = self.pop();
                let arr = self.pop();
                let expr = format!(
                    "&(({ty}*)cil2cpp::array_data({arr}))[{idx}]",
                    ty = cpp,
                    arr = arr.expr,
                    idx = index.expr
                );
                self.push(StackEntry::typed(expr, format!("{}*", cpp)));
            }

            // -- object model --
            CilOp::CastClass(ty) => self.cast_class(ty, false),
            CilOp::IsInst(ty) => self.cast_class(ty, true),
            CilOp::Box(ty) => self.box_value(ty),
            CilOp::Unbox(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                let obj = self.pop();
                let ptr_ty = format!("{}*", cpp);
                let temp = self.typed_temp(&ptr_ty);
                self.emit(InstKind::Unbox {
                    object: obj.expr,
                    value_type: cpp,
                    result: temp.clone(),
                    is_unbox_any: false,
                    result_type: Some(ptr_ty.clone()),
                });
                self.stack.push(StackEntry::typed(temp, ptr_ty));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::UnboxAny(ty) => self.unbox_any(ty),
            CilOp::InitObj(ty) => {
                let addr = self.pop();
                // Reference-ness comes from the resolver's metadata
                // cache, with the primitive table as fallback.
                let reference = self.resolver.is_reference_type(ty);
                let cpp = self.resolver.cpp_type(ty);
                self.emit(InstKind::InitObj {
                    address: addr.expr,
                    type_name: cpp,
                    is_reference_type: reference,
                });
            }
            CilOp::MkRefAny(ty) => {
                let addr = self.pop();
                let info = self.type_info_expr(ty);
                let temp = self.typed_temp("cil2cpp::TypedRef");
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::mkrefany".into(),
                    args: vec![addr.expr, info],
                    result: Some(temp.clone()),
                    result_type: Some("cil2cpp::TypedRef".into()),
                    deferred_disambig_key: String::new(),
                });
                self.stack.push(StackEntry::typed(temp, "cil2cpp::TypedRef"));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::RefAnyVal(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                let tr = self.pop();
                let ptr_ty = format!("{}*", cpp);
                let info = self.type_info_expr(ty);
                let temp = self.typed_temp(&ptr_ty);
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::refanyval".into(),
                    args: vec![tr.expr, info],
                    result: Some(temp.clone()),
                    result_type: Some(ptr_ty.clone()),
                    deferred_disambig_key: String::new(),
                });
                self.stack.push(StackEntry::typed(temp, ptr_ty));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::RefAnyType => {
                let tr = self.pop();
                let temp = self.typed_temp("TypeInfo*");
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::refanytype".into(),
                    args: vec![tr.expr],
                    result: Some(temp.clone()),
                    result_type: Some("TypeInfo*".into()),
                    deferred_disambig_key: String::new(),
                });
                self.stack.push(StackEntry::typed(temp, "TypeInfo*"));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::ArgList => {
                let temp = self.typed_temp("intptr_t");
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::arglist".into(),
                    args: vec![],
                    result: Some(temp.clone()),
                    result_type: Some("intptr_t".into()),
                    deferred_disambig_key: String::new(),
                });
                self.stack.push(StackEntry::typed(temp, "intptr_t"));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::SizeOf(ty) => {
                let cpp = self.resolver.cpp_type(ty);
                self.push(StackEntry::typed(format!("sizeof({})", cpp), "uint32_t"));
            }
            CilOp::LdToken(token) => self.ld_token(offset, op, token),

            // -- exception control --
            CilOp::Throw => {
                let exc = self.pop();
                self.emit(InstKind::Throw { expr: exc.expr });
                self.stack.clear();
                self.unreachable = true;
            }
            CilOp::Rethrow => {
                self.emit(InstKind::Rethrow);
                self.stack.clear();
                self.unreachable = true;
            }
            CilOp::Leave(t) | CilOp::LeaveS(t) => {
                // Leave empties the stack either way.
                self.stack.clear();
                if !self.regions.leave_is_suppressed(offset, *t) {
                    self.save_snapshot(*t);
                    self.emit(InstKind::Branch {
                        target: label_name(*t),
                    });
                }
                self.unreachable = true;
            }
            CilOp::EndFinally => {
                self.stack.clear();
                self.unreachable = true;
            }
            CilOp::EndFilter => {
                let result = self.pop();
                self.emit(InstKind::Assign {
                    target: "__filter_result".into(),
                    value: result.expr,
                });
                self.emit(InstKind::EndFilter);
                self.stack.clear();
                self.unreachable = true;
            }

            // -- calls --
            CilOp::Call(m) => self.lower_call(offset, m, false),
            CilOp::CallVirt(m) => self.lower_call(offset, m, true),
            CilOp::Calli(sig) => self.lower_calli(sig),
            CilOp::NewObj(m) => self.lower_newobj(m),
            CilOp::Jmp(m) => self.lower_jmp(m),
            CilOp::LdFtn(m) => self.lower_ldftn(m),
            CilOp::LdVirtFtn(m) => self.lower_ldvirtftn(offset, op, m),
            CilOp::Ret => {
                if self.shell.return_type == "void" {
                    self.emit(InstKind::Return { value: None });
                } else if let Some(value) = self.stack.pop() {
                    let coerced = self.coerce(&value, &self.shell.return_type);
                    self.emit(InstKind::Return {
                        value: Some(coerced),
                    });
                } else {
                    self.emit(InstKind::Return { value: None });
                }
                self.stack.clear();
                self.unreachable = true;
            }

            // -- block operations --
            CilOp::CpBlk => {
                let size = self.pop();
                let src = self.pop();
                let dst = self.pop();
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::cpblk".into(),
                    args: vec![dst.expr, src.expr, size.expr],
                    result: None,
                    result_type: None,
                    deferred_disambig_key: String::new(),
                });
            }
            CilOp::InitBlk => {
                let size = self.pop();
                let value = self.pop();
                let dst = self.pop();
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::initblk".into(),
                    args: vec![dst.expr, value.expr, size.expr],
                    result: None,
                    result_type: None,
                    deferred_disambig_key: String::new(),
                });
            }
            CilOp::CkFinite => {
                let x = self.pop();
                let ty = x.ty.clone().unwrap_or_else(|| "double".to_string());
                let temp = self.typed_temp(&ty);
                self.emit(InstKind::Call {
                    function_name: "cil2cpp::ck_finite".into(),
                    args: vec![x.expr],
                    result: Some(temp.clone()),
                    result_type: Some(ty.clone()),
                    deferred_disambig_key: String::new(),
                });
                self.stack.push(StackEntry::typed(temp, ty));
                self.pushed_since_cond_branch += 1;
            }
            CilOp::LocAlloc => {
                let size = self.pop();
                let temp = self.typed_temp("uint8_t*");
                self.emit(InstKind::RawCpp {
                    code: format!("(uint8_t*)alloca({})", size.expr),
                    result: Some(temp.clone()),
                    result_type: Some("uint8_t*".into()),
                });
                self.stack.push(StackEntry::typed(temp, "uint8_t*"));
                self.pushed_since_cond_branch += 1;
            }

            // Prefixes are consumed by the run loop.
            CilOp::Volatile
            | CilOp::Constrained(_)
            | CilOp::Tail
            | CilOp::Readonly
            | CilOp::Unaligned(_)
            | CilOp::NoCheck(_) => {}
        }
    }

    /// Soft failure: comment at the site, warning in the sink, stack left
    /// as it was. Compilation continues.
    fn soft_fail(&mut self, offset: u32, op: &CilOp, detail: &str) {
        self.emit(InstKind::Comment {
            text: format!("unsupported: {} ({})", op.mnemonic(), detail),
        });
        self.sink
            .warn_opcode(&self.shell.cpp_name, op.mnemonic(), offset, detail);
    }

    // ---- arithmetic helpers ----

    fn binary(&mut self, op: &str, unsigned: bool) {
        let b = self.pop();
        let a = self.pop();
        let ty = a.ty.clone().or_else(|| b.ty.clone());
        let temp = self.temp();
        if let Some(t) = &ty {
            self.temp_var_types.insert(temp.clone(), t.clone());
        }
        let (lhs, rhs) = if unsigned {
            (Self::un_wrap(&a.expr), Self::un_wrap(&b.expr))
        } else {
            (a.expr, b.expr)
        };
        self.emit(InstKind::BinaryOp {
            op: op.into(),
            a: lhs,
            b: rhs,
            result: temp.clone(),
            result_type: ty.clone(),
        });
        self.stack.push(StackEntry { expr: temp, ty });
        self.pushed_since_cond_branch += 1;
    }

    /// `add`/`sub` over typed pointers is byte-offset arithmetic through
    /// a `uint8_t*` intermediate, never scaled pointer arithmetic.
    fn binary_maybe_pointer(&mut self, op: &str) {
        let involves_pointer = {
            let n = self.stack.len();
            let a = n.checked_sub(2).and_then(|i| self.stack.get(i));
            let b = self.stack.last();
            let ptrish =
                |e: &StackEntry| e.is_pointer() || e.is_address_of();
            a.is_some_and(|e| ptrish(e)) || b.is_some_and(|e| ptrish(e))
        };
        if !involves_pointer {
            return self.binary(op, false);
        }
        let b = self.pop();
        let a = self.pop();
        let ptr_ty = if a.is_pointer() {
            a.ty.clone().unwrap_or_else(|| "uint8_t*".to_string())
        } else if b.is_pointer() {
            b.ty.clone().unwrap_or_else(|| "uint8_t*".to_string())
        } else {
            "uint8_t*".to_string()
        };
        let temp = self.typed_temp(&ptr_ty);
        self.emit(InstKind::RawCpp {
            code: format!(
                "({ty})((uint8_t*)({a}) {op} ({b}))",
                ty = ptr_ty,
                a = a.expr,
                op = op,
                b = b.expr
            ),
            result: Some(temp.clone()),
            result_type: Some(ptr_ty.clone()),
        });
        self.stack.push(StackEntry::typed(temp, ptr_ty));
        self.pushed_since_cond_branch += 1;
    }

    fn checked_binary(&mut self, helper: &str, unsigned: bool) {
        let b = self.pop();
        let a = self.pop();
        let ty = a.ty.clone().or_else(|| b.ty.clone());
        let temp = self.temp();
        if let Some(t) = &ty {
            self.temp_var_types.insert(temp.clone(), t.clone());
        }
        let args = if unsigned {
            vec![Self::un_wrap(&a.expr), Self::un_wrap(&b.expr)]
        } else {
            vec![a.expr, b.expr]
        };
        self.emit(InstKind::Call {
            function_name: helper.into(),
            args,
            result: Some(temp.clone()),
            result_type: ty.clone(),
            deferred_disambig_key: String::new(),
        });
        self.stack.push(StackEntry { expr: temp, ty });
        self.pushed_since_cond_branch += 1;
    }

    fn unary(&mut self, op: &str) {
        let x = self.pop();
        let ty = x.ty.clone();
        let temp = self.temp();
        if let Some(t) = &ty {
            self.temp_var_types.insert(temp.clone(), t.clone());
        }
        self.emit(InstKind::UnaryOp {
            op: op.into(),
            x: x.expr,
            result: temp.clone(),
            result_type: ty.clone(),
        });
        self.stack.push(StackEntry { expr: temp, ty });
        self.pushed_since_cond_branch += 1;
    }

    fn compare(&mut self, op: &str, unsigned: bool) {
        let b = self.pop();
        let a = self.pop();
        let (lhs, rhs) = if unsigned && !a.is_pointer() && !b.is_null() {
            (Self::un_wrap(&a.expr), Self::un_wrap(&b.expr))
        } else {
            (a.expr, b.expr)
        };
        let temp = self.typed_temp("int32_t");
        self.emit(InstKind::BinaryOp {
            op: op.into(),
            a: lhs,
            b: rhs,
            result: temp.clone(),
            result_type: Some("int32_t".into()),
        });
        self.stack.push(StackEntry::typed(temp, "int32_t"));
        self.pushed_since_cond_branch += 1;
    }

    fn compare_branch(&mut self, op: &str, unsigned: bool, target: u32) {
        let b = self.pop();
        let a = self.pop();
        let (lhs, rhs) = if unsigned && !a.is_pointer() && !b.is_null() {
            (Self::un_wrap(&a.expr), Self::un_wrap(&b.expr))
        } else {
            (a.expr, b.expr)
        };
        self.branch_conditional(format!("({}) {} ({})", lhs, op, rhs), target);
    }

    // ---- conversions ----

    fn conversion(&mut self, kind: NumKind) {
        let x = self.pop();
        // conv.u / conv.i on a typed pointer preserves the pointer, and
        // literal zero stays a null-pointer constant.
        if matches!(kind, NumKind::I | NumKind::U)
            && (x.is_pointer() || x.is_address_of() || x.expr == "0")
        {
            self.stack.push(x);
            return;
        }
        let ty = Self::num_cpp(kind);
        let temp = self.typed_temp(ty);
        self.emit(InstKind::Conversion {
            src: x.expr,
            target_type: ty.into(),
            result: temp.clone(),
        });
        self.stack.push(StackEntry::typed(temp, ty));
        self.pushed_since_cond_branch += 1;
    }

    fn checked_conversion(&mut self, kind: NumKind, unsigned: bool) {
        let x = self.pop();
        let ty = Self::num_cpp(kind);
        let temp = self.typed_temp(ty);
        let arg = if unsigned {
            Self::un_wrap(&x.expr)
        } else {
            x.expr
        };
        self.emit(InstKind::Call {
            function_name: format!("cil2cpp::checked_conv<{}>", ty),
            args: vec![arg],
            result: Some(temp.clone()),
            result_type: Some(ty.into()),
            deferred_disambig_key: String::new(),
        });
        self.stack.push(StackEntry::typed(temp, ty));
        self.pushed_since_cond_branch += 1;
    }

    // ---- field access ----

    fn object_access(&self, obj: &StackEntry, declaring: &str) -> (String, bool, Option<String>) {
        let is_value_access = !obj.is_pointer()
            && !obj.is_address_of()
            && obj.ty.as_deref().is_some_and(|t| !t.ends_with('*'));
        let cast_to = if obj.ty.is_none() && !is_value_access {
            Some(format!("{}*", self.type_cpp_base(declaring)))
        } else {
            None
        };
        (obj.expr.clone(), is_value_access, cast_to)
    }

    fn field_load(&mut self, f: &FieldRef) {
        let volatile = std::mem::take(&mut self.pending_volatile);
        if volatile {
            self.memory_fence();
        }
        let obj = self.pop();
        let (object, is_value_access, cast_to_type) = self.object_access(&obj, &f.declaring_type);
        let ty = self.resolver.cpp_type(&f.field_type);
        let temp = self.typed_temp(&ty);
        self.emit(InstKind::FieldAccess {
            object,
            field: f.name.clone(),
            is_store: false,
            store_value: None,
            is_value_access,
            cast_to_type,
            result: Some(temp.clone()),
            result_type: Some(ty.clone()),
        });
        self.stack.push(StackEntry::typed(temp, ty));
        self.pushed_since_cond_branch += 1;
    }

    fn field_store(&mut self, f: &FieldRef) {
        let volatile = std::mem::take(&mut self.pending_volatile);
        let value = self.pop();
        let obj = self.pop();
        let (object, is_value_access, cast_to_type) = self.object_access(&obj, &f.declaring_type);
        let ty = self.resolver.cpp_type(&f.field_type);
        let coerced = self.coerce(&value, &ty);
        self.emit(InstKind::FieldAccess {
            object,
            field: f.name.clone(),
            is_store: true,
            store_value: Some(coerced),
            is_value_access,
            cast_to_type,
            result: None,
            result_type: None,
        });
        if volatile {
            self.memory_fence();
        }
    }

    fn field_address(&mut self, f: &FieldRef) {
        let obj = self.pop();
        let (object, is_value_access, _) = self.object_access(&obj, &f.declaring_type);
        let sep = if is_value_access { "." } else { "->" };
        let ty = self.resolver.cpp_type(&f.field_type);
        let expr = format!("&{}{}{}", object, sep, f.name);
        self.push(StackEntry::typed(expr, format!("{}*", ty)));
    }

    fn static_field_name(&self, f: &FieldRef) -> String {
        crate::mangle::mangle_field_name(&self.type_cpp_base(&f.declaring_type), &f.name)
    }

    fn static_field_load(&mut self, f: &FieldRef) {
        let volatile = std::mem::take(&mut self.pending_volatile);
        if volatile {
            self.memory_fence();
        }
        let name = self.static_field_name(f);
        let ty = self.resolver.cpp_type(&f.field_type);
        let temp = self.typed_temp(&ty);
        self.emit(InstKind::StaticFieldAccess {
            field: name,
            is_store: false,
            store_value: None,
            result: Some(temp.clone()),
            result_type: Some(ty.clone()),
        });
        self.stack.push(StackEntry::typed(temp, ty));
        self.pushed_since_cond_branch += 1;
    }

    fn static_field_store(&mut self, f: &FieldRef) {
        let volatile = std::mem::take(&mut self.pending_volatile);
        let value = self.pop();
        let name = self.static_field_name(f);
        let ty = self.resolver.cpp_type(&f.field_type);
        let coerced = self.coerce(&value, &ty);
        self.emit(InstKind::StaticFieldAccess {
            field: name,
            is_store: true,
            store_value: Some(coerced),
            result: None,
            result_type: None,
        });
        if volatile {
            self.memory_fence();
        }
    }

    fn memory_fence(&mut self) {
        self.emit(InstKind::Call {
            function_name: "cil2cpp::memory_barrier".into(),
            args: vec![],
            result: None,
            result_type: None,
            deferred_disambig_key: String::new(),
        });
    }

    // ---- indirect access ----

    fn indirect_load(&mut self, cpp: String) {
        let volatile = std::mem::take(&mut self.pending_volatile);
        if volatile {
            self.memory_fence();
        }
        let addr = self.pop();
        let want = format!("{}*", cpp);
        let code = if addr.ty.as_deref() == Some(want.as_str()) {
            format!("*({})", addr.expr)
        } else {
            format!("*({}*)({})", cpp, addr.expr)
        };
        let temp = self.typed_temp(&cpp);
        self.emit(InstKind::RawCpp {
            code,
            result: Some(temp.clone()),
            result_type: Some(cpp.clone()),
        });
        self.stack.push(StackEntry::typed(temp, cpp));
        self.pushed_since_cond_branch += 1;
    }

    fn indirect_store(&mut self, cpp: String) {
        let volatile = std::mem::take(&mut self.pending_volatile);
        let value = self.pop();
        let addr = self.pop();
        self.emit(InstKind::RawCpp {
            code: format!(
                "*({}*)({}) = {};",
                cpp, addr.expr, value.expr
            ),
            result: None,
            result_type: None,
        });
        if volatile {
            self.memory_fence();
        }
    }

    // ---- array elements ----

    fn element_load(&mut self, cpp: String) {
        let index = self.pop();
        let arr = self.pop();
        let temp = self.typed_temp(&cpp);
        self.emit(InstKind::ArrayAccess {
            array: arr.expr,
            index: index.expr,
            element_type: cpp.clone(),
            is_store: false,
            store_value: None,
            result: Some(temp.clone()),
        });
        self.stack.push(StackEntry::typed(temp, cpp));
        self.pushed_since_cond_branch += 1;
    }

    fn element_store(&mut self, cpp: String, forced_cast: bool) {
        let value = self.pop();
        let index = self.pop();
        let arr = self.pop();
        let store_value = if forced_cast
            || (cpp.ends_with('*') && value.ty.as_deref() != Some(cpp.as_str()))
        {
            format!("({})({})", cpp, value.expr)
        } else {
            value.expr
        };
        self.emit(InstKind::ArrayAccess {
            array: arr.expr,
            index: index.expr,
            element_type: cpp,
            is_store: true,
            store_value: Some(store_value),
            result: None,
        });
    }

    // ---- object model ----

    fn cast_class(&mut self, ty: &str, safe: bool) {
        let cpp = self.resolver.cpp_type(ty);
        let obj = self.pop();
        let temp = self.typed_temp(&cpp);
        self.emit(InstKind::Cast {
            src: obj.expr,
            target_type: cpp.clone(),
            result: temp.clone(),
            safe,
            type_info_name: Some(self.type_info_expr(ty)),
        });
        self.stack.push(StackEntry::typed(temp, cpp));
        self.pushed_since_cond_branch += 1;
    }

    fn box_value(&mut self, ty: &str) {
        let resolved = self.resolver.resolve_generic_param(ty).to_string();
        let value = self.pop();
        // Boxing a reference type is a plain cast.
        if self.resolver.is_reference_type(&resolved) {
            let temp = self.typed_temp("Object*");
            self.emit(InstKind::Cast {
                src: value.expr,
                target_type: "Object*".into(),
                result: temp.clone(),
                safe: false,
                type_info_name: None,
            });
            self.stack.push(StackEntry::typed(temp, "Object*"));
            self.pushed_since_cond_branch += 1;
            return;
        }
        if let Some(inner) = nullable_inner(&resolved) {
            let inner_cpp = self.resolver.cpp_type(&inner);
            let info = self.type_info_expr(&inner);
            let temp = self.typed_temp("Object*");
            self.emit(InstKind::Call {
                function_name: format!("cil2cpp::box_nullable<{}>", inner_cpp),
                args: vec![value.expr, info],
                result: Some(temp.clone()),
                result_type: Some("Object*".into()),
                deferred_disambig_key: String::new(),
            });
            self.stack.push(StackEntry::typed(temp, "Object*"));
            self.pushed_since_cond_branch += 1;
            return;
        }
        let cpp = self.resolver.cpp_type(&resolved);
        let temp = self.typed_temp("Object*");
        self.emit(InstKind::Box {
            value: value.expr,
            value_type: cpp,
            type_info_name: Some(self.type_info_expr(&resolved)),
            result: temp.clone(),
        });
        self.stack.push(StackEntry::typed(temp, "Object*"));
        self.pushed_since_cond_branch += 1;
    }

    fn unbox_any(&mut self, ty: &str) {
        let resolved = self.resolver.resolve_generic_param(ty).to_string();
        if self.resolver.is_reference_type(&resolved) {
            return self.cast_class(&resolved, false);
        }
        let obj = self.pop();
        if let Some(inner) = nullable_inner(&resolved) {
            // Reconstruct the nullable: zero-initialized, then populated
            // when the reference is non-null.
            let cpp = self.resolver.cpp_type(&resolved);
            let inner_cpp = self.resolver.cpp_type(&inner);
            let temp = self.temp();
            self.emit(InstKind::DeclareLocal {
                name: temp.clone(),
                ty: cpp.clone(),
            });
            self.emit(InstKind::RawCpp {
                code: format!(
                    "if ({obj} != nullptr) {{ {t}.hasValue = true; {t}.value = *({inner}*)cil2cpp::unbox({obj}); }}",
                    obj = obj.expr,
                    t = temp,
                    inner = inner_cpp
                ),
                result: None,
                result_type: None,
            });
            self.stack.push(StackEntry::typed(temp, cpp));
            self.pushed_since_cond_branch += 1;
            return;
        }
        let cpp = self.resolver.cpp_type(&resolved);
        let temp = self.typed_temp(&cpp);
        self.emit(InstKind::Unbox {
            object: obj.expr,
            value_type: cpp.clone(),
            result: temp.clone(),
            is_unbox_any: true,
            result_type: Some(cpp.clone()),
        });
        self.stack.push(StackEntry::typed(temp, cpp));
        self.pushed_since_cond_branch += 1;
    }

    fn ld_token(&mut self, offset: u32, op: &CilOp, token: &TokenRef) {
        match token {
            TokenRef::Type(ty) => {
                let expr = self.type_info_expr(ty);
                self.push(StackEntry::typed(expr, "TypeInfo*"));
            }
            TokenRef::Field(f) => {
                let rva = self
                    .source
                    .get_type(&f.declaring_type)
                    .and_then(|t| t.fields.iter().find(|fd| fd.name == f.name))
                    .and_then(|fd| fd.rva_data.clone());
                match rva {
                    Some(bytes) => {
                        let id = self.pools.array_inits.lock().intern(&bytes);
                        self.push(StackEntry::typed(
                            format!("(uint8_t*){}", id),
                            "uint8_t*",
                        ));
                    }
                    None => {
                        self.soft_fail(offset, op, "field token without RVA data");
                        self.push(StackEntry::typed("0", "intptr_t"));
                    }
                }
            }
            TokenRef::Method(_) => {
                self.push(StackEntry::typed("0", "intptr_t"));
            }
        }
    }

    // ---- calls ----

    /// Base mangled name for a call target, with monomorphized type
    /// arguments appended for generic method instantiations.
    fn callee_base_name(&self, mref: &MethodRef) -> String {
        let type_cpp = self.type_cpp_base(&mref.declaring_type);
        let mut name = mangle_method_name(&type_cpp, &mref.name, &mref.return_type);
        if mref.is_generic_instance() {
            for arg in &mref.generic_args {
                name.push('_');
                name.push_str(&mangle_type_name(arg));
            }
            let key = format!(
                "{}::{}<{}>",
                mref.declaring_type,
                mref.name,
                mref.generic_args.join(",")
            );
            let mut table = self.pools.instantiations.lock();
            if let Some(existing) = table.get(&key) {
                return existing.clone();
            }
            table.insert(key, name.clone());
        }
        name
    }

    fn generic_context_of(mref: &MethodRef) -> HashMap<String, String> {
        let mut map = HashMap::new();
        if let Some(first) = mref.generic_args.first() {
            map.insert("T".to_string(), first.clone());
        }
        map
    }

    fn try_icall(&mut self, mref: &MethodRef) -> Option<&'static str> {
        let subst = Self::generic_context_of(mref);
        let first_param = mref
            .params
            .first()
            .map(|p| crate::mangle::substitute_generic_params(p, &subst));
        let first_ref = mref
            .generic_args
            .first()
            .map(|a| self.resolver.is_reference_type(a))
            .unwrap_or(false);
        let query = ICallQuery {
            declaring_type: &mref.declaring_type,
            method_name: &mref.name,
            param_count: mref.params.len(),
            first_param_il: first_param.as_deref(),
            is_generic_method: mref.is_generic_instance(),
            first_type_arg_is_reference: first_ref,
        };
        let target = ICALLS.lookup(&query)?;
        self.pools.icall_flagged.lock().insert((
            mref.declaring_type.clone(),
            mref.name.clone(),
            mref.params.len(),
        ));
        Some(target)
    }

    fn pop_args(&mut self, mref: &MethodRef) -> Vec<StackEntry> {
        let mut args: Vec<StackEntry> = (0..mref.params.len()).map(|_| self.pop()).collect();
        args.reverse();
        args
    }

    fn coerced_args(&self, mref: &MethodRef, args: &[StackEntry]) -> Vec<String> {
        args.iter()
            .zip(&mref.params)
            .map(|(a, p)| {
                let want = self.resolver.cpp_type(p);
                if is_generic_sentinel(p) || is_generic_sentinel(want.trim_end_matches('*')) {
                    a.expr.clone()
                } else {
                    self.coerce(a, &want)
                }
            })
            .collect()
    }

    fn push_call_result(&mut self, mref: &MethodRef, function_name: String, args: Vec<String>, key: String) {
        if mref.return_type == "System.Void" {
            self.emit(InstKind::Call {
                function_name,
                args,
                result: None,
                result_type: None,
                deferred_disambig_key: key,
            });
        } else {
            let ret = self.resolver.cpp_type(&mref.return_type);
            let temp = self.typed_temp(&ret);
            self.emit(InstKind::Call {
                function_name,
                args,
                result: Some(temp.clone()),
                result_type: Some(ret.clone()),
                deferred_disambig_key: key,
            });
            self.stack.push(StackEntry::typed(temp, ret));
            self.pushed_since_cond_branch += 1;
        }
    }

    fn lower_call(&mut self, offset: u32, mref: &MethodRef, virtual_call: bool) {
        let constrained = if virtual_call {
            self.constrained_type.take()
        } else {
            None
        };

        // Internal-call mappings take precedence over IL bodies. A
        // pending constrained prefix owns the dispatch decision instead.
        if constrained.is_none() {
            if let Some(target) = self.try_icall(mref) {
                let args = self.pop_args(mref);
                let mut arg_exprs: Vec<String> = args.iter().map(|a| a.expr.clone()).collect();
                if mref.has_this {
                    let this = self.pop();
                    arg_exprs.insert(0, this.expr);
                }
                self.push_call_result(mref, target.to_string(), arg_exprs, String::new());
                return;
            }
        }

        // Nullable<T> members lower inline.
        if mref.has_this && is_nullable_type(&mref.declaring_type) {
            let args = self.pop_args(mref);
            let this = self.pop();
            let inner = nullable_inner(&mref.declaring_type)
                .unwrap_or_else(|| "T".to_string());
            let inner_cpp = self.resolver.cpp_type(&inner);
            match lower_nullable_call(&mref.name, &this, &args, &inner_cpp) {
                Some((insts, value)) => {
                    for kind in insts {
                        self.emit(kind);
                    }
                    if let Some(entry) = value {
                        self.push(entry);
                    }
                    return;
                }
                None => {
                    self.soft_fail(offset, &CilOp::Call(mref.clone()), "unhandled Nullable member");
                    return;
                }
            }
        }

        let args = self.pop_args(mref);
        let mut arg_exprs = self.coerced_args(mref, &args);

        let mut this_entry = None;
        if mref.has_this {
            this_entry = Some(self.pop());
        }

        // Delegate invocation dispatches through the delegate object.
        if virtual_call && mref.name == "Invoke" {
            let is_delegate = self
                .module
                .type_by_name(&mref.declaring_type)
                .and_then(|t| t.base_type.as_deref())
                .is_some_and(|b| b == "System.MulticastDelegate" || b == "System.Delegate");
            if is_delegate {
                if let Some(this) = this_entry.take() {
                    if mref.return_type == "System.Void" {
                        self.emit(InstKind::DelegateInvoke {
                            delegate: this.expr,
                            args: arg_exprs,
                            result: None,
                            result_type: None,
                        });
                    } else {
                        let ret = self.resolver.cpp_type(&mref.return_type);
                        let temp = self.typed_temp(&ret);
                        self.emit(InstKind::DelegateInvoke {
                            delegate: this.expr,
                            args: arg_exprs,
                            result: Some(temp.clone()),
                            result_type: Some(ret.clone()),
                        });
                        self.stack.push(StackEntry::typed(temp, ret));
                        self.pushed_since_cond_branch += 1;
                    }
                    return;
                }
            }
        }

        // Constrained dispatch: the prefix type decides between a direct
        // value-type call and reference-type vtable dispatch.
        if let Some(ctype) = &constrained {
            if let Some(this) = this_entry.take() {
                if self.resolver.is_value_type(ctype) {
                    let direct = self
                        .module
                        .type_by_name(ctype)
                        .filter(|ty| ty.methods.iter().any(|m| m.il_name == mref.name))
                        .map(|ty| ty.cpp_name.clone());
                    if let Some(type_cpp) = direct {
                        // The value type implements it: direct call with
                        // the managed pointer as receiver.
                        let name = mangle_method_name(&type_cpp, &mref.name, &mref.return_type);
                        let key = disambig_key(&name, &mref.params);
                        let mut all = vec![this.expr];
                        all.extend(arg_exprs);
                        self.push_call_result(mref, name, all, key);
                        return;
                    }
                    // No direct implementation: box the value, then
                    // dispatch through the reference-type path.
                    let cpp = self.resolver.cpp_type(ctype);
                    let boxed = self.typed_temp("Object*");
                    self.emit(InstKind::Box {
                        value: format!("*({}*)({})", cpp, this.expr),
                        value_type: cpp,
                        type_info_name: Some(self.type_info_expr(ctype)),
                        result: boxed.clone(),
                    });
                    this_entry = Some(StackEntry::typed(boxed, "Object*"));
                } else {
                    // Reference type: the receiver slot holds a pointer
                    // to the object reference; load it.
                    let cpp = self.resolver.cpp_type(ctype);
                    this_entry = Some(StackEntry::typed(
                        format!("*({}*)({})", cpp, this.expr),
                        cpp,
                    ));
                }
            }
        }

        // Virtual dispatch goes through the vtable (or the interface
        // table) with a calli-style function-pointer cast.
        if virtual_call {
            if let Some(decl) = self.module.type_by_name(&mref.declaring_type) {
                let target = decl
                    .find_vtable_slot(&mref.name, mref.params.len())
                    .map(|s| (s.slot, decl.is_interface(), decl.cpp_name.clone()));
                let is_virtual_target = decl
                    .methods
                    .iter()
                    .any(|m| m.il_name == mref.name && m.is_virtual)
                    || decl.is_interface();
                if is_virtual_target {
                    match (target, this_entry.clone()) {
                        (Some((slot, is_interface, decl_cpp)), Some(this)) => {
                            let ret = self.resolver.cpp_type(&mref.return_type);
                            let mut cast_params = vec!["Object*".to_string()];
                            cast_params
                                .extend(mref.params.iter().map(|p| self.resolver.cpp_type(p)));
                            let lookup = if is_interface {
                                format!(
                                    "cil2cpp::interface_entry({}, &{}_TypeInfo, {})",
                                    this.expr, decl_cpp, slot
                                )
                            } else {
                                format!("cil2cpp::vtable_entry({}, {})", this.expr, slot)
                            };
                            let mut all = vec![format!("(Object*)({})", this.expr)];
                            all.extend(arg_exprs);
                            let code = format!(
                                "(({ret} (*)({params}))({lookup}))({args})",
                                ret = ret,
                                params = cast_params.join(", "),
                                lookup = lookup,
                                args = all.join(", ")
                            );
                            if mref.return_type == "System.Void" {
                                self.emit(InstKind::RawCpp {
                                    code: format!("{};", code),
                                    result: None,
                                    result_type: None,
                                });
                            } else {
                                let temp = self.typed_temp(&ret);
                                self.emit(InstKind::RawCpp {
                                    code,
                                    result: Some(temp.clone()),
                                    result_type: Some(ret.clone()),
                                });
                                self.stack.push(StackEntry::typed(temp, ret));
                                self.pushed_since_cond_branch += 1;
                            }
                            return;
                        }
                        (None, _) => {
                            self.soft_fail(
                                offset,
                                &CilOp::CallVirt(mref.clone()),
                                "no vtable slot for virtual target",
                            );
                        }
                        (Some(_), None) => {
                            self.soft_fail(
                                offset,
                                &CilOp::CallVirt(mref.clone()),
                                "virtual call without a receiver",
                            );
                        }
                    }
                }
            }
        }

        // Direct call.
        let name = self.callee_base_name(mref);
        let key = if self.module.has_type(&mref.declaring_type) && !mref.is_generic_instance() {
            disambig_key(&name, &mref.params)
        } else {
            String::new()
        };
        let mut all = Vec::with_capacity(arg_exprs.len() + 1);
        if let Some(this) = this_entry {
            all.push(this.expr);
        }
        all.append(&mut arg_exprs);
        self.push_call_result(mref, name, all, key);
    }

    fn lower_calli(&mut self, sig: &CallSig) {
        let fn_ptr = self.pop();
        let mut args: Vec<StackEntry> = (0..sig.params.len()).map(|_| self.pop()).collect();
        args.reverse();
        let mut arg_exprs: Vec<String> = args.into_iter().map(|a| a.expr).collect();
        let mut cast_params: Vec<String> = Vec::new();
        if sig.has_this {
            let this = self.pop();
            arg_exprs.insert(0, this.expr);
            cast_params.push("Object*".to_string());
        }
        cast_params.extend(sig.params.iter().map(|p| self.resolver.cpp_type(p)));
        let ret = self.resolver.cpp_type(&sig.return_type);
        let code = format!(
            "(({ret} (*)({params}))({fn_ptr}))({args})",
            ret = ret,
            params = cast_params.join(", "),
            fn_ptr = fn_ptr.expr,
            args = arg_exprs.join(", ")
        );
        if sig.return_type == "System.Void" {
            self.emit(InstKind::RawCpp {
                code: format!("{};", code),
                result: None,
                result_type: None,
            });
        } else {
            let temp = self.typed_temp(&ret);
            self.emit(InstKind::RawCpp {
                code,
                result: Some(temp.clone()),
                result_type: Some(ret.clone()),
            });
            self.stack.push(StackEntry::typed(temp, ret));
            self.pushed_since_cond_branch += 1;
        }
    }

    fn lower_newobj(&mut self, mref: &MethodRef) {
        // Delegate construction is (target object, function pointer).
        let is_delegate = self
            .module
            .type_by_name(&mref.declaring_type)
            .and_then(|t| t.base_type.as_deref())
            .is_some_and(|b| b == "System.MulticastDelegate" || b == "System.Delegate");
        let cpp = self.type_cpp_base(&mref.declaring_type);
        if is_delegate && mref.params.len() == 2 {
            let ftn = self.pop();
            let object = self.pop();
            let ty = format!("{}*", cpp);
            let temp = self.typed_temp(&ty);
            self.emit(InstKind::DelegateCreate {
                delegate_type: cpp,
                object: object.expr,
                method_name: ftn.expr,
                result: temp.clone(),
            });
            self.stack.push(StackEntry::typed(temp, ty));
            self.pushed_since_cond_branch += 1;
            return;
        }

        let args = self.pop_args(mref);
        let arg_exprs = self.coerced_args(mref, &args);
        // Constructor overloads collapse to one mangled name; use the
        // suffixed form the disambiguation pass will give them.
        let mut ctor_name = mangle_method_name(&cpp, &mref.name, &mref.return_type);
        let ctor_overloads = self
            .module
            .type_by_name(&mref.declaring_type)
            .map(|t| t.methods.iter().filter(|m| m.il_name == ".ctor").count())
            .unwrap_or(0);
        if ctor_overloads > 1 {
            let suffix = disambig_suffix(&mref.params);
            ctor_name = if suffix.is_empty() {
                format!("{}_0", ctor_name)
            } else {
                format!("{}_{}", ctor_name, suffix)
            };
        }
        let value_type = self.resolver.is_value_type(&mref.declaring_type);
        let result_ty = if value_type { cpp.clone() } else { format!("{}*", cpp) };
        let temp = self.typed_temp(&result_ty);
        self.emit(InstKind::NewObj {
            ctor_name,
            args: arg_exprs,
            result: temp.clone(),
            result_type: Some(result_ty.clone()),
        });
        self.stack.push(StackEntry::typed(temp, result_ty));
        self.pushed_since_cond_branch += 1;
    }

    /// `jmp` forwards the current parameters to the target and returns
    /// its result, with the same overload disambiguation as a call.
    fn lower_jmp(&mut self, mref: &MethodRef) {
        let name = self.callee_base_name(mref);
        let key = if self.module.has_type(&mref.declaring_type) && !mref.is_generic_instance() {
            disambig_key(&name, &mref.params)
        } else {
            String::new()
        };
        let args: Vec<String> = self.shell.params.iter().map(|p| p.name.clone()).collect();
        if mref.return_type == "System.Void" {
            self.emit(InstKind::Call {
                function_name: name,
                args,
                result: None,
                result_type: None,
                deferred_disambig_key: key,
            });
            self.emit(InstKind::Return { value: None });
        } else {
            let ret = self.resolver.cpp_type(&mref.return_type);
            let temp = self.typed_temp(&ret);
            self.emit(InstKind::Call {
                function_name: name,
                args,
                result: Some(temp.clone()),
                result_type: Some(ret),
                deferred_disambig_key: key,
            });
            self.emit(InstKind::Return { value: Some(temp) });
        }
        self.stack.clear();
        self.unreachable = true;
    }

    fn lower_ldftn(&mut self, mref: &MethodRef) {
        let name = self.callee_base_name(mref);
        let temp = self.typed_temp("void*");
        self.emit(InstKind::LoadFunctionPointer {
            method_name: name,
            result: temp.clone(),
            is_virtual: false,
            object: None,
            vtable_slot: None,
        });
        self.stack.push(StackEntry::typed(temp, "void*"));
        self.pushed_since_cond_branch += 1;
    }

    fn lower_ldvirtftn(&mut self, offset: u32, op: &CilOp, mref: &MethodRef) {
        let obj = self.pop();
        let slot = self
            .module
            .type_by_name(&mref.declaring_type)
            .and_then(|t| t.find_vtable_slot(&mref.name, mref.params.len()))
            .map(|s| s.slot);
        if slot.is_none() {
            self.soft_fail(offset, op, "no vtable slot for ldvirtftn target");
        }
        let name = self.callee_base_name(mref);
        let temp = self.typed_temp("void*");
        self.emit(InstKind::LoadFunctionPointer {
            method_name: name,
            result: temp.clone(),
            is_virtual: true,
            object: Some(obj.expr),
            vtable_slot: slot,
        });
        self.stack.push(StackEntry::typed(temp, "void*"));
        self.pushed_since_cond_branch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{IRLocal, IRParam, IRType, TypeFlags};
    use crate::metadata::{ExceptionHandler, HandlerKind, Instruction, MethodAttrs};
    use pretty_assertions::assert_eq;

    struct Harness {
        source: Module,
        module: IRModule,
        resolver: TypeResolver,
        pools: SharedPools,
        options: CompilerOptions,
        sink: DiagnosticSink,
    }

    impl Harness {
        fn new() -> Self {
            let mut resolver = TypeResolver::new();
            resolver.add_runtime_short("System.Object");
            resolver.add_runtime_short("System.String");
            Self {
                source: Module {
                    name: "t".into(),
                    entry_point: None,
                    types: vec![],
                    external_enums: Default::default(),
                },
                module: IRModule::new("t"),
                resolver,
                pools: SharedPools::default(),
                options: CompilerOptions::with_default_runtime_types(),
                sink: DiagnosticSink::new(),
            }
        }

        fn lower(&self, shell: &IRMethod, method: &MethodInfo) -> LoweredBody {
            lower_method_body(
                &self.source,
                &self.module,
                &self.resolver,
                &self.pools,
                &self.options,
                &self.sink,
                shell,
                method,
            )
        }
    }

    fn shell(params: &[(&str, &str)], locals: &[(&str, &str)], ret: &str) -> IRMethod {
        let mut m = IRMethod::new("F", "App_C_F");
        m.is_static = true;
        m.return_type = ret.to_string();
        m.params = params
            .iter()
            .map(|(name, ty)| IRParam {
                name: (*name).to_string(),
                cpp_type: (*ty).to_string(),
                il_type: String::new(),
            })
            .collect();
        m.locals = locals
            .iter()
            .map(|(name, ty)| IRLocal {
                name: (*name).to_string(),
                cpp_type: (*ty).to_string(),
                il_type: String::new(),
            })
            .collect();
        m
    }

    fn method(ops: Vec<(u32, CilOp)>) -> MethodInfo {
        MethodInfo {
            name: "F".into(),
            attrs: MethodAttrs::STATIC,
            params: vec![],
            return_type: "System.Void".into(),
            locals: vec![],
            body: ops
                .into_iter()
                .map(|(offset, op)| Instruction { offset, op })
                .collect(),
            handlers: vec![],
            sequence_points: vec![],
            pinvoke: None,
            generic_params: vec![],
            overrides: vec![],
        }
    }

    fn kinds(body: &LoweredBody) -> Vec<InstKind> {
        body.instructions.iter().map(|i| i.kind.clone()).collect()
    }

    #[test]
    fn ternary_lowering_uses_a_merge_temporary() {
        let h = Harness::new();
        let s = shell(&[("a0", "int32_t")], &[], "int32_t");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdArg(0)),
                (1, CilOp::BrTrueS(7)),
                (3, CilOp::LdcI4(0)),
                (5, CilOp::BrS(8)),
                (7, CilOp::LdcI4(1)),
                (8, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert_eq!(
            got,
            vec![
                InstKind::ConditionalBranch {
                    cond: "a0".into(),
                    true_label: "IL_0007".into()
                },
                InstKind::Assign { target: "__t0".into(), value: "0".into() },
                InstKind::Branch { target: "IL_0008".into() },
                InstKind::Label { name: "IL_0007".into() },
                InstKind::Assign { target: "__t0".into(), value: "1".into() },
                InstKind::Label { name: "IL_0008".into() },
                InstKind::Return { value: Some("__t0".into()) },
            ]
        );
        assert_eq!(body.temp_var_types.get("__t0").map(String::as_str), Some("int32_t"));
    }

    #[test]
    fn delegate_cache_pattern_merges_through_the_loaded_value() {
        let mut h = Harness::new();
        let mut handler = IRType::new("App.Handler", "App_Handler");
        handler.base_type = Some("System.MulticastDelegate".into());
        h.module.add_type(handler);

        let cache = FieldRef {
            declaring_type: "App.C".into(),
            name: "cache".into(),
            field_type: "App.Handler".into(),
        };
        let ctor = MethodRef {
            declaring_type: "App.Handler".into(),
            name: ".ctor".into(),
            params: vec!["System.Object".into(), "System.IntPtr".into()],
            return_type: "System.Void".into(),
            has_this: true,
            generic_args: vec![],
        };
        let target = MethodRef {
            declaring_type: "App.C".into(),
            name: "OnTick".into(),
            params: vec![],
            return_type: "System.Void".into(),
            has_this: false,
            generic_args: vec![],
        };
        let invoke = MethodRef {
            declaring_type: "App.Handler".into(),
            name: "Invoke".into(),
            params: vec![],
            return_type: "System.Void".into(),
            has_this: true,
            generic_args: vec![],
        };

        let s = shell(&[], &[], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdsFld(cache.clone())),
                (5, CilOp::Dup),
                (6, CilOp::BrTrueS(20)),
                (8, CilOp::Pop),
                (9, CilOp::LdNull),
                (10, CilOp::LdFtn(target)),
                (16, CilOp::NewObj(ctor)),
                (17, CilOp::Dup),
                (18, CilOp::StsFld(cache)),
                (20, CilOp::CallVirt(invoke)),
                (25, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);

        // The static-field load lands in __t0; the fall-through path must
        // assign the fresh delegate to __t0 before the merge label.
        let assign_pos = got
            .iter()
            .position(|k| matches!(k, InstKind::Assign { target, .. } if target == "__t0"))
            .expect("merge assign present");
        let label_pos = got
            .iter()
            .position(|k| matches!(k, InstKind::Label { name } if name == "IL_0014"))
            .expect("merge label present");
        assert!(assign_pos < label_pos);

        match &got[assign_pos] {
            InstKind::Assign { value, .. } => assert_eq!(value, "__t2"),
            other => panic!("unexpected {:?}", other),
        }
        // The invoke dispatches through the merge variable.
        let delegate = got
            .iter()
            .find_map(|k| match k {
                InstKind::DelegateInvoke { delegate, .. } => Some(delegate.clone()),
                _ => None,
            })
            .expect("invoke lowered as a delegate dispatch");
        assert_eq!(delegate, "__t0");
    }

    #[test]
    fn checked_add_receives_the_literal_pair() {
        let h = Harness::new();
        let s = shell(&[], &[], "int32_t");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdcI4(i32::MAX)),
                (5, CilOp::LdcI4(1)),
                (6, CilOp::AddOvf),
                (7, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert_eq!(
            got[0],
            InstKind::Call {
                function_name: "cil2cpp::checked_add".into(),
                args: vec!["2147483647".into(), "1".into()],
                result: Some("__t0".into()),
                result_type: Some("int32_t".into()),
                deferred_disambig_key: String::new(),
            }
        );
    }

    #[test]
    fn int_min_constants_use_the_subtraction_form() {
        let h = Harness::new();
        let s = shell(&[], &[("loc0", "int32_t"), ("loc1", "int64_t")], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdcI4(i32::MIN)),
                (5, CilOp::StLoc(0)),
                (6, CilOp::LdcI8(i64::MIN)),
                (14, CilOp::StLoc(1)),
                (15, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert!(got.contains(&InstKind::Assign {
            target: "loc0".into(),
            value: "(-2147483647 - 1)".into()
        }));
        assert!(got.contains(&InstKind::Assign {
            target: "loc1".into(),
            value: "(-9223372036854775807LL - 1)".into()
        }));
    }

    #[test]
    fn conv_u_on_pointer_and_zero_emits_nothing() {
        let h = Harness::new();
        let s = shell(&[], &[("loc0", "int32_t")], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdLocA(0)),
                (2, CilOp::Conv(NumKind::U)),
                (3, CilOp::Pop),
                (4, CilOp::LdcI4(0)),
                (5, CilOp::Conv(NumKind::U)),
                (6, CilOp::Pop),
                (7, CilOp::Ret),
            ]),
        );
        assert!(!kinds(&body)
            .iter()
            .any(|k| matches!(k, InstKind::Conversion { .. })));
    }

    #[test]
    fn conv_r_un_reinterprets_at_source_width() {
        let h = Harness::new();
        let s = shell(&[("a0", "int32_t")], &[], "double");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdArg(0)),
                (1, CilOp::ConvRUn),
                (2, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert_eq!(
            got[0],
            InstKind::Conversion {
                src: "cil2cpp::to_unsigned(a0)".into(),
                target_type: "double".into(),
                result: "__t0".into(),
            }
        );
    }

    #[test]
    fn pointer_add_is_byte_offset_arithmetic() {
        let h = Harness::new();
        let s = shell(&[], &[("loc0", "int32_t")], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdLocA(0)),
                (2, CilOp::LdcI4(4)),
                (3, CilOp::Add),
                (4, CilOp::Pop),
                (5, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        let raw = got
            .iter()
            .find_map(|k| match k {
                InstKind::RawCpp { code, result_type, .. } => Some((code.clone(), result_type.clone())),
                _ => None,
            })
            .expect("byte-offset RawCpp emitted");
        assert!(raw.0.contains("(uint8_t*)(&loc0) + (4)"), "got {}", raw.0);
        assert_eq!(raw.1.as_deref(), Some("int32_t*"));
    }

    #[test]
    fn volatile_fences_bracket_the_access() {
        let h = Harness::new();
        let field = FieldRef {
            declaring_type: "App.C".into(),
            name: "flag".into(),
            field_type: "System.Int32".into(),
        };
        let s = shell(&[], &[], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::Volatile),
                (2, CilOp::LdsFld(field.clone())),
                (7, CilOp::Volatile),
                (9, CilOp::StsFld(field)),
                (14, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        let fence = InstKind::Call {
            function_name: "cil2cpp::memory_barrier".into(),
            args: vec![],
            result: None,
            result_type: None,
            deferred_disambig_key: String::new(),
        };
        // Fence before the load.
        assert_eq!(got[0], fence);
        assert!(matches!(&got[1], InstKind::StaticFieldAccess { is_store: false, .. }));
        // Fence after the store.
        assert!(matches!(&got[2], InstKind::StaticFieldAccess { is_store: true, .. }));
        assert_eq!(got[3], fence);
    }

    #[test]
    fn icall_mapping_overrides_the_il_body() {
        let h = Harness::new();
        let read = MethodRef {
            declaring_type: "System.Threading.Volatile".into(),
            name: "Read".into(),
            params: vec!["T&".into()],
            return_type: "T".into(),
            has_this: false,
            generic_args: vec!["System.Int32".into()],
        };
        let s = shell(&[("a0", "int32_t*")], &[], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdArg(0)),
                (1, CilOp::Call(read)),
                (6, CilOp::Pop),
                (7, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert!(got.iter().any(|k| matches!(
            k,
            InstKind::Call { function_name, .. } if function_name == "cil2cpp::volatile_read"
        )));
        assert!(h.pools.icall_flagged.lock().contains(&(
            "System.Threading.Volatile".to_string(),
            "Read".to_string(),
            1
        )));
    }

    #[test]
    fn nullable_box_and_unbox_round_trip() {
        let h = Harness::new();
        let nullable = "System.Nullable`1<System.Int32>";
        let cpp = "System_Nullable_1_System_Int32";
        let s = shell(&[], &[("loc0", cpp)], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdLocA(0)),
                (2, CilOp::InitObj(nullable.into())),
                (8, CilOp::LdLoc(0)),
                (9, CilOp::Box(nullable.into())),
                (14, CilOp::Pop),
                (15, CilOp::LdNull),
                (16, CilOp::UnboxAny(nullable.into())),
                (21, CilOp::Pop),
                (22, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert!(got.contains(&InstKind::InitObj {
            address: "&loc0".into(),
            type_name: cpp.into(),
            is_reference_type: false,
        }));
        // Boxing goes through the nullable-aware helper, so an empty
        // value becomes a null reference.
        assert!(got.iter().any(|k| matches!(
            k,
            InstKind::Call { function_name, args, .. }
                if function_name == "cil2cpp::box_nullable<int32_t>" && args[0] == "loc0"
        )));
        // unbox.any of null reconstructs an empty nullable.
        assert!(got.iter().any(|k| matches!(
            k,
            InstKind::DeclareLocal { ty, .. } if ty == cpp
        )));
        assert!(got.iter().any(|k| matches!(
            k,
            InstKind::RawCpp { code, .. }
                if code.contains("hasValue = true") && code.contains("nullptr != nullptr")
        )));
    }

    #[test]
    fn boxing_a_reference_type_is_a_plain_cast() {
        let h = Harness::new();
        let s = shell(&[("a0", "String*")], &[], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdArg(0)),
                (1, CilOp::Box("System.String".into())),
                (6, CilOp::Pop),
                (7, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert!(got.iter().any(|k| matches!(
            k,
            InstKind::Cast { target_type, safe: false, type_info_name: None, .. }
                if target_type == "Object*"
        )));
        assert!(!got.iter().any(|k| matches!(k, InstKind::Box { .. })));
    }

    #[test]
    fn leave_crossing_the_finally_try_is_suppressed() {
        let h = Harness::new();
        let s = shell(&[], &[], "void");
        let mut m = method(vec![
            (0, CilOp::Nop),
            (2, CilOp::LeaveS(12)),
            (6, CilOp::Nop),
            (8, CilOp::EndFinally),
            (12, CilOp::Ret),
        ]);
        m.handlers = vec![ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 0,
            try_end: 6,
            handler_start: 6,
            handler_end: 12,
            catch_type: None,
            filter_start: None,
        }];
        let body = h.lower(&s, &m);
        let got = kinds(&body);
        assert!(got.contains(&InstKind::TryBegin));
        assert!(got.contains(&InstKind::FinallyBegin));
        assert!(got.contains(&InstKind::TryEnd));
        // The leave crossed the try end: no branch emitted for it.
        assert!(!got.iter().any(|k| matches!(k, InstKind::Branch { .. })));
    }

    #[test]
    fn leave_within_the_try_region_is_emitted() {
        let h = Harness::new();
        let s = shell(&[], &[], "void");
        let mut m = method(vec![
            (0, CilOp::Nop),
            (2, CilOp::LeaveS(4)),
            (4, CilOp::Nop),
            (5, CilOp::LeaveS(12)),
            (7, CilOp::Nop),
            (8, CilOp::EndFinally),
            (12, CilOp::Ret),
        ]);
        m.handlers = vec![ExceptionHandler {
            kind: HandlerKind::Finally,
            try_start: 0,
            try_end: 7,
            handler_start: 7,
            handler_end: 12,
            catch_type: None,
            filter_start: None,
        }];
        let body = h.lower(&s, &m);
        let got = kinds(&body);
        assert!(got.contains(&InstKind::Branch { target: "IL_0004".into() }));
        assert!(!got.contains(&InstKind::Branch { target: "IL_000c".into() }));
    }

    #[test]
    fn filter_saves_its_result_at_the_scope_boundary() {
        let h = Harness::new();
        let s = shell(&[], &[], "void");
        let mut m = method(vec![
            (0, CilOp::Nop),
            (1, CilOp::LeaveS(20)),
            (3, CilOp::Pop),
            (4, CilOp::LdcI4(1)),
            (5, CilOp::EndFilter),
            (7, CilOp::Pop),
            (8, CilOp::LeaveS(20)),
            (20, CilOp::Ret),
        ]);
        m.handlers = vec![ExceptionHandler {
            kind: HandlerKind::Filter,
            try_start: 0,
            try_end: 3,
            handler_start: 7,
            handler_end: 20,
            catch_type: None,
            filter_start: Some(3),
        }];
        let body = h.lower(&s, &m);
        let got = kinds(&body);
        let filter_pos = got
            .iter()
            .position(|k| matches!(k, InstKind::FilterBegin))
            .expect("filter begins");
        let assign_pos = got
            .iter()
            .position(|k| matches!(
                k,
                InstKind::Assign { target, .. } if target == "__filter_result"
            ))
            .expect("filter result saved");
        let end_pos = got
            .iter()
            .position(|k| matches!(k, InstKind::EndFilter))
            .expect("endfilter emitted");
        assert!(filter_pos < assign_pos && assign_pos < end_pos);
        assert!(got.iter().any(|k| matches!(k, InstKind::FilterHandlerBegin)));
    }

    #[test]
    fn constrained_value_type_with_own_method_calls_directly() {
        let mut h = Harness::new();
        h.resolver.add_value_type("App.Num");
        let mut num = IRType::new("App.Num", "App_Num");
        num.flags |= TypeFlags::VALUE_TYPE;
        num.methods.push(IRMethod::new("ToString", "App_Num_ToString"));
        h.module.add_type(num);

        let to_string = MethodRef {
            declaring_type: "System.Object".into(),
            name: "ToString".into(),
            params: vec![],
            return_type: "System.String".into(),
            has_this: true,
            generic_args: vec![],
        };
        let s = shell(&[], &[("loc0", "App_Num")], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdLocA(0)),
                (2, CilOp::Constrained("App.Num".into())),
                (8, CilOp::CallVirt(to_string)),
                (13, CilOp::Pop),
                (14, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert!(got.iter().any(|k| matches!(
            k,
            InstKind::Call { function_name, args, .. }
                if function_name == "App_Num_ToString" && args[0] == "&loc0"
        )));
    }

    #[test]
    fn string_literals_intern_into_the_pool() {
        let h = Harness::new();
        let s = shell(&[], &[], "void");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdStr("hi".into())),
                (5, CilOp::Pop),
                (6, CilOp::LdStr("hi".into())),
                (11, CilOp::Pop),
                (12, CilOp::Ret),
            ]),
        );
        let _ = body;
        assert_eq!(h.pools.strings.lock().len(), 1);
    }

    #[test]
    fn unsupported_shapes_soft_fail_with_a_comment() {
        let h = Harness::new();
        let s = shell(&[], &[], "void");
        let body = h.lower(
            &s,
            &method(vec![(0, CilOp::LdArg(3)), (2, CilOp::Ret)]),
        );
        let got = kinds(&body);
        assert!(got.iter().any(|k| matches!(k, InstKind::Comment { .. })));
        assert_eq!(h.sink.warning_count(), 1);
        // Lowering continued to the return.
        assert!(got.contains(&InstKind::Return { value: None }));
    }

    #[test]
    fn cgt_un_against_null_is_an_inequality_test() {
        let h = Harness::new();
        let s = shell(&[("a0", "Object*")], &[], "int32_t");
        let body = h.lower(
            &s,
            &method(vec![
                (0, CilOp::LdArg(0)),
                (1, CilOp::LdNull),
                (2, CilOp::CgtUn),
                (3, CilOp::Ret),
            ]),
        );
        let got = kinds(&body);
        assert!(got.iter().any(|k| matches!(
            k,
            InstKind::BinaryOp { op, a, b, .. }
                if op == "!=" && a == "a0" && b == "nullptr"
        )));
    }
}
