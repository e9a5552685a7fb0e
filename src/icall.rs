/// Internal-call registry
/// Routes BCL methods to companion-runtime functions instead of lowering
/// their IL bodies
use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::mangle::split_generic_instance;

/// Typed-overload tier: disambiguates overloads that collapse to one
/// mangled name. `(type, method, arity, first IL param, runtime fn)`.
static TYPED: &[(&str, &str, usize, &str, &str)] = &[
    ("System.Threading.Interlocked", "Increment", 1, "System.Int32&", "cil2cpp::interlocked_increment_i32"),
    ("System.Threading.Interlocked", "Increment", 1, "System.Int64&", "cil2cpp::interlocked_increment_i64"),
    ("System.Threading.Interlocked", "Decrement", 1, "System.Int32&", "cil2cpp::interlocked_decrement_i32"),
    ("System.Threading.Interlocked", "Decrement", 1, "System.Int64&", "cil2cpp::interlocked_decrement_i64"),
    ("System.Threading.Interlocked", "Add", 2, "System.Int32&", "cil2cpp::interlocked_add_i32"),
    ("System.Threading.Interlocked", "Add", 2, "System.Int64&", "cil2cpp::interlocked_add_i64"),
    ("System.Threading.Interlocked", "Exchange", 2, "System.Int32&", "cil2cpp::interlocked_exchange_i32"),
    ("System.Threading.Interlocked", "Exchange", 2, "System.Int64&", "cil2cpp::interlocked_exchange_i64"),
    ("System.Threading.Interlocked", "Exchange", 2, "System.IntPtr&", "cil2cpp::interlocked_exchange_ptr"),
    ("System.Threading.Interlocked", "Exchange", 2, "System.Object&", "cil2cpp::interlocked_exchange_obj"),
    ("System.Threading.Interlocked", "CompareExchange", 3, "System.Int32&", "cil2cpp::interlocked_compare_exchange_i32"),
    ("System.Threading.Interlocked", "CompareExchange", 3, "System.Int64&", "cil2cpp::interlocked_compare_exchange_i64"),
    ("System.Threading.Interlocked", "CompareExchange", 3, "System.IntPtr&", "cil2cpp::interlocked_compare_exchange_ptr"),
    ("System.Threading.Interlocked", "CompareExchange", 3, "System.Object&", "cil2cpp::interlocked_compare_exchange_obj"),
    ("System.Math", "Abs", 1, "System.Double", "cil2cpp::math_abs"),
    ("System.Math", "Abs", 1, "System.Single", "cil2cpp::math_abs_f"),
    ("System.Math", "Abs", 1, "System.Int32", "cil2cpp::math_abs_i32"),
    ("System.Math", "Abs", 1, "System.Int64", "cil2cpp::math_abs_i64"),
    ("System.Math", "Max", 2, "System.Double", "cil2cpp::math_max"),
    ("System.Math", "Max", 2, "System.Int32", "cil2cpp::math_max_i32"),
    ("System.Math", "Min", 2, "System.Double", "cil2cpp::math_min"),
    ("System.Math", "Min", 2, "System.Int32", "cil2cpp::math_min_i32"),
    ("System.Runtime.InteropServices.Marshal", "AllocHGlobal", 1, "System.Int32", "cil2cpp::marshal_alloc_hglobal_i32"),
    ("System.Runtime.InteropServices.Marshal", "AllocHGlobal", 1, "System.IntPtr", "cil2cpp::marshal_alloc_hglobal"),
];

/// Exact tier: `(type, method, arity, runtime fn)`.
static EXACT: &[(&str, &str, usize, &str)] = &[
    // Runtime type system primitives
    ("System.Object", "GetHashCode", 0, "cil2cpp::object_get_hash_code"),
    ("System.Object", "Equals", 1, "cil2cpp::object_equals"),
    ("System.Object", "ReferenceEquals", 2, "cil2cpp::object_reference_equals"),
    ("System.Object", "GetType", 0, "cil2cpp::object_get_type"),
    ("System.Object", "MemberwiseClone", 0, "cil2cpp::object_memberwise_clone"),
    ("System.Object", "ToString", 0, "cil2cpp::object_to_string"),
    ("System.ValueType", "GetHashCode", 0, "cil2cpp::value_type_get_hash_code"),
    ("System.ValueType", "Equals", 1, "cil2cpp::value_type_equals"),
    ("System.String", "get_Length", 0, "cil2cpp::string_get_length"),
    ("System.String", "get_Chars", 1, "cil2cpp::string_get_chars"),
    ("System.String", "FastAllocateString", 1, "cil2cpp::string_fast_allocate"),
    ("System.String", "GetRawStringData", 0, "cil2cpp::string_get_raw_data"),
    ("System.String", "op_Equality", 2, "cil2cpp::string_op_equality"),
    ("System.String", "op_Inequality", 2, "cil2cpp::string_op_inequality"),
    ("System.String", "IsNullOrEmpty", 1, "cil2cpp::string_is_null_or_empty"),
    ("System.String", "Intern", 1, "cil2cpp::string_intern"),
    ("System.Runtime.CompilerServices.RuntimeHelpers", "InitializeArray", 2, "cil2cpp::initialize_array"),
    ("System.Runtime.CompilerServices.RuntimeHelpers", "GetHashCode", 1, "cil2cpp::object_get_hash_code"),
    ("System.Runtime.CompilerServices.RuntimeHelpers", "EnsureSufficientExecutionStack", 0, "cil2cpp::noop"),
    ("System.Runtime.CompilerServices.RuntimeHelpers", "TryEnsureSufficientExecutionStack", 0, "cil2cpp::noop_true"),
    // Arrays
    ("System.Array", "get_Length", 0, "cil2cpp::array_get_length"),
    ("System.Array", "get_Rank", 0, "cil2cpp::array_get_rank"),
    ("System.Array", "GetLength", 1, "cil2cpp::array_get_length_dim"),
    ("System.Array", "GetLowerBound", 1, "cil2cpp::array_get_lower_bound"),
    ("System.Array", "GetUpperBound", 1, "cil2cpp::array_get_upper_bound"),
    ("System.Array", "Clear", 3, "cil2cpp::array_clear"),
    ("System.Array", "GetValue", 1, "cil2cpp::array_get_value"),
    ("System.Array", "SetValue", 2, "cil2cpp::array_set_value"),
    ("System.Array", "CreateInstance", 2, "cil2cpp::array_create_instance"),
    // Delegates
    ("System.Delegate", "Combine", 2, "cil2cpp::delegate_combine"),
    ("System.Delegate", "Remove", 2, "cil2cpp::delegate_remove"),
    ("System.Delegate", "op_Equality", 2, "cil2cpp::delegate_op_equality"),
    ("System.Delegate", "op_Inequality", 2, "cil2cpp::delegate_op_inequality"),
    // Enums
    ("System.Enum", "GetUnderlyingType", 1, "cil2cpp::enum_get_underlying_type"),
    ("System.Enum", "InternalBoxEnum", 2, "cil2cpp::enum_box"),
    ("System.Enum", "ToObject", 2, "cil2cpp::enum_box"),
    // IntPtr round-trips
    ("System.IntPtr", "ToInt32", 0, "cil2cpp::intptr_to_int32"),
    ("System.IntPtr", "ToInt64", 0, "cil2cpp::intptr_to_int64"),
    ("System.IntPtr", "ToPointer", 0, "cil2cpp::intptr_to_pointer"),
    ("System.IntPtr", "get_Size", 0, "cil2cpp::intptr_get_size"),
    ("System.UIntPtr", "ToUInt64", 0, "cil2cpp::uintptr_to_uint64"),
    ("System.UIntPtr", "ToPointer", 0, "cil2cpp::uintptr_to_pointer"),
    // Unicode and globalization primitives
    ("System.Char", "IsWhiteSpace", 1, "cil2cpp::char_is_white_space"),
    ("System.Char", "IsLetter", 1, "cil2cpp::char_is_letter"),
    ("System.Char", "IsDigit", 1, "cil2cpp::char_is_digit"),
    ("System.Char", "IsUpper", 1, "cil2cpp::char_is_upper"),
    ("System.Char", "IsLower", 1, "cil2cpp::char_is_lower"),
    ("System.Char", "ToUpperInvariant", 1, "cil2cpp::char_to_upper_invariant"),
    ("System.Char", "ToLowerInvariant", 1, "cil2cpp::char_to_lower_invariant"),
    ("System.Char", "GetUnicodeCategory", 1, "cil2cpp::char_get_unicode_category"),
    ("System.Globalization.CultureInfo", "get_CurrentCulture", 0, "cil2cpp::culture_get_current"),
    ("System.Globalization.CultureInfo", "get_InvariantCulture", 0, "cil2cpp::culture_get_invariant"),
    ("System.Globalization.Ordinal", "CompareStringIgnoreCase", 4, "cil2cpp::ordinal_compare_ignore_case"),
    ("System.Globalization.Ordinal", "IndexOfOrdinalIgnoreCase", 4, "cil2cpp::ordinal_index_of_ignore_case"),
    // Math (double and float variants)
    ("System.Math", "Sqrt", 1, "cil2cpp::math_sqrt"),
    ("System.Math", "Sin", 1, "cil2cpp::math_sin"),
    ("System.Math", "Cos", 1, "cil2cpp::math_cos"),
    ("System.Math", "Tan", 1, "cil2cpp::math_tan"),
    ("System.Math", "Asin", 1, "cil2cpp::math_asin"),
    ("System.Math", "Acos", 1, "cil2cpp::math_acos"),
    ("System.Math", "Atan", 1, "cil2cpp::math_atan"),
    ("System.Math", "Atan2", 2, "cil2cpp::math_atan2"),
    ("System.Math", "Pow", 2, "cil2cpp::math_pow"),
    ("System.Math", "Exp", 1, "cil2cpp::math_exp"),
    ("System.Math", "Log", 1, "cil2cpp::math_log"),
    ("System.Math", "Log2", 1, "cil2cpp::math_log2"),
    ("System.Math", "Log10", 1, "cil2cpp::math_log10"),
    ("System.Math", "Floor", 1, "cil2cpp::math_floor"),
    ("System.Math", "Ceiling", 1, "cil2cpp::math_ceiling"),
    ("System.Math", "Round", 1, "cil2cpp::math_round"),
    ("System.Math", "Truncate", 1, "cil2cpp::math_truncate"),
    ("System.Math", "FusedMultiplyAdd", 3, "cil2cpp::math_fma"),
    ("System.MathF", "Sqrt", 1, "cil2cpp::mathf_sqrt"),
    ("System.MathF", "Sin", 1, "cil2cpp::mathf_sin"),
    ("System.MathF", "Cos", 1, "cil2cpp::mathf_cos"),
    ("System.MathF", "Pow", 2, "cil2cpp::mathf_pow"),
    ("System.MathF", "Floor", 1, "cil2cpp::mathf_floor"),
    ("System.MathF", "Abs", 1, "cil2cpp::math_abs_f"),
    // Threading
    ("System.Threading.Interlocked", "Read", 1, "cil2cpp::interlocked_read_i64"),
    ("System.Threading.Interlocked", "MemoryBarrier", 0, "cil2cpp::memory_barrier"),
    ("System.Threading.Thread", "get_CurrentThread", 0, "cil2cpp::thread_get_current"),
    ("System.Threading.Thread", "get_ManagedThreadId", 0, "cil2cpp::thread_get_managed_id"),
    ("System.Threading.Thread", "Sleep", 1, "cil2cpp::thread_sleep"),
    ("System.Threading.Thread", "Yield", 0, "cil2cpp::thread_yield"),
    // Memory operations
    ("System.Buffer", "BlockCopy", 5, "cil2cpp::buffer_block_copy"),
    ("System.Buffer", "__ZeroMemory", 2, "cil2cpp::buffer_zero_memory"),
    ("System.Buffer", "MemoryCopy", 4, "cil2cpp::buffer_memory_copy"),
    ("System.GC", "KeepAlive", 1, "cil2cpp::gc_keep_alive"),
    ("System.GC", "SuppressFinalize", 1, "cil2cpp::gc_suppress_finalize"),
    ("System.GC", "ReRegisterForFinalize", 1, "cil2cpp::gc_reregister_for_finalize"),
    ("System.Runtime.InteropServices.Marshal", "FreeHGlobal", 1, "cil2cpp::marshal_free_hglobal"),
    ("System.Runtime.InteropServices.Marshal", "GetLastPInvokeError", 0, "cil2cpp::marshal_get_last_error"),
    // File and path operations
    ("System.IO.File", "ReadAllText", 1, "cil2cpp::file_read_all_text"),
    ("System.IO.File", "ReadAllBytes", 1, "cil2cpp::file_read_all_bytes"),
    ("System.IO.File", "WriteAllText", 2, "cil2cpp::file_write_all_text"),
    ("System.IO.File", "WriteAllBytes", 2, "cil2cpp::file_write_all_bytes"),
    ("System.IO.File", "Exists", 1, "cil2cpp::file_exists"),
    ("System.IO.File", "Delete", 1, "cil2cpp::file_delete"),
    ("System.IO.Path", "GetFullPath", 1, "cil2cpp::path_get_full_path"),
    ("System.IO.Path", "GetTempPath", 0, "cil2cpp::path_get_temp_path"),
    ("System.IO.Path", "DirectorySeparatorCharAsString", 0, "cil2cpp::path_separator_string"),
    // Type-handle introspection
    ("System.Type", "GetTypeFromHandle", 1, "cil2cpp::type_get_type_from_handle"),
    ("System.Type", "get_TypeHandle", 0, "cil2cpp::type_get_type_handle"),
    ("System.Type", "op_Equality", 2, "cil2cpp::type_op_equality"),
    ("System.Type", "op_Inequality", 2, "cil2cpp::type_op_inequality"),
    ("System.RuntimeTypeHandle", "get_Value", 0, "cil2cpp::runtime_type_handle_get_value"),
    // Diagnostics
    ("System.Diagnostics.Debugger", "Break", 0, "cil2cpp::debugger_break"),
    ("System.Diagnostics.Debugger", "get_IsAttached", 0, "cil2cpp::debugger_is_attached"),
    // Registered on the open type; closed instances reach it through
    // the open-name retry.
    ("System.Collections.Generic.EqualityComparer`1", "get_Default", 0, "cil2cpp::equality_comparer_default"),
    ("System.Collections.Generic.Comparer`1", "get_Default", 0, "cil2cpp::comparer_default"),
];

/// Wildcard tier: `(type, method, runtime fn)`; matches any overload and
/// arity. The runtime handles every shape under one name.
static WILDCARD: &[(&str, &str, &str)] = &[
    ("System.String", "Concat", "cil2cpp::string_concat"),
    ("System.String", "Equals", "cil2cpp::string_equals"),
    ("System.String", "CompareOrdinal", "cil2cpp::string_compare_ordinal"),
    ("System.Array", "Copy", "cil2cpp::array_copy"),
    ("System.Threading.Monitor", "Enter", "cil2cpp::monitor_enter"),
    ("System.Threading.Monitor", "Exit", "cil2cpp::monitor_exit"),
    ("System.Threading.Monitor", "Wait", "cil2cpp::monitor_wait"),
    ("System.Threading.Monitor", "Pulse", "cil2cpp::monitor_pulse"),
    ("System.Threading.Monitor", "PulseAll", "cil2cpp::monitor_pulse_all"),
    ("System.Threading.Volatile", "Read", "cil2cpp::volatile_read"),
    ("System.Threading.Volatile", "Write", "cil2cpp::volatile_write"),
    ("System.Buffer", "Memmove", "cil2cpp::buffer_memmove"),
    ("System.GC", "Collect", "cil2cpp::gc_collect"),
    ("System.Runtime.InteropServices.GCHandle", "Alloc", "cil2cpp::gchandle_alloc"),
    ("System.Runtime.InteropServices.GCHandle", "Free", "cil2cpp::gchandle_free"),
    ("System.Runtime.InteropServices.GCHandle", "get_Target", "cil2cpp::gchandle_get_target"),
    ("System.Runtime.InteropServices.GCHandle", "InternalGet", "cil2cpp::gchandle_get_target"),
    ("System.Runtime.InteropServices.Marshal", "Copy", "cil2cpp::marshal_copy"),
    ("System.Runtime.CompilerServices.RuntimeHelpers", "IsReferenceOrContainsReferences", "cil2cpp::is_reference_or_contains_references"),
    ("System.IO.Path", "Combine", "cil2cpp::path_combine"),
    // ETW-like diagnostics lower to no-ops
    ("System.Diagnostics.Tracing.EventSource", "WriteEvent", "cil2cpp::eventsource_noop"),
    ("System.Diagnostics.Tracing.EventSource", "IsEnabled", "cil2cpp::eventsource_is_enabled"),
    ("System.Diagnostics.Tracing.NativeRuntimeEventSource", "LogThreadPoolWorkerThreadStart", "cil2cpp::eventsource_noop"),
    // Host platform P/Invoke stubs
    ("Interop/Kernel32", "GetLastError", "cil2cpp::win32_stub_zero"),
    ("Interop/Kernel32", "CloseHandle", "cil2cpp::win32_stub_true"),
    ("Interop/Kernel32", "GetCurrentProcessId", "cil2cpp::win32_stub_zero"),
    ("Interop/Advapi32", "RegOpenKeyEx", "cil2cpp::win32_stub_registry"),
    ("Interop/Advapi32", "RegQueryValueEx", "cil2cpp::win32_stub_registry"),
    ("Interop/Advapi32", "RegCloseKey", "cil2cpp::win32_stub_zero"),
    ("Interop/NtDll", "NtQuerySystemInformation", "cil2cpp::win32_stub_zero"),
    ("Interop/BCrypt", "BCryptGenRandom", "cil2cpp::bcrypt_gen_random"),
    ("Interop/Globalization", "GetLocaleName", "cil2cpp::globalization_stub_invariant"),
    ("Interop/Globalization", "CompareString", "cil2cpp::globalization_compare_string"),
    ("Interop/Globalization", "ChangeCase", "cil2cpp::globalization_change_case"),
];

/// What the lowering engine knows about a call site when it probes the
/// registry.
#[derive(Debug, Clone, Copy)]
pub struct ICallQuery<'a> {
    pub declaring_type: &'a str,
    pub method_name: &'a str,
    pub param_count: usize,
    pub first_param_il: Option<&'a str>,
    pub is_generic_method: bool,
    pub first_type_arg_is_reference: bool,
}

pub struct ICallRegistry {
    typed: HashMap<String, &'static str>,
    exact: HashMap<String, &'static str>,
    wildcard: HashMap<String, &'static str>,
}

impl ICallRegistry {
    fn build() -> Self {
        let mut typed = HashMap::new();
        for (ty, method, arity, first, target) in TYPED {
            typed.insert(format!("{}::{}/{}/{}", ty, method, arity, first), *target);
        }
        let mut exact = HashMap::new();
        for (ty, method, arity, target) in EXACT {
            exact.insert(format!("{}::{}/{}", ty, method, arity), *target);
        }
        let mut wildcard = HashMap::new();
        for (ty, method, target) in WILDCARD {
            wildcard.insert(format!("{}::{}", ty, method), *target);
        }
        Self { typed, exact, wildcard }
    }

    fn lookup_on_type(&self, declaring_type: &str, query: &ICallQuery) -> Option<&'static str> {
        if let Some(first) = query.first_param_il {
            let key = format!(
                "{}::{}/{}/{}",
                declaring_type, query.method_name, query.param_count, first
            );
            if let Some(&target) = self.typed.get(&key) {
                return Some(target);
            }
        }
        let key = format!("{}::{}/{}", declaring_type, query.method_name, query.param_count);
        if let Some(&target) = self.exact.get(&key) {
            return Some(target);
        }
        let key = format!("{}::{}", declaring_type, query.method_name);
        self.wildcard.get(&key).copied()
    }

    /// Typed -> exact -> wildcard on the declared type; retried on the
    /// open type when the declaring type is a closed generic instance;
    /// finally the `Object&` overload for generic CAS-style methods over
    /// a reference type argument.
    pub fn lookup(&self, query: &ICallQuery) -> Option<&'static str> {
        if let Some(target) = self.lookup_on_type(query.declaring_type, query) {
            return Some(target);
        }

        let open = split_generic_instance(query.declaring_type).map(|(open, _)| open);
        if let Some(open) = open.as_deref() {
            if let Some(target) = self.lookup_on_type(open, query) {
                return Some(target);
            }
        }

        if query.is_generic_method && query.first_type_arg_is_reference {
            let synthetic = ICallQuery {
                first_param_il: Some("System.Object&"),
                ..*query
            };
            let key = format!(
                "{}::{}/{}/System.Object&",
                synthetic.declaring_type, synthetic.method_name, synthetic.param_count
            );
            if let Some(&target) = self.typed.get(&key) {
                return Some(target);
            }
            if let Some(open) = open.as_deref() {
                let key = format!(
                    "{}::{}/{}/System.Object&",
                    open, synthetic.method_name, synthetic.param_count
                );
                if let Some(&target) = self.typed.get(&key) {
                    return Some(target);
                }
            }
        }
        None
    }
}

lazy_static! {
    /// Process-wide registry; read-only after construction.
    pub static ref ICALLS: ICallRegistry = ICallRegistry::build();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query<'a>(ty: &'a str, method: &'a str, count: usize) -> ICallQuery<'a> {
        ICallQuery {
            declaring_type: ty,
            method_name: method,
            param_count: count,
            first_param_il: None,
            is_generic_method: false,
            first_type_arg_is_reference: false,
        }
    }

    #[test]
    fn typed_tier_disambiguates_interlocked_widths() {
        let q32 = ICallQuery {
            first_param_il: Some("System.Int32&"),
            ..query("System.Threading.Interlocked", "Exchange", 2)
        };
        let q64 = ICallQuery {
            first_param_il: Some("System.Int64&"),
            ..query("System.Threading.Interlocked", "Exchange", 2)
        };
        assert_eq!(ICALLS.lookup(&q32), Some("cil2cpp::interlocked_exchange_i32"));
        assert_eq!(ICALLS.lookup(&q64), Some("cil2cpp::interlocked_exchange_i64"));
    }

    #[test]
    fn exact_tier_matches_declared_arity() {
        let q = query("System.Math", "Sqrt", 1);
        assert_eq!(ICALLS.lookup(&q), Some("cil2cpp::math_sqrt"));
        assert_eq!(ICALLS.lookup(&query("System.Math", "Sqrt", 2)), None);
    }

    #[test]
    fn wildcard_tier_matches_any_arity() {
        assert_eq!(
            ICALLS.lookup(&query("System.Threading.Volatile", "Read", 1)),
            Some("cil2cpp::volatile_read")
        );
        assert_eq!(
            ICALLS.lookup(&query("System.Threading.Volatile", "Read", 2)),
            Some("cil2cpp::volatile_read")
        );
    }

    #[test]
    fn typed_beats_wildcard_within_one_type() {
        // Abs has typed entries and no wildcard; an unknown first param
        // falls through to None rather than a wrong width.
        let q = ICallQuery {
            first_param_il: Some("System.Double"),
            ..query("System.Math", "Abs", 1)
        };
        assert_eq!(ICALLS.lookup(&q), Some("cil2cpp::math_abs"));
    }

    #[test]
    fn closed_generic_declaring_type_retries_open_name() {
        // No entry exists under the closed name; the open-name retry
        // must find the entry registered on the open type.
        let q = query(
            "System.Collections.Generic.EqualityComparer`1<System.String>",
            "get_Default",
            0,
        );
        assert_eq!(ICALLS.lookup(&q), Some("cil2cpp::equality_comparer_default"));
    }

    #[test]
    fn reference_generic_cas_falls_back_to_object_overload() {
        let q = ICallQuery {
            declaring_type: "System.Threading.Interlocked",
            method_name: "CompareExchange",
            param_count: 3,
            first_param_il: Some("T&"),
            is_generic_method: true,
            first_type_arg_is_reference: true,
        };
        assert_eq!(ICALLS.lookup(&q), Some("cil2cpp::interlocked_compare_exchange_obj"));
    }

    #[test]
    fn value_generic_cas_does_not_collapse_to_object() {
        let q = ICallQuery {
            declaring_type: "System.Threading.Interlocked",
            method_name: "CompareExchange",
            param_count: 3,
            first_param_il: Some("T&"),
            is_generic_method: true,
            first_type_arg_is_reference: false,
        };
        assert_eq!(ICALLS.lookup(&q), None);
    }

    #[test]
    fn unknown_method_misses() {
        assert_eq!(ICALLS.lookup(&query("App.Widget", "Spin", 0)), None);
    }
}
