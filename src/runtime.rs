/// Companion-runtime ABI surface
/// Symbol naming and the prelude shared by every generated translation
/// unit; pure formatting, no I/O

/// TypeInfo singletons are declared as `Mangled_TypeInfo`; primitives
/// live under their mangled primitive names.
pub fn type_info_symbol(cpp_name: &str) -> String {
    format!("{}_TypeInfo", cpp_name)
}

pub fn prelude() -> &'static str {
    r#"// Generated by cilcc. Do not edit.
#include <cstdint>
#include <cstring>
#include <exception>
#include <alloca.h>
#include "cil2cpp_runtime.h"

using cil2cpp::Array;
using cil2cpp::Delegate;
using cil2cpp::Object;
using cil2cpp::String;
using cil2cpp::TypeInfo;
"#
}

/// Escapes a Rust string into a `u"..."` UTF-16 literal body.
pub fn escape_utf16_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || (c as u32) > 0x7e => {
                for unit in c.encode_utf16(&mut [0u16; 2]).iter() {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// UTF-16 code unit count, which is the length the runtime stores.
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_info_symbols_follow_the_abi() {
        assert_eq!(type_info_symbol("App_Widget"), "App_Widget_TypeInfo");
        assert_eq!(type_info_symbol("System_Int32"), "System_Int32_TypeInfo");
    }

    #[test]
    fn literals_escape_quotes_and_controls() {
        assert_eq!(escape_utf16_literal("hi"), "hi");
        assert_eq!(escape_utf16_literal("a\"b"), "a\\\"b");
        assert_eq!(escape_utf16_literal("a\nb"), "a\\nb");
        assert_eq!(escape_utf16_literal("é"), "\\u00e9");
    }

    #[test]
    fn utf16_length_counts_surrogate_pairs() {
        assert_eq!(utf16_len("ab"), 2);
        assert_eq!(utf16_len("😀"), 2);
    }
}
