/// Command-line interface
/// Polished, user-friendly CLI using clap
use crate::compiler::Compiler;
use crate::diagnostics::*;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "cilcc",
    version = "0.1.0",
    about = "⚡ .NET IL → C++ → Native ahead-of-time compiler",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project directory (cilcc.json is read from here)
    #[arg(global = true, short, long, default_value = ".")]
    project: PathBuf,

    /// Verbose output (pass timings, reachability counts)
    #[arg(global = true, short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a module description to C++ and a native binary
    #[command(about = "Compile an extracted module description to native code")]
    Build {
        /// Module description (.json) produced by the metadata extractor
        file: PathBuf,

        /// Output path for the generated C++
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after emitting C++; skip the native toolchain
        #[arg(long)]
        cpp_only: bool,
    },

    /// Lower and verify without emitting
    #[command(about = "Check a module description for lowering problems")]
    Check {
        /// Module description to check
        file: PathBuf,
    },

    /// Manage the compilation cache
    #[command(about = "Inspect or clear cached compilations")]
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show help and examples
    #[command(about = "Display help information")]
    Help {
        /// Topic to get help on
        topic: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Clear all cached compilations
    #[command(about = "Remove all cached compilations")]
    Clear,

    /// Show cache size
    #[command(about = "Display cache directory size")]
    Size,
}

impl Cli {
    pub fn parse_args() -> Result<Self> {
        Ok(Self::parse())
    }

    pub fn execute(&self) -> Result<()> {
        if self.verbose {
            log::set_max_level(log::LevelFilter::Debug);
        }

        match &self.command {
            Some(Commands::Build { file, output, cpp_only }) => {
                self.build(file, output.as_deref(), *cpp_only)
            }

            Some(Commands::Check { file }) => {
                DiagnosticSink::info(&format!("Checking {}...", file.display()));
                let compiler = Compiler::new(&self.project)?;
                let warnings = compiler.check(file)?;
                if warnings == 0 {
                    DiagnosticSink::success("No issues found");
                } else {
                    DiagnosticSink::warning(&format!("{} warning(s)", warnings));
                }
                Ok(())
            }

            Some(Commands::Cache { action }) => match action {
                CacheAction::Clear => {
                    let compiler = Compiler::new(&self.project)?;
                    compiler.clear_cache()
                }
                CacheAction::Size => {
                    let compiler = Compiler::new(&self.project)?;
                    let size = compiler.cache_size()?;
                    DiagnosticSink::info(&format!("Cache size: {} bytes", size));
                    Ok(())
                }
            },

            Some(Commands::Help { topic }) => {
                self.show_help(topic.as_deref());
                Ok(())
            }

            None => {
                self.show_help(None);
                Ok(())
            }
        }
    }

    fn build(
        &self,
        file: &std::path::Path,
        output: Option<&std::path::Path>,
        cpp_only: bool,
    ) -> Result<()> {
        if !file.exists() {
            DiagnosticSink::error(&format!("File not found: {}", file.display()));
            return Err(anyhow::anyhow!("File not found"));
        }

        let mut compiler = Compiler::new(&self.project)?;
        compiler.set_verbose(self.verbose);
        let cpp = compiler.compile(file, output)?;
        if !cpp_only {
            compiler.build_native(&cpp, None)?;
        }

        DiagnosticSink::success("Build complete!");
        Ok(())
    }

    fn show_help(&self, topic: Option<&str>) {
        let help = match topic {
            Some("icalls") => {
                r#"
Internal calls (ICalls)
=======================

Methods the runtime implements directly are routed through the internal
call registry instead of being compiled from bytecode. Three tiers are
consulted in order:

  typed     Type::Method/arity/first-parameter-type
  exact     Type::Method/arity
  wildcard  Type::Method (any overload)

Covered areas: object identity and hashing, strings, arrays, delegates,
enums, IntPtr round-trips, Unicode and globalization primitives, Math,
threading (Monitor, Interlocked, Volatile), memory and GC handles, file
and path operations, type handles, and diagnostics stubs.

A registry hit always wins over an IL body; JIT-intrinsic bodies
(Volatile, Math) cannot be compiled faithfully.
"#
            }
            Some("options") => {
                r#"
Project options (cilcc.json)
============================

{
  "is_debug": false,
  "emit_line_directives": false,
  "targeted_runtime_provided_types": ["System.Text.StringBuilder"],
  "core_runtime_types": []
}

is_debug
    Attach sequence-point source locations to emitted instructions.

emit_line_directives
    Print #line directives so native debuggers map back to the
    original source.

targeted_runtime_provided_types / core_runtime_types
    Types the companion runtime provides under their bare class names
    (System.Object -> Object). The core set is always included.
"#
            }
            _ => {
                r#"
cilcc - .NET IL to C++ ahead-of-time compiler
=============================================

Commands:
  cilcc build <module.json>    Compile to C++ and a native binary
  cilcc build --cpp-only <f>   Emit the C++ translation unit only
  cilcc check <module.json>    Lower and verify without emitting
  cilcc cache clear            Clear the compilation cache
  cilcc cache size             Show cache directory size
  cilcc help icalls            Internal-call registry overview
  cilcc help options           Project options reference

Options:
  -p, --project <dir>    Project directory [default: .]
  -v, --verbose          Pass timings and reachability counts

The input is a module description produced by the metadata extractor
over a compiled assembly. The output links against the cil2cpp
companion runtime.
"#
            }
        };

        println!("{}", help);
    }
}
