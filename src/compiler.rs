/// Main compiler pipeline
/// Orchestrates the full compilation process
use crate::cache::Cache;
use crate::codegen::CppCodegen;
use crate::config::CompilerOptions;
use crate::diagnostics::*;
use crate::ir::IRModule;
use crate::mangle::{mangle_method_name, mangle_type_name, short_class_name};
use crate::metadata::Module;
use crate::passes;
use crate::reachability;
use crate::timings::PassTimings;
use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct Compiler {
    cache: Cache,
    options: CompilerOptions,
    verbose: bool,
}

impl Compiler {
    pub fn new(project_dir: &Path) -> Result<Self> {
        Ok(Self {
            cache: Cache::new()?,
            options: CompilerOptions::load(project_dir)?,
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Main compilation entry point: module description in, C++
    /// translation unit out (next to the input unless overridden).
    pub fn compile(&mut self, module_path: &Path, output: Option<&Path>) -> Result<PathBuf> {
        DiagnosticSink::info(&format!("Compiling {}...", module_path.display()));

        let text = fs::read_to_string(module_path)?;
        let source_hash = Cache::get_hash(&text);
        let out_path = match output {
            Some(p) => p.to_path_buf(),
            None => module_path.with_extension("cpp"),
        };

        if self.cache.has_cached(&source_hash) {
            DiagnosticSink::info("Using cached compilation");
            let cached = self.cache.get_cached(&source_hash)?;
            fs::write(&out_path, cached)?;
            return Ok(out_path);
        }

        let source = Module::from_json(&text).map_err(|e| CompileError::BadModule {
            message: e.to_string(),
        })?;
        let sink = DiagnosticSink::new();
        let (module, entry) = self.lower_module(&source, &sink)?;

        for warning in sink.warnings() {
            DiagnosticSink::warning(&warning);
        }

        DiagnosticSink::info("Generating C++...");
        let code = CppCodegen::new(&self.options).generate(&module, entry.as_deref());

        self.cache.cache(&source_hash, &code)?;
        fs::write(&out_path, &code)?;
        DiagnosticSink::success(&format!("Emitted {}", out_path.display()));
        Ok(out_path)
    }

    /// Runs the lowering pipeline in pass order and returns the finished
    /// module plus the mangled entry-point name.
    fn lower_module(
        &self,
        source: &Module,
        sink: &DiagnosticSink,
    ) -> Result<(IRModule, Option<String>)> {
        let mut timings = PassTimings::new();

        let resolver = passes::build_resolver(source, &self.options);
        let reachable = timings.time("reachability", || reachability::analyze(source));
        log::debug!(
            "reachable: {} types, {} methods",
            reachable.type_count(),
            reachable.method_count()
        );

        let mut module = timings.time("type shells", || {
            passes::build_type_shells(source, &reachable, &self.options, &resolver)
        });
        timings.time("interface proxies", || {
            passes::add_interface_proxies(&mut module, &resolver)
        });
        timings.time("method shells", || {
            passes::build_method_shells(&mut module, source, &reachable, &resolver)
        });
        timings.time("vtables", || passes::build_vtables(&mut module));
        timings.time("method bodies", || {
            passes::lower_bodies(&mut module, source, &resolver, &self.options, sink)
        });
        timings.time("disambiguation", || passes::disambiguate_overloads(&mut module));
        timings.time("deferred-call fix-up", || {
            passes::fix_up_deferred_calls(&mut module)
        })?;
        timings.time("verification", || passes::verify(&module))?;

        if self.verbose {
            timings.report();
        }

        let entry = source.entry_point.as_ref().map(|e| {
            let type_cpp = if self.options.is_runtime_provided(&e.declaring_type) {
                short_class_name(&e.declaring_type)
            } else {
                mangle_type_name(&e.declaring_type)
            };
            mangle_method_name(&type_cpp, &e.name, &e.return_type)
        });
        Ok((module, entry))
    }

    /// Lowers and verifies without emitting; used by `check`.
    pub fn check(&self, module_path: &Path) -> Result<usize> {
        let text = fs::read_to_string(module_path)?;
        let source = Module::from_json(&text)?;
        let sink = DiagnosticSink::new();
        self.lower_module(&source, &sink)?;
        for warning in sink.warnings() {
            DiagnosticSink::warning(&warning);
        }
        Ok(sink.warning_count())
    }

    /// Invokes the native toolchain against the companion runtime.
    pub fn build_native(&self, cpp_path: &Path, output: Option<&Path>) -> Result<PathBuf> {
        let binary = match output {
            Some(p) => p.to_path_buf(),
            None => cpp_path.with_extension(""),
        };
        let output = Command::new("c++")
            .arg("-std=c++17")
            .arg("-O2")
            .arg(cpp_path)
            .arg("-lcil2cpp")
            .arg("-o")
            .arg(&binary)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            DiagnosticSink::error(&format!("Native compilation failed:\n{}", stderr));
            return Err(CompileError::NativeBuildFailed { stderr }.into());
        }

        DiagnosticSink::success(&format!("Successfully compiled to {}", binary.display()));
        Ok(binary)
    }

    pub fn clear_cache(&self) -> Result<()> {
        self.cache.clear()?;
        DiagnosticSink::success("Cache cleared");
        Ok(())
    }

    pub fn cache_size(&self) -> Result<u64> {
        self.cache.size()
    }
}
