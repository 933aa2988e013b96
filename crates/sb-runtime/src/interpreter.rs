use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;
use rhai::{
    Dynamic, Engine, EvalAltResult, Module, ModuleResolver, ParseError, ParseErrorType, Position,
    Scope, Shared, AST,
};
use sb_core::{BridgeError, EvalError, Namespace, ScriptValue};
use sb_host::HostRef;
use tracing::{debug, warn};

use crate::dispatch::{invoke_print, load_module};
use crate::resolve::{check_recursion, function_definitions, FunctionSource};
use crate::rhai_bridge::{dynamic_to_script, register_value_types, script_to_dynamic};
use crate::state::{EvalSnapshot, ExecOutcome};

const SCRIPT_TARGET: &str = "starbridge::script";
const TOPLEVEL: &str = "<toplevel>";
/// Call depth allowed once recursion is enabled; the engine's own default is
/// much lower in debug builds.
const MAX_CALL_LEVELS: usize = 64;

/// Failure raised inside an engine callback, reported in place of the
/// engine's own error once evaluation unwinds. The first failure wins.
#[derive(Clone, Default)]
pub(crate) struct PendingError(Rc<RefCell<Option<BridgeError>>>);

impl PendingError {
    pub(crate) fn record(&self, error: BridgeError) {
        let mut slot = self.0.borrow_mut();
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    /// Records `error` and returns the engine error that unwinds the script.
    pub(crate) fn raise(&self, error: BridgeError) -> Box<EvalAltResult> {
        let message = error.to_string();
        self.record(error);
        Box::new(EvalAltResult::ErrorRuntime(
            Dynamic::from(message),
            Position::NONE,
        ))
    }

    pub(crate) fn is_set(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub(crate) fn take(&self) -> Option<BridgeError> {
        self.0.borrow_mut().take()
    }
}

/// Compiles function definitions, each at its original position and under
/// its defining filename, into one AST.
fn compile_functions(engine: &Engine, functions: &[FunctionSource]) -> Result<AST, BridgeError> {
    let mut merged = AST::empty();
    for function in functions {
        let compiled = engine
            .compile(function.positioned())
            .map_err(|error| syntax_error(&function.filename, error))?;
        merged = merged.merge(&compiled);
    }
    Ok(merged)
}

/// Resolves `import "file" as name;` through the instance's load hook. The
/// module carries the loaded instance's globals and script functions.
struct LoadResolver {
    hook: Option<HostRef>,
    pending: PendingError,
}

impl ModuleResolver for LoadResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<Shared<Module>, Box<EvalAltResult>> {
        let Some(hook) = &self.hook else {
            return Err(Box::new(EvalAltResult::ErrorModuleNotFound(
                path.to_string(),
                pos,
            )));
        };
        let loaded = load_module(hook, path, source).map_err(|error| self.pending.raise(error))?;
        let mut ast = compile_functions(engine, &loaded.functions)
            .map_err(|error| self.pending.raise(error))?;
        ast.set_source(path);
        let mut module = Module::eval_ast_as_new(Scope::new(), &ast, engine)?;
        for (name, value) in &loaded.globals {
            if matches!(value, ScriptValue::Function(_)) {
                continue;
            }
            module.set_var(name.as_str(), script_to_dynamic(value));
        }
        module.build_index();
        Ok(module.into())
    }
}

fn build_engine(snapshot: &EvalSnapshot, pending: &PendingError) -> Engine {
    let mut engine = Engine::new();
    engine.set_strict_variables(true);
    engine.set_allow_shadowing(snapshot.config.allow_global_reassign);
    if snapshot.config.allow_recursion {
        engine.set_max_call_levels(MAX_CALL_LEVELS);
    }
    register_value_types(&mut engine, &snapshot.config, pending);

    let print_hook = snapshot.print.as_ref().map(HostRef::new_ref);
    let print_pending = pending.clone();
    engine.on_print(move |text| {
        if print_pending.is_set() {
            return;
        }
        if let Err(error) = invoke_print(print_hook.as_ref(), text) {
            print_pending.record(error);
        }
    });
    engine.on_debug(|text, source, pos| {
        debug!(target: SCRIPT_TARGET, source = source.unwrap_or(""), %pos, "{}", text);
    });

    let progress_pending = pending.clone();
    engine.on_progress(move |_| {
        if progress_pending.is_set() {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });

    engine.set_module_resolver(LoadResolver {
        hook: snapshot.load.as_ref().map(HostRef::new_ref),
        pending: pending.clone(),
    });
    engine
}

fn seed_scope(snapshot: &EvalSnapshot) -> Scope<'static> {
    let mut scope = Scope::new();
    for (name, value) in &snapshot.globals {
        let value = script_to_dynamic(value);
        if snapshot.config.allow_global_reassign {
            scope.push_dynamic(name.as_str(), value);
        } else {
            scope.push_constant_dynamic(name.as_str(), value);
        }
    }
    scope
}

fn syntax_error(filename: &str, error: ParseError) -> BridgeError {
    let ParseError(kind, pos) = error;
    match *kind {
        ParseErrorType::VariableUndefined(name) => {
            BridgeError::resolve(format!("{}: undefined: {}", located(filename, pos), name))
        }
        ParseErrorType::VariableExists(name) => BridgeError::resolve(format!(
            "{}: cannot reassign global {}",
            located(filename, pos),
            name
        )),
        ParseErrorType::AssignmentToConstant(name) => BridgeError::resolve(format!(
            "{}: cannot reassign global {}",
            located(filename, pos),
            name
        )),
        kind => BridgeError::Syntax {
            filename: filename.to_string(),
            line: pos.line().unwrap_or(0),
            column: pos.position().unwrap_or(0),
            message: kind.to_string(),
        },
    }
}

fn located(filename: &str, pos: Position) -> String {
    match (pos.line(), pos.position()) {
        (Some(line), Some(column)) => format!("{}:{}:{}", filename, line, column),
        (Some(line), None) => format!("{}:{}", filename, line),
        _ => filename.to_string(),
    }
}

fn error_type(error: &EvalAltResult) -> &'static str {
    match error {
        EvalAltResult::ErrorFunctionNotFound(..) => "FunctionNotFound",
        EvalAltResult::ErrorModuleNotFound(..) => "ModuleNotFound",
        EvalAltResult::ErrorMismatchDataType(..) | EvalAltResult::ErrorMismatchOutputType(..) => {
            "TypeMismatch"
        }
        EvalAltResult::ErrorIndexNotFound(..)
        | EvalAltResult::ErrorArrayBounds(..)
        | EvalAltResult::ErrorStringBounds(..)
        | EvalAltResult::ErrorBitFieldBounds(..) => "IndexError",
        EvalAltResult::ErrorArithmetic(..) => "ArithmeticError",
        EvalAltResult::ErrorStackOverflow(..) => "StackOverflow",
        EvalAltResult::ErrorRuntime(..) => "RuntimeError",
        _ => "EvalError",
    }
}

/// Where each known script function was defined.
fn function_files<'a>(
    functions: impl IntoIterator<Item = &'a FunctionSource>,
) -> IndexMap<String, String> {
    functions
        .into_iter()
        .map(|function| (function.name.clone(), function.filename.clone()))
        .collect()
}

fn eval_error(filename: &str, files: &IndexMap<String, String>, error: EvalAltResult) -> BridgeError {
    let mut frames = Vec::new();
    let mut function_name = TOPLEVEL.to_string();
    let mut current_file = filename.to_string();
    let mut error = error;
    let mut leaf = loop {
        error = match error {
            EvalAltResult::ErrorInFunctionCall(name, source, inner, pos) => {
                frames.push(frame(&current_file, pos, &function_name));
                current_file = files
                    .get(&name)
                    .cloned()
                    .or_else(|| Some(source).filter(|source| !source.is_empty()))
                    .unwrap_or(current_file);
                function_name = name;
                *inner
            }
            EvalAltResult::ErrorInModule(path, inner, pos) => {
                frames.push(frame(&current_file, pos, &function_name));
                current_file = path;
                function_name = TOPLEVEL.to_string();
                *inner
            }
            other => break other,
        };
    };

    match leaf {
        EvalAltResult::ErrorAssignmentToConstant(name, pos)
        | EvalAltResult::ErrorVariableExists(name, pos) => {
            return BridgeError::resolve(format!(
                "{}: cannot reassign global {}",
                located(&current_file, pos),
                name
            ))
        }
        EvalAltResult::ErrorVariableNotFound(name, pos) => {
            return BridgeError::resolve(format!(
                "{}: undefined: {}",
                located(&current_file, pos),
                name
            ))
        }
        EvalAltResult::ErrorParsing(kind, pos) => {
            return syntax_error(&current_file, ParseError(Box::new(kind), pos))
        }
        _ => {}
    }

    let error_type = error_type(&leaf);
    let pos = leaf.take_position();
    frames.push(frame(&current_file, pos, &function_name));
    BridgeError::from(Box::new(EvalError {
        message: leaf.to_string(),
        error_type: error_type.to_string(),
        filename: current_file,
        line: pos.line().unwrap_or(0),
        column: pos.position().unwrap_or(0),
        function_name,
        backtrace: frames.join("\n"),
    }))
}

fn frame(filename: &str, pos: Position, function_name: &str) -> String {
    format!("{}: in {}", located(filename, pos), function_name)
}

/// Prefers the failure recorded by a callback over whatever the engine
/// reported while unwinding from it.
fn finish<T>(
    pending: &PendingError,
    filename: &str,
    files: &IndexMap<String, String>,
    result: Result<T, Box<EvalAltResult>>,
) -> Result<T, BridgeError> {
    if let Some(error) = pending.take() {
        return Err(error);
    }
    result.map_err(|error| eval_error(filename, files, *error))
}

/// Script functions carried over from earlier `exec` calls, compiled on their
/// own and merged under the new source.
fn with_functions(
    engine: &Engine,
    snapshot: &EvalSnapshot,
    filename: &str,
    ast: AST,
) -> Result<AST, BridgeError> {
    let mut ast = if snapshot.functions.is_empty() {
        ast
    } else {
        compile_functions(engine, &snapshot.functions)?.merge(&ast)
    };
    ast.set_source(filename);
    Ok(ast)
}

fn check_resolution(snapshot: &EvalSnapshot, source: &str) -> Result<(), BridgeError> {
    if snapshot.config.allow_recursion {
        return Ok(());
    }
    let mut program = String::new();
    for function in &snapshot.functions {
        program.push_str(&function.text);
        program.push('\n');
    }
    program.push_str(source);
    check_recursion(&program)
}

/// A seeded global whose value came back as it went in. Opaque values are
/// seeded as unit, so unit coming back leaves them alone too.
fn unchanged(seeded: Option<&ScriptValue>, value: &ScriptValue) -> bool {
    match seeded {
        Some(ScriptValue::Opaque(_)) => matches!(value, ScriptValue::None),
        Some(seeded) => seeded == value,
        None => false,
    }
}

/// Runs `source` as statements. Bindings the script declared or changed and
/// the functions it defined come back as the outcome to merge into the
/// instance; globals it left alone are not part of it.
pub(crate) fn exec(
    snapshot: &EvalSnapshot,
    source: &str,
    filename: &str,
) -> Result<ExecOutcome, BridgeError> {
    check_resolution(snapshot, source)?;
    let functions = function_definitions(source, filename);
    let files = function_files(
        snapshot
            .functions
            .iter()
            .chain(functions.values().flatten()),
    );
    let pending = PendingError::default();
    let engine = build_engine(snapshot, &pending);
    let mut scope = seed_scope(snapshot);

    let ast = engine
        .compile_with_scope(&scope, source)
        .map_err(|error| syntax_error(filename, error))?;
    let ast = with_functions(&engine, snapshot, filename, ast)?;
    debug!(filename, globals = snapshot.globals.len(), "exec");
    let result = engine.run_ast_with_scope(&mut scope, &ast);
    finish(&pending, filename, &files, result)?;

    // a shadowed name appears once per declaration; the last one is live
    let mut bound = Namespace::new();
    for (name, _, value) in scope.iter() {
        bound.insert(name.to_string(), dynamic_to_script(value));
    }
    let mut globals: Namespace = bound
        .into_iter()
        .filter(|(name, value)| !unchanged(snapshot.globals.get(name), value))
        .collect();
    for name in functions.keys() {
        globals.insert(name.clone(), ScriptValue::Function(name.clone()));
    }
    for (name, value) in &globals {
        if let ScriptValue::Opaque(type_name) = value {
            warn!(
                name = name.as_str(),
                type_name = type_name.as_str(),
                "global holds an unconvertible value"
            );
        }
    }
    Ok(ExecOutcome { globals, functions })
}

/// Evaluates one expression against the instance's globals.
pub(crate) fn eval(
    snapshot: &EvalSnapshot,
    source: &str,
    filename: &str,
) -> Result<ScriptValue, BridgeError> {
    check_resolution(snapshot, source)?;
    let files = function_files(&snapshot.functions);
    let pending = PendingError::default();
    let engine = build_engine(snapshot, &pending);
    let mut scope = seed_scope(snapshot);

    let ast = engine
        .compile_expression_with_scope(&scope, source)
        .map_err(|error| syntax_error(filename, error))?;
    let ast = with_functions(&engine, snapshot, filename, ast)?;
    debug!(filename, globals = snapshot.globals.len(), "eval");
    let result = engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast);
    finish(&pending, filename, &files, result).map(dynamic_to_script)
}

#[cfg(test)]
mod interpreter_tests {
    use super::*;
    use sb_core::ResolverConfig;
    use sb_host::HostError;
    use std::sync::{Arc, Mutex};

    fn snapshot(config: ResolverConfig) -> EvalSnapshot {
        EvalSnapshot {
            globals: Namespace::new(),
            functions: Vec::new(),
            print: None,
            load: None,
            config,
        }
    }

    #[test]
    fn exec_collects_top_level_bindings() {
        let outcome = exec(
            &snapshot(ResolverConfig::default()),
            "let x = 1 + 2;\nlet name = \"starbridge\";\nfn twice(v) { v * 2 }",
            "main.star",
        )
        .expect("exec");
        assert_eq!(outcome.globals.get("x"), Some(&ScriptValue::int(3)));
        assert_eq!(
            outcome.globals.get("name"),
            Some(&ScriptValue::string("starbridge"))
        );
        assert_eq!(
            outcome.globals.get("twice"),
            Some(&ScriptValue::Function("twice".to_string()))
        );
        let twice = &outcome.functions["twice"][0];
        assert_eq!(twice.text, "fn twice(v) { v * 2 }");
        assert_eq!((twice.filename.as_str(), twice.line), ("main.star", 3));
    }

    #[test]
    fn eval_sees_globals_and_carried_functions() {
        let mut state = snapshot(ResolverConfig::default());
        state.globals.insert("base".to_string(), ScriptValue::int(20));
        state.functions = function_definitions("fn twice(v) { v * 2 }", "lib.star")
            .shift_remove("twice")
            .unwrap_or_default();
        let value = eval(&state, "twice(base) + 2", "<expr>").expect("eval");
        assert_eq!(value, ScriptValue::int(42));
    }

    #[test]
    fn syntax_errors_carry_location() {
        let error = exec(&snapshot(ResolverConfig::default()), "let = ;", "bad.star")
            .expect_err("syntax");
        let BridgeError::Syntax { filename, line, .. } = &error else {
            panic!("expected syntax error, got {:?}", error);
        };
        assert_eq!(filename, "bad.star");
        assert_eq!(*line, 1);
    }

    #[test]
    fn undefined_names_are_resolve_errors() {
        let error = eval(&snapshot(ResolverConfig::default()), "missing + 1", "<expr>")
            .expect_err("undefined");
        assert_eq!(error.code(), "BRIDGE_RESOLVE");
        assert!(error.to_string().contains("undefined: missing"));
    }

    #[test]
    fn runtime_failures_are_eval_errors() {
        let error = eval(&snapshot(ResolverConfig::default()), "1 + \"2\" - 3", "<expr>")
            .expect_err("type mismatch");
        assert_eq!(error.code(), "BRIDGE_EVAL");
    }

    #[test]
    fn reassigning_globals_requires_permission() {
        let mut state = snapshot(ResolverConfig::default());
        state.globals.insert("x".to_string(), ScriptValue::int(1));
        let error = exec(&state, "x = 2;", "main.star").expect_err("constant");
        assert_eq!(error.code(), "BRIDGE_RESOLVE");
        let error = exec(&state, "let x = 2;", "main.star").expect_err("shadowing");
        assert_eq!(error.code(), "BRIDGE_RESOLVE");

        state.config.allow_global_reassign = true;
        let outcome = exec(&state, "x = 2;", "main.star").expect("reassign");
        assert_eq!(outcome.globals.get("x"), Some(&ScriptValue::int(2)));
    }

    #[test]
    fn recursion_requires_permission() {
        let source = "fn down(n) { if n > 0 { down(n - 1) } else { 0 } }\nlet r = down(3);";
        let error = exec(&snapshot(ResolverConfig::default()), source, "main.star")
            .expect_err("recursive");
        assert_eq!(error.code(), "BRIDGE_RESOLVE");

        let allowed = ResolverConfig {
            allow_recursion: true,
            ..ResolverConfig::default()
        };
        let outcome = exec(&snapshot(allowed), source, "main.star").expect("allowed");
        assert_eq!(outcome.globals.get("r"), Some(&ScriptValue::int(0)));
    }

    #[test]
    fn print_hook_failure_stops_evaluation() {
        let calls = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&calls);
        let mut state = snapshot(ResolverConfig::default());
        state.print = Some(HostRef::function("print", move |_| {
            *counter.lock().expect("counter lock") += 1;
            Err(HostError::runtime_error("print failed"))
        }));

        let error = exec(&state, "print(\"a\");\nprint(\"b\");\nlet after = 1;", "main.star")
            .expect_err("print raises");
        assert_eq!(
            error,
            BridgeError::HostPropagated(HostError::runtime_error("print failed"))
        );
        assert_eq!(*calls.lock().expect("counter lock"), 1);
    }

    #[test]
    fn import_without_load_hook_fails() {
        let error = exec(
            &snapshot(ResolverConfig::default()),
            "import \"lib.star\" as lib;",
            "main.star",
        )
        .expect_err("no loader");
        assert_eq!(error.code(), "BRIDGE_EVAL");
        assert!(error.to_string().contains("lib.star"));
    }

    #[test]
    fn pending_error_keeps_first_failure() {
        let pending = PendingError::default();
        pending.record(BridgeError::resolve("first"));
        drop(pending.raise(BridgeError::resolve("second")));
        assert_eq!(pending.take(), Some(BridgeError::resolve("first")));
        assert!(!pending.is_set());
    }

    #[test]
    fn untouched_globals_are_not_part_of_the_outcome() {
        let mut state = snapshot(ResolverConfig::default());
        state.globals.insert(
            "d".to_string(),
            ScriptValue::Mapping(vec![
                (ScriptValue::string("z"), ScriptValue::int(1)),
                (ScriptValue::string("a"), ScriptValue::int(2)),
            ]),
        );
        state.globals.insert("x".to_string(), ScriptValue::int(1));
        state
            .globals
            .insert("handle".to_string(), ScriptValue::Opaque("socket".to_string()));

        let outcome = exec(&state, "let unrelated = d[\"z\"] + x;", "main.star").expect("exec");
        assert_eq!(
            outcome.globals.keys().collect::<Vec<_>>(),
            vec!["unrelated"]
        );
        assert_eq!(outcome.globals["unrelated"], ScriptValue::int(2));
    }

    #[test]
    fn recursion_is_not_capped_at_the_debug_default() {
        let allowed = ResolverConfig {
            allow_recursion: true,
            ..ResolverConfig::default()
        };
        let source = "fn depth(n) { if n == 0 { 0 } else { 1 + depth(n - 1) } }\nlet d = depth(12);";
        let outcome = exec(&snapshot(allowed), source, "main.star").expect("deep enough");
        assert_eq!(outcome.globals.get("d"), Some(&ScriptValue::int(12)));
    }

    #[test]
    fn errors_inside_carried_functions_point_at_their_definition() {
        let mut state = snapshot(ResolverConfig::default());
        let source = "let before = 1;\nfn wrong() {\n  1 + \"2\" - 3\n}";
        state.functions = function_definitions(source, "fake.star")
            .shift_remove("wrong")
            .unwrap_or_default();
        state
            .globals
            .insert("wrong".to_string(), ScriptValue::Function("wrong".to_string()));

        let error = eval(&state, "wrong()", "<expr>").expect_err("type mismatch");
        let BridgeError::Eval(failure) = &error else {
            panic!("expected eval error, got {:?}", error);
        };
        assert_eq!(failure.filename, "fake.star");
        assert_eq!(failure.function_name, "wrong");
        assert_eq!(failure.line, 3);
        assert_eq!(failure.error_type, "FunctionNotFound");
        assert!(failure.backtrace.starts_with("<expr>:1:1: in <toplevel>\n"));
        assert!(failure.backtrace.ends_with(": in wrong"));
        assert!(error.to_string().starts_with(&format!(
            "fake.star in wrong:3:{}: ",
            failure.column
        )));
    }
}
