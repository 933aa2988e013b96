use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use sb_core::BridgeError;

/// Blanks out comments and string/char literals so the call scanner only
/// sees code. Byte offsets are preserved.
fn code_only(source: &str) -> String {
    let bytes = source.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        let byte = bytes[index];
        let next = bytes.get(index + 1).copied();
        match (byte, next) {
            (b'/', Some(b'/')) => {
                while index < bytes.len() && bytes[index] != b'\n' {
                    out.push(b' ');
                    index += 1;
                }
            }
            (b'/', Some(b'*')) => {
                let mut depth = 0usize;
                while index < bytes.len() {
                    if bytes[index] == b'/' && bytes.get(index + 1) == Some(&b'*') {
                        depth += 1;
                        out.extend_from_slice(b"  ");
                        index += 2;
                    } else if bytes[index] == b'*' && bytes.get(index + 1) == Some(&b'/') {
                        depth -= 1;
                        out.extend_from_slice(b"  ");
                        index += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        out.push(if bytes[index] == b'\n' { b'\n' } else { b' ' });
                        index += 1;
                    }
                }
            }
            (b'"' | b'`' | b'\'', _) => {
                let quote = byte;
                out.push(b' ');
                index += 1;
                while index < bytes.len() && bytes[index] != quote {
                    let skip = if bytes[index] == b'\\' { 2 } else { 1 };
                    for _ in 0..skip {
                        if index < bytes.len() {
                            out.push(if bytes[index] == b'\n' { b'\n' } else { b' ' });
                            index += 1;
                        }
                    }
                }
                if index < bytes.len() {
                    out.push(b' ');
                    index += 1;
                }
            }
            _ => {
                out.push(byte);
                index += 1;
            }
        }
    }
    // literal bytes become single spaces, so the output is still UTF-8
    String::from_utf8_lossy(&out).into_owned()
}

fn matching_brace(code: &str, open: usize) -> usize {
    let mut depth = 0usize;
    for (offset, byte) in code.as_bytes()[open..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return open + offset;
                }
            }
            _ => {}
        }
    }
    code.len()
}

struct FunctionSpan {
    name: String,
    start: usize,
    body: (usize, usize),
}

/// Top-level `fn` definitions in source order. `body` excludes the braces;
/// `start..=body.1` covers the whole definition.
fn function_spans(code: &str) -> Vec<FunctionSpan> {
    let definition = Regex::new(r"(?:^|[^A-Za-z0-9_])(fn)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(")
        .expect("function definition regex must compile");
    let mut spans = Vec::new();
    let mut cursor = 0usize;
    while let Some(captures) = definition.captures_at(code, cursor) {
        let (Some(keyword), Some(name)) = (captures.get(1), captures.get(2)) else {
            break;
        };
        let Some(open) = code[name.end()..].find('{').map(|offset| name.end() + offset) else {
            break;
        };
        let close = matching_brace(code, open);
        spans.push(FunctionSpan {
            name: name.as_str().to_string(),
            start: keyword.start(),
            body: (open + 1, close),
        });
        cursor = close.max(keyword.end());
    }
    spans
}

/// A script function's definition text and where it was defined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FunctionSource {
    pub name: String,
    pub filename: String,
    pub line: usize,
    pub column: usize,
    pub text: String,
}

impl FunctionSource {
    /// The definition padded so it sits at its original line and column,
    /// which keeps engine positions pointing into the defining file.
    pub(crate) fn positioned(&self) -> String {
        let mut out = "\n".repeat(self.line.saturating_sub(1));
        out.push_str(&" ".repeat(self.column.saturating_sub(1)));
        out.push_str(&self.text);
        out
    }
}

/// 1-based line and column (in chars) of byte `offset`.
fn line_column(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|index| index + 1).unwrap_or(0);
    (line, before[line_start..].chars().count() + 1)
}

/// Every function defined in `source`, grouped by name. Overloads by arity
/// share one entry.
pub(crate) fn function_definitions(
    source: &str,
    filename: &str,
) -> IndexMap<String, Vec<FunctionSource>> {
    let code = code_only(source);
    let mut definitions: IndexMap<String, Vec<FunctionSource>> = IndexMap::new();
    for span in function_spans(&code) {
        let end = (span.body.1 + 1).min(source.len());
        let (line, column) = line_column(source, span.start);
        definitions
            .entry(span.name.clone())
            .or_default()
            .push(FunctionSource {
                name: span.name,
                filename: filename.to_string(),
                line,
                column,
                text: source[span.start..end].to_string(),
            });
    }
    definitions
}

fn call_graph(source: &str) -> IndexMap<String, IndexSet<String>> {
    let code = code_only(source);
    let mut bodies: IndexMap<String, Vec<(usize, usize)>> = IndexMap::new();
    for span in function_spans(&code) {
        bodies.entry(span.name).or_default().push(span.body);
    }
    let mut graph = IndexMap::new();
    for (caller, ranges) in &bodies {
        let mut callees = IndexSet::new();
        for callee in bodies.keys() {
            let call = Regex::new(&format!(
                r"(?:^|[^A-Za-z0-9_:]){}\s*\(",
                regex::escape(callee)
            ))
            .expect("escaped function name regex should compile");
            if ranges
                .iter()
                .any(|(start, end)| call.is_match(&code[*start..*end]))
            {
                callees.insert(callee.clone());
            }
        }
        graph.insert(caller.clone(), callees);
    }
    graph
}

fn find_cycle(
    graph: &IndexMap<String, IndexSet<String>>,
    node: &str,
    stack: &mut Vec<String>,
    done: &mut IndexSet<String>,
) -> Option<Vec<String>> {
    if let Some(position) = stack.iter().position(|entry| entry == node) {
        let mut cycle = stack[position..].to_vec();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    if done.contains(node) {
        return None;
    }
    stack.push(node.to_string());
    if let Some(callees) = graph.get(node) {
        for callee in callees {
            if let Some(cycle) = find_cycle(graph, callee, stack, done) {
                return Some(cycle);
            }
        }
    }
    stack.pop();
    done.insert(node.to_string());
    None
}

/// Rejects scripts whose functions can call themselves, directly or through
/// other functions defined in the same source.
pub(crate) fn check_recursion(source: &str) -> Result<(), BridgeError> {
    let graph = call_graph(source);
    let mut done = IndexSet::new();
    for name in graph.keys() {
        let mut stack = Vec::new();
        if let Some(cycle) = find_cycle(&graph, name, &mut stack, &mut done) {
            return Err(BridgeError::resolve(format!(
                "function {} called recursively ({})",
                cycle[0],
                cycle.join(" -> ")
            )));
        }
    }
    Ok(())
}
