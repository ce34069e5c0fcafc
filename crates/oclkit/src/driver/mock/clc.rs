//! A very small OpenCL C front end: build options, a conditional
//! preprocessor and `__kernel` signature extraction.
//!
//! It recognises enough of the language to produce realistic build
//! outcomes and logs. It does not type-check.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

const MAX_INCLUDE_DEPTH: usize = 16;
const MAIN_FILE: &str = "<program source>";

/// Parsed `clBuildProgram` options.
#[derive(Debug, Default, Clone)]
pub(super) struct BuildOptions {
    pub defines: HashMap<String, String>,
    pub include_dirs: Vec<PathBuf>,
    pub arg_info: bool,
    pub warnings_as_errors: bool,
    pub suppress_warnings: bool,
}

impl BuildOptions {
    pub fn parse(options: &str) -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut tokens = options.split_whitespace();
        while let Some(tok) = tokens.next() {
            match tok {
                "-D" => {
                    let def = tokens.next().ok_or("missing macro name after '-D'")?;
                    parsed.define(def);
                }
                "-I" => {
                    let dir = tokens.next().ok_or("missing path after '-I'")?;
                    parsed.include_dirs.push(PathBuf::from(dir));
                }
                "-cl-kernel-arg-info" => parsed.arg_info = true,
                "-Werror" => parsed.warnings_as_errors = true,
                "-w" => parsed.suppress_warnings = true,
                _ if tok.starts_with("-D") => parsed.define(&tok[2..]),
                _ if tok.starts_with("-I") => parsed.include_dirs.push(PathBuf::from(&tok[2..])),
                _ if tok.starts_with('-') => {}
                other => return Err(format!("unexpected build option '{other}'")),
            }
        }
        Ok(parsed)
    }

    fn define(&mut self, def: &str) {
        match def.split_once('=') {
            Some((name, value)) => self.defines.insert(name.to_string(), value.to_string()),
            None => self.defines.insert(def.to_string(), "1".to_string()),
        };
    }
}

/// A declared kernel entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct KernelDecl {
    pub name: String,
    pub params: Vec<String>,
}

/// Result of compiling one translation unit.
#[derive(Debug, Clone)]
pub(super) struct Compiled {
    /// Preprocessed text; this is what a binary carries.
    pub text: String,
    pub kernels: Vec<KernelDecl>,
    pub arg_info: bool,
}

#[derive(Debug, Clone)]
pub(super) struct Outcome {
    pub unit: Option<Compiled>,
    pub log: String,
}

/// Preprocess and parse `source` under `options`.
pub(super) fn compile(source: &str, options: &BuildOptions) -> Outcome {
    let mut pp = Preprocessor::new(options);
    pp.run(MAIN_FILE, source, 0);

    let mut kernels = Vec::new();
    if pp.errors == 0 {
        match parse_kernels(&pp.out) {
            Ok(found) => kernels = found,
            Err((line, msg)) => pp.error(MAIN_FILE, line, &msg),
        }
    }
    if options.warnings_as_errors && pp.warnings > 0 && pp.errors == 0 {
        pp.diags.push("error: warnings treated as errors (-Werror)".to_string());
        pp.errors += 1;
    }

    let unit = (pp.errors == 0).then(|| Compiled {
        text: pp.out.clone(),
        kernels,
        arg_info: options.arg_info,
    });
    Outcome {
        unit,
        log: pp.diags.join("\n"),
    }
}

// ---------------------------------------------------------------------------
// Preprocessor
// ---------------------------------------------------------------------------

struct Cond {
    parent_active: bool,
    taken: bool,
    active: bool,
    line: usize,
}

struct Preprocessor<'o> {
    defines: HashMap<String, String>,
    include_dirs: &'o [PathBuf],
    suppress_warnings: bool,
    diags: Vec<String>,
    errors: usize,
    warnings: usize,
    out: String,
}

impl<'o> Preprocessor<'o> {
    fn new(options: &'o BuildOptions) -> Self {
        Self {
            defines: options.defines.clone(),
            include_dirs: &options.include_dirs,
            suppress_warnings: options.suppress_warnings,
            diags: Vec::new(),
            errors: 0,
            warnings: 0,
            out: String::new(),
        }
    }

    fn error(&mut self, file: &str, line: usize, msg: &str) {
        self.diags.push(format!("{file}:{line}:1: error: {msg}"));
        self.errors += 1;
    }

    fn warning(&mut self, file: &str, line: usize, msg: &str) {
        if self.suppress_warnings {
            return;
        }
        self.diags.push(format!("{file}:{line}:1: warning: {msg}"));
        self.warnings += 1;
    }

    fn run(&mut self, file: &str, source: &str, depth: usize) {
        let mut stack: Vec<Cond> = Vec::new();
        for (idx, raw) in source.lines().enumerate() {
            let line = idx + 1;
            let active = stack.last().map_or(true, |c| c.active);
            let Some(directive) = raw.trim_start().strip_prefix('#') else {
                if active {
                    self.out.push_str(raw);
                }
                self.out.push('\n');
                continue;
            };
            self.out.push('\n');

            let directive = directive.trim();
            let (name, arg) = match directive.find(char::is_whitespace) {
                Some(pos) => (&directive[..pos], directive[pos..].trim()),
                None => (directive, ""),
            };
            match name {
                "ifdef" | "ifndef" => {
                    let defined = self.defines.contains_key(first_word(arg));
                    let cond = active && (defined == (name == "ifdef"));
                    stack.push(Cond {
                        parent_active: active,
                        taken: cond,
                        active: cond,
                        line,
                    });
                }
                "if" => {
                    let cond = active && self.eval(arg, file, line);
                    stack.push(Cond {
                        parent_active: active,
                        taken: cond,
                        active: cond,
                        line,
                    });
                }
                "elif" => {
                    let Some(top) = stack.last() else {
                        self.error(file, line, "#elif without #if");
                        continue;
                    };
                    let open = top.parent_active && !top.taken;
                    let cond = open && self.eval(arg, file, line);
                    if let Some(top) = stack.last_mut() {
                        top.active = cond;
                        top.taken |= cond;
                    }
                }
                "else" => match stack.last_mut() {
                    Some(top) => {
                        top.active = top.parent_active && !top.taken;
                        top.taken = true;
                    }
                    None => self.error(file, line, "#else without #if"),
                },
                "endif" => {
                    if stack.pop().is_none() {
                        self.error(file, line, "#endif without #if");
                    }
                }
                _ if !active => {}
                "define" => {
                    let macro_name = first_word(arg);
                    if macro_name.is_empty() {
                        self.error(file, line, "macro name missing");
                    } else {
                        let value = arg[macro_name.len()..].trim().to_string();
                        self.defines.insert(macro_name.to_string(), value);
                    }
                }
                "undef" => {
                    self.defines.remove(first_word(arg));
                }
                "include" => self.include(arg, file, line, depth),
                "error" => self.error(file, line, arg),
                "warning" => self.warning(file, line, arg),
                "pragma" | "line" | "" => {}
                other => {
                    self.error(file, line, &format!("invalid preprocessing directive '#{other}'"))
                }
            }
        }
        for cond in stack {
            self.error(file, cond.line, "unterminated conditional directive");
        }
    }

    fn eval(&mut self, expr: &str, file: &str, line: usize) -> bool {
        let expr = expr.trim();
        if let Some(inner) = expr.strip_prefix('!') {
            return !self.eval(inner, file, line);
        }
        if let Some(rest) = expr.strip_prefix("defined") {
            let name = rest.trim().trim_start_matches('(').trim_end_matches(')').trim();
            return self.defines.contains_key(name);
        }
        if let Ok(value) = expr.parse::<i64>() {
            return value != 0;
        }
        if is_identifier(expr) {
            return self
                .defines
                .get(expr)
                .and_then(|v| v.parse::<i64>().ok())
                .is_some_and(|v| v != 0);
        }
        self.error(file, line, &format!("unsupported #if expression '{expr}'"));
        false
    }

    fn include(&mut self, arg: &str, file: &str, line: usize, depth: usize) {
        let target = arg
            .trim()
            .trim_start_matches(['"', '<'])
            .trim_end_matches(['"', '>']);
        if depth >= MAX_INCLUDE_DEPTH {
            self.error(file, line, "#include nested too deeply");
            return;
        }
        let found = self
            .include_dirs
            .iter()
            .map(|dir| dir.join(target))
            .chain(std::iter::once(PathBuf::from(target)))
            .find_map(|path| fs::read_to_string(path).ok());
        match found {
            Some(text) => self.run(target, &text, depth + 1),
            None => self.error(file, line, &format!("'{target}' file not found")),
        }
    }
}

fn first_word(s: &str) -> &str {
    let end = s
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(s.len());
    &s[..end]
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ---------------------------------------------------------------------------
// Tokenizer and kernel signatures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    text: String,
    line: usize,
}

type ParseError = (usize, String);

fn tokenize(text: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut line = 1;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let start = line;
                i += 2;
                loop {
                    match chars.get(i) {
                        None => return Err((start, "unterminated /* comment".into())),
                        Some('*') if chars.get(i + 1) == Some(&'/') => {
                            i += 2;
                            break;
                        }
                        Some('\n') => line += 1,
                        Some(_) => {}
                    }
                    i += 1;
                }
            }
            '"' | '\'' => {
                let quote = c;
                i += 1;
                loop {
                    match chars.get(i) {
                        None | Some('\n') => {
                            return Err((line, "missing terminating quote character".into()));
                        }
                        Some('\\') => i += 2,
                        Some(&q) if q == quote => {
                            i += 1;
                            break;
                        }
                        Some(_) => i += 1,
                    }
                }
                tokens.push(Token {
                    text: quote.to_string(),
                    line,
                });
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token {
                    text: chars[start..i].iter().collect(),
                    line,
                });
            }
            '@' | '$' | '`' => return Err((line, format!("unexpected character '{c}'"))),
            c => {
                tokens.push(Token {
                    text: c.to_string(),
                    line,
                });
                i += 1;
            }
        }
    }
    Ok(tokens)
}

fn check_balance(tokens: &[Token]) -> Result<(), ParseError> {
    let mut open: Vec<(&str, usize)> = Vec::new();
    for tok in tokens {
        match tok.text.as_str() {
            "(" | "[" | "{" => open.push((tok.text.as_str(), tok.line)),
            ")" | "]" | "}" => {
                let want = match tok.text.as_str() {
                    ")" => "(",
                    "]" => "[",
                    _ => "{",
                };
                match open.pop() {
                    Some((got, _)) if got == want => {}
                    _ => return Err((tok.line, format!("extraneous closing '{}'", tok.text))),
                }
            }
            _ => {}
        }
    }
    match open.pop() {
        Some((opener, line)) => {
            let closer = match opener {
                "(" => ")",
                "[" => "]",
                _ => "}",
            };
            Err((line, format!("expected '{closer}'")))
        }
        None => Ok(()),
    }
}

fn parse_kernels(text: &str) -> Result<Vec<KernelDecl>, ParseError> {
    let tokens = tokenize(text)?;
    check_balance(&tokens)?;

    let mut kernels: Vec<KernelDecl> = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].text != "__kernel" && tokens[i].text != "kernel" {
            i += 1;
            continue;
        }
        let line = tokens[i].line;
        i += 1;
        while tokens.get(i).is_some_and(|t| t.text == "__attribute__") {
            i = skip_group(&tokens, i + 1);
        }
        if tokens.get(i).map(|t| t.text.as_str()) != Some("void") {
            return Err((line, "kernel functions must return void".into()));
        }
        let name = match tokens.get(i + 1) {
            Some(t) if is_identifier(&t.text) => t.text.clone(),
            _ => return Err((line, "expected kernel name".into())),
        };
        if tokens.get(i + 2).map(|t| t.text.as_str()) != Some("(") {
            return Err((line, format!("expected '(' after kernel name '{name}'")));
        }
        let end = skip_group(&tokens, i + 2);
        let params = parse_params(&tokens[i + 3..end.saturating_sub(1)], line)?;
        if kernels.iter().any(|k| k.name == name) {
            return Err((line, format!("redefinition of '{name}'")));
        }
        kernels.push(KernelDecl { name, params });
        i = end;
    }
    Ok(kernels)
}

/// Index just past the parenthesised group opening at `start`.
fn skip_group(tokens: &[Token], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < tokens.len() {
        match tokens[i].text.as_str() {
            "(" => depth += 1,
            ")" => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    i
}

fn parse_params(tokens: &[Token], line: usize) -> Result<Vec<String>, ParseError> {
    if tokens.is_empty() || (tokens.len() == 1 && tokens[0].text == "void") {
        return Ok(Vec::new());
    }
    let mut params = Vec::new();
    let mut depth = 0usize;
    let mut current: Vec<&Token> = Vec::new();
    for tok in tokens.iter().chain(std::iter::once(&Token {
        text: ",".into(),
        line,
    })) {
        match tok.text.as_str() {
            "(" | "[" => depth += 1,
            ")" | "]" => depth = depth.saturating_sub(1),
            "," if depth == 0 => {
                let name = current
                    .iter()
                    .rev()
                    .find(|t| is_identifier(&t.text))
                    .map(|t| t.text.clone());
                match name {
                    Some(name) if current.len() > 1 => params.push(name),
                    _ => return Err((line, "expected parameter declarator".into())),
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(tok);
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(s: &str) -> BuildOptions {
        BuildOptions::parse(s).unwrap()
    }

    #[test]
    fn parses_options() {
        let o = opts("-DTILE=16 -D FAST -I inc -Iother -cl-kernel-arg-info -cl-mad-enable");
        assert_eq!(o.defines.get("TILE").map(String::as_str), Some("16"));
        assert_eq!(o.defines.get("FAST").map(String::as_str), Some("1"));
        assert_eq!(o.include_dirs, vec![PathBuf::from("inc"), PathBuf::from("other")]);
        assert!(o.arg_info);
        assert!(BuildOptions::parse("-D").is_err());
        assert!(BuildOptions::parse("bogus").is_err());
    }

    #[test]
    fn extracts_kernel_signatures() {
        let src = r#"
            // helper
            inline int twice(int x) { return 2 * x; }
            __kernel void scale(__global const float* restrict in, __global float* out, const uint n) {
                size_t i = get_global_id(0);
                if (i < n) out[i] = in[i] * 2.0f;
            }
            kernel __attribute__((reqd_work_group_size(64, 1, 1))) void reduce(__local float* scratch) {}
            __kernel void nothing(void) {}
        "#;
        let out = compile(src, &opts(""));
        let unit = out.unit.expect("compiles");
        assert_eq!(unit.kernels.len(), 3);
        assert_eq!(unit.kernels[0].name, "scale");
        assert_eq!(unit.kernels[0].params, vec!["in", "out", "n"]);
        assert_eq!(unit.kernels[1].params, vec!["scratch"]);
        assert!(unit.kernels[2].params.is_empty());
        assert!(out.log.is_empty());
    }

    #[test]
    fn conditionals_and_defines() {
        let src = "#define USE_A\n#ifdef USE_A\n__kernel void a(int x) {}\n#else\n__kernel void b(int x) {}\n#endif\n#if 0\n#error hidden\n#endif\n";
        let unit = compile(src, &opts("")).unit.unwrap();
        assert_eq!(unit.kernels.len(), 1);
        assert_eq!(unit.kernels[0].name, "a");

        let src = "#ifndef WIDTH\n#error WIDTH must be defined\n#endif\n";
        let out = compile(src, &opts(""));
        assert!(out.unit.is_none());
        assert!(out.log.contains("2:1: error: WIDTH must be defined"));
        assert!(compile(src, &opts("-DWIDTH=4")).unit.is_some());
    }

    #[test]
    fn warnings_are_logged_without_failing() {
        let out = compile("#warning slow path\n__kernel void k(int a) {}\n", &opts(""));
        assert!(out.unit.is_some());
        assert!(out.log.contains("warning: slow path"));

        let out = compile("#warning slow path\n", &opts("-Werror"));
        assert!(out.unit.is_none());

        let out = compile("#warning slow path\n", &opts("-w"));
        assert!(out.log.is_empty());
    }

    #[test]
    fn syntax_errors_fail() {
        let out = compile("__kernel void broken(__global int* a) {\n a[0] = 1;\n", &opts(""));
        assert!(out.unit.is_none());
        assert!(out.log.contains("expected '}'"));

        let out = compile("__kernel int bad(int a) {}", &opts(""));
        assert!(out.log.contains("must return void"));

        let out = compile("__kernel void k(int a) { $ }", &opts(""));
        assert!(out.log.contains("unexpected character"));

        let out = compile("#ifdef X\n", &opts(""));
        assert!(out.log.contains("unterminated conditional"));

        let out = compile("__kernel void k(int a) {}\n__kernel void k(int b) {}", &opts(""));
        assert!(out.log.contains("redefinition of 'k'"));
    }

    #[test]
    fn include_resolves_against_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("common.h"), "#define COMMON 1\n").unwrap();
        let src = "#include \"common.h\"\n#if COMMON\n__kernel void k(int a) {}\n#endif\n";

        let with_dir = format!("-I {}", dir.path().display());
        let unit = compile(src, &opts(&with_dir)).unit.unwrap();
        assert_eq!(unit.kernels.len(), 1);

        let out = compile(src, &opts(""));
        assert!(out.log.contains("'common.h' file not found"));
    }
}
