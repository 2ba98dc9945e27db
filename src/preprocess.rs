use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
};

use tracing::{debug, trace};

use crate::{
    config::Config,
    diagnostic::{Diagnostic, DiagnosticKind, ExtractError},
    extract::SourceMap,
    lexer::{self, extract},
    model::ConstValue,
    token::{spell, LexErrorKind, Location, Token, TokenKind},
};

type Result<T, E = ExtractError> = std::result::Result<T, E>;

/// The output of preprocessing a single file (and everything it includes).
#[derive(Debug)]
pub struct Preprocessed<'src> {
    /// The flat token stream. Always ends with [`TokenKind::Eof`].
    pub tokens: Vec<Token<'src>>,
    /// Object-like macros whose body is a single literal or an integer
    /// expression, in definition order.
    pub constants: Vec<MacroConstant<'src>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MacroConstant<'src> {
    pub name: String,
    pub value: ConstValue,
    pub loc: Location<'src>,
}

/// Preprocesses the file at `path`, which must be present in `sources`.
/// Quoted includes are resolved against the same source map.
///
/// Diagnostics go to `diagnostics`, including those reported before a lexical
/// error ends the file.
pub fn preprocess<'src>(
    sources: &'src SourceMap,
    path: &str,
    config: &Config,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Preprocessed<'src>> {
    let Some((path, text)) = sources.get_entry(path) else {
        return Ok(Preprocessed {
            tokens: vec![Token::eof(Location::SYNTHETIC)],
            constants: Vec::new(),
        });
    };

    let mut pp = Preprocessor::new(sources, config);
    let processed = pp.process_file(path, text);
    diagnostics.append(&mut pp.diagnostics);
    processed?;

    let end = pp.output.last().map_or(
        Location {
            file: path,
            line: 1,
            column: 1,
        },
        |t| t.loc,
    );
    pp.output.push(Token::eof(end));
    debug!(
        file = path,
        tokens = pp.output.len(),
        macros = pp.macros.len(),
        "preprocessed"
    );
    Ok(Preprocessed {
        tokens: pp.output,
        constants: pp.constants,
    })
}

#[derive(Clone, Debug)]
struct Macro<'src> {
    /// `None` for object-like macros.
    params: Option<Vec<String>>,
    /// The name bound to the variadic arguments (`__VA_ARGS__` for `...`).
    variadic: Option<String>,
    body: Vec<Token<'src>>,
}

/// State of a conditional (`#if`/`#ifdef`) block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondState {
    /// In a true branch, processing tokens.
    Active,
    /// In a false branch, skipping tokens.
    Skipping,
    /// A true branch was already taken; skip the remaining ones.
    Done,
}

#[derive(Debug, Clone, Copy)]
struct Conditional {
    state: CondState,
    had_true: bool,
}

struct Preprocessor<'src, 'cfg> {
    sources: &'src SourceMap,
    config: &'cfg Config,
    macros: HashMap<String, Macro<'src>>,
    cond_stack: Vec<Conditional>,
    include_stack: Vec<&'src str>,
    once_files: HashSet<&'src str>,
    /// Files wrapped in an include guard, and the guarding macro.
    guards: HashMap<&'src str, String>,
    /// Macros being expanded, for recursion prevention.
    expanding: HashSet<String>,
    output: Vec<Token<'src>>,
    constants: Vec<MacroConstant<'src>>,
    diagnostics: Vec<Diagnostic>,
}

impl<'src, 'cfg> Preprocessor<'src, 'cfg> {
    fn new(sources: &'src SourceMap, config: &'cfg Config) -> Self {
        let mut macros = HashMap::new();
        for (flag, _) in config.platform_flags.iter().filter(|(_, on)| **on) {
            macros.insert(
                flag.clone(),
                Macro {
                    params: None,
                    variadic: None,
                    body: vec![Token::synthetic(TokenKind::Number, "1")],
                },
            );
        }
        Preprocessor {
            sources,
            config,
            macros,
            cond_stack: Vec::new(),
            include_stack: Vec::new(),
            once_files: HashSet::new(),
            guards: HashMap::new(),
            expanding: HashSet::new(),
            output: Vec::with_capacity(4096),
            constants: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    fn is_skipping(&self) -> bool {
        self.cond_stack
            .last()
            .is_some_and(|c| c.state != CondState::Active)
    }

    fn diagnostic(&mut self, kind: DiagnosticKind, loc: Location<'_>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic::new(kind, loc, message));
    }

    fn process_file(&mut self, path: &'src str, text: &'src str) -> Result<()> {
        if self.once_files.contains(path) {
            trace!(file = path, "skipping #pragma once file");
            return Ok(());
        }
        if let Some(guard) = self.guards.get(path) {
            if self.macros.contains_key(guard) {
                trace!(file = path, guard, "skipping guarded file");
                return Ok(());
            }
        }
        if self.include_stack.contains(&path) {
            trace!(file = path, "skipping recursive include");
            return Ok(());
        }

        let tokens = lexer::lex_in_new(path, text);
        // Comments are stripped before conditionals apply, so an unterminated
        // one is fatal even inside a dead branch.
        if let Some(t) = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Error(LexErrorKind::UnclosedComment))
        {
            return Err(lex_error(t, LexErrorKind::UnclosedComment));
        }
        let guard = detect_guard(&tokens);

        let saved_conds = std::mem::take(&mut self.cond_stack);
        self.include_stack.push(path);

        let mut segment = Vec::new();
        let mut cursor = 0;
        while let Some(token) = tokens.get(cursor) {
            if token.is_eof() {
                break;
            }
            if token.kind == TokenKind::Hash && token.line_start {
                let end = line_end(&tokens, cursor);
                if !segment.is_empty() {
                    let expanded = self.expand(std::mem::take(&mut segment))?;
                    self.output.extend(expanded);
                }
                self.directive(&tokens[cursor..end], path)?;
                cursor = end;
                continue;
            }
            if !self.is_skipping() {
                segment.push(token.clone());
            }
            cursor += 1;
        }
        if !segment.is_empty() {
            let expanded = self.expand(segment)?;
            self.output.extend(expanded);
        }

        if !self.cond_stack.is_empty() {
            let loc = tokens.last().map_or(Location::SYNTHETIC, |t| t.loc);
            let message = format!("{} unterminated conditional directive(s)", self.cond_stack.len());
            self.diagnostic(DiagnosticKind::UnbalancedConditional, loc, message);
        }
        self.cond_stack = saved_conds;
        self.include_stack.pop();
        if let Some(guard) = guard {
            self.guards.insert(path, guard);
        }
        Ok(())
    }

    fn directive(&mut self, line: &[Token<'src>], current_file: &'src str) -> Result<()> {
        let hash = &line[0];
        // The null directive.
        let Some(name) = line.get(1) else {
            return Ok(());
        };
        let rest = &line[2..];

        match name.text() {
            "ifdef" | "ifndef" => {
                let value = match rest.first() {
                    Some(t) if t.kind.is_word() => {
                        let defined = self.macros.contains_key(t.text());
                        defined == (name.text() == "ifdef")
                    }
                    _ => {
                        if !self.is_skipping() {
                            self.malformed(hash, "expected a macro name");
                        }
                        false
                    }
                };
                self.push_conditional(value);
            }
            "if" => {
                let value = !self.is_skipping() && self.evaluate(hash, rest)?;
                self.push_conditional(value);
            }
            "elif" => {
                let should_eval = self
                    .cond_stack
                    .last()
                    .is_some_and(|c| c.state == CondState::Skipping && !c.had_true);
                let value = should_eval && self.evaluate(hash, rest)?;
                match self.cond_stack.last_mut() {
                    Some(cond) => match cond.state {
                        CondState::Active => {
                            cond.state = CondState::Done;
                            cond.had_true = true;
                        }
                        CondState::Skipping if value => {
                            cond.state = CondState::Active;
                            cond.had_true = true;
                        }
                        CondState::Skipping | CondState::Done => (),
                    },
                    None => self.unbalanced(hash, "#elif"),
                }
            }
            "else" => match self.cond_stack.last_mut() {
                Some(cond) => match cond.state {
                    CondState::Skipping if !cond.had_true => {
                        cond.state = CondState::Active;
                        cond.had_true = true;
                    }
                    _ => {
                        cond.state = CondState::Done;
                        cond.had_true = true;
                    }
                },
                None => self.unbalanced(hash, "#else"),
            },
            "endif" => {
                if self.cond_stack.pop().is_none() {
                    self.unbalanced(hash, "#endif");
                }
            }
            _ if self.is_skipping() => (),
            "define" => self.define(hash, rest),
            "undef" => match rest.first() {
                Some(t) if t.kind.is_word() => {
                    self.macros.remove(t.text());
                    self.constants.retain(|c| c.name != t.text());
                }
                _ => self.malformed(hash, "expected a macro name"),
            },
            "include" | "include_next" => self.include(hash, rest, current_file)?,
            "pragma" => {
                if rest.first().is_some_and(|t| t.text() == "once") {
                    self.once_files.insert(current_file);
                }
            }
            "error" => {
                let message = format!("#error {}", spell(rest));
                self.diagnostic(DiagnosticKind::ErrorDirective, hash.loc, message);
            }
            "warning" => {
                let message = format!("#warning {}", spell(rest));
                self.diagnostic(DiagnosticKind::WarningDirective, hash.loc, message);
            }
            "line" | "ident" | "sccs" => (),
            // GNU line markers (`# 12 "file.h"`).
            _ if name.kind == TokenKind::Number => (),
            other => {
                let message = format!("unknown directive #{other}");
                self.malformed(hash, message);
            }
        }
        Ok(())
    }

    fn malformed(&mut self, hash: &Token<'_>, message: impl Into<String>) {
        self.diagnostic(DiagnosticKind::MalformedDirective, hash.loc, message);
    }

    fn unbalanced(&mut self, hash: &Token<'_>, directive: &str) {
        let message = format!("{directive} without #if");
        self.diagnostic(DiagnosticKind::UnbalancedConditional, hash.loc, message);
    }

    fn push_conditional(&mut self, condition: bool) {
        let parent_skipping = self.is_skipping();
        let state = if !parent_skipping && condition {
            CondState::Active
        } else {
            CondState::Skipping
        };
        self.cond_stack.push(Conditional {
            state,
            // A skipped parent keeps every branch of the child dead.
            had_true: parent_skipping || condition,
        });
    }

    fn define(&mut self, hash: &Token<'src>, rest: &[Token<'src>]) {
        let Some((name, mut body)) = rest.split_first() else {
            return self.malformed(hash, "expected a macro name");
        };
        if !name.kind.is_word() {
            return self.malformed(hash, "macro names must be identifiers");
        }

        let mut params = None;
        let mut variadic = None;
        if body
            .first()
            .is_some_and(|t| t.kind == TokenKind::LParen && !t.spaced)
        {
            let Some((names, vararg, consumed)) = parse_params(body) else {
                return self.malformed(hash, "malformed macro parameter list");
            };
            params = Some(names);
            variadic = vararg;
            body = &body[consumed..];
        }

        if params.is_none() {
            if let Some(value) = literal_value(body).or_else(|| self.integer_value(body)) {
                let constant = MacroConstant {
                    name: name.text().to_owned(),
                    value,
                    loc: name.loc,
                };
                match self.constants.iter_mut().find(|c| c.name == constant.name) {
                    Some(existing) => *existing = constant,
                    None => self.constants.push(constant),
                }
            }
        }

        trace!(name = name.text(), function_like = params.is_some(), "define");
        self.macros.insert(
            name.text().to_owned(),
            Macro {
                params,
                variadic,
                body: body.to_vec(),
            },
        );
    }

    /// Evaluates a macro body that is an integer expression over literals and
    /// the macros defined so far.
    fn integer_value(&mut self, body: &[Token<'src>]) -> Option<ConstValue> {
        let unusable = |t: &Token<'_>| matches!(t.kind, TokenKind::String | TokenKind::Error(_));
        if body.is_empty() || body.iter().any(unusable) {
            return None;
        }
        let expanded = self.expand(body.to_vec()).ok()?;
        // Leftover names would evaluate to zero.
        let closed = expanded
            .iter()
            .all(|t| !t.kind.is_word() || matches!(t.kind, TokenKind::True | TokenKind::False));
        if !closed {
            return None;
        }
        Evaluator::new(&expanded).evaluate().map(ConstValue::Int)
    }

    fn include(&mut self, hash: &Token<'src>, rest: &[Token<'src>], current_file: &str) -> Result<()> {
        let target = match rest.first() {
            Some(t) if t.kind == TokenKind::String => extract::string(t.text()).to_owned(),
            Some(t) if t.kind == TokenKind::Less => {
                trace!(header = spell(rest), "skipping system include");
                return Ok(());
            }
            _ => {
                self.malformed(hash, "expected \"FILENAME\" or <FILENAME>");
                return Ok(());
            }
        };

        if self.include_stack.len() >= self.config.max_include_depth {
            let message = format!(
                "#include nested too deeply (max {})",
                self.config.max_include_depth
            );
            self.diagnostic(DiagnosticKind::IncludeDepthExceeded, hash.loc, message);
            return Ok(());
        }

        let relative = join_path(parent_dir(current_file), &target);
        let entry = self
            .sources
            .get_entry(&relative)
            .or_else(|| self.sources.get_entry(&normalize_path(&target)));
        match entry {
            Some((path, text)) => {
                trace!(from = current_file, file = path, "include");
                self.process_file(path, text)
            }
            None => {
                trace!(from = current_file, header = target, "include not in source map");
                Ok(())
            }
        }
    }

    /// Macro-expands the provided tokens, rescanning each expansion.
    fn expand(&mut self, tokens: Vec<Token<'src>>) -> Result<Vec<Token<'src>>> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut cursor = 0;
        while let Some(token) = tokens.get(cursor) {
            cursor += 1;
            if let TokenKind::Error(kind) = token.kind {
                return Err(lex_error(token, kind));
            }
            if !token.kind.is_word() || self.expanding.contains(token.text()) {
                out.push(token.clone());
                continue;
            }

            let name = token.text();
            let mac = self.macros.get(name);
            let is_function_like = mac.is_none_or(|m| m.params.is_some());
            if self.config.is_stripped(name) {
                if is_function_like && tokens.get(cursor).is_some_and(|t| t.kind == TokenKind::LParen) {
                    if let Some((_, end)) = collect_args(&tokens, cursor + 1) {
                        cursor = end;
                    }
                }
                trace!(name, "stripped macro");
                continue;
            }
            let Some(mac) = mac.cloned() else {
                out.push(token.clone());
                continue;
            };

            let expansion = match mac.params {
                None => {
                    self.expanding.insert(name.to_owned());
                    let body = relocate(mac.body.clone(), token);
                    let expanded = self.expand(body);
                    self.expanding.remove(name);
                    expanded?
                }
                Some(ref params) => {
                    if !tokens.get(cursor).is_some_and(|t| t.kind == TokenKind::LParen) {
                        out.push(token.clone());
                        continue;
                    }
                    let Some((args, end)) = collect_args(&tokens, cursor + 1) else {
                        out.push(token.clone());
                        continue;
                    };
                    cursor = end;
                    let substituted = self.substitute(&mac, params, args, token)?;
                    self.expanding.insert(name.to_owned());
                    let expanded = self.expand(substituted);
                    self.expanding.remove(name);
                    expanded?
                }
            };
            out.extend(expansion);
        }
        Ok(out)
    }

    /// Replaces parameters in the body of a function-like macro, handling
    /// stringification (`#`) and pasting (`##`).
    fn substitute(
        &mut self,
        mac: &Macro<'src>,
        params: &[String],
        mut args: Vec<Vec<Token<'src>>>,
        site: &Token<'src>,
    ) -> Result<Vec<Token<'src>>> {
        // `M()` passes one empty argument, which is no argument at all for a
        // macro without parameters.
        if params.is_empty() && args.len() == 1 && args[0].is_empty() {
            args.clear();
        }
        if mac.variadic.is_some() {
            let rest = args.split_off(params.len().min(args.len()));
            let mut joined = Vec::new();
            for (i, arg) in rest.into_iter().enumerate() {
                if i > 0 {
                    joined.push(Token::synthetic(TokenKind::Comma, ","));
                }
                joined.extend(arg);
            }
            args.resize_with(params.len(), Vec::new);
            args.push(joined);
        }
        let arg_index = |name: &str| {
            params
                .iter()
                .position(|p| p == name)
                .or_else(|| (mac.variadic.as_deref() == Some(name)).then_some(params.len()))
        };

        let body = &mac.body;
        let mut result: Vec<Token<'src>> = Vec::with_capacity(body.len());
        let mut i = 0;
        while let Some(t) = body.get(i) {
            i += 1;
            match t.kind {
                TokenKind::Hash => {
                    if let Some(idx) = body.get(i).and_then(|n| arg_index(n.text())) {
                        i += 1;
                        let arg = args.get(idx).map_or(&[][..], Vec::as_slice);
                        result.push(stringify(arg));
                        continue;
                    }
                    result.push(t.clone());
                }
                TokenKind::HashHash => {
                    let Some(right) = body.get(i) else { continue };
                    i += 1;
                    let right: Vec<Token<'src>> = match arg_index(right.text()) {
                        Some(idx) => args.get(idx).cloned().unwrap_or_default(),
                        None => vec![right.clone()],
                    };
                    let mut right = right.into_iter();
                    match (result.pop(), right.next()) {
                        (Some(left), Some(first)) => result.push(paste(&left, &first)),
                        (Some(left), None) => result.push(left),
                        (None, Some(first)) => result.push(first),
                        (None, None) => (),
                    }
                    result.extend(right);
                }
                _ => match arg_index(t.text()).filter(|_| t.kind.is_word()) {
                    Some(idx) => {
                        let arg = args.get(idx).cloned().unwrap_or_default();
                        if body.get(i).is_some_and(|n| n.kind == TokenKind::HashHash) {
                            result.extend(arg);
                        } else {
                            result.extend(self.expand(arg)?);
                        }
                    }
                    None => result.push(t.clone()),
                },
            }
        }
        Ok(relocate(result, site))
    }

    /// Evaluates the expression of an `#if` or `#elif` directive.
    fn evaluate(&mut self, hash: &Token<'src>, rest: &[Token<'src>]) -> Result<bool> {
        let mut replaced = Vec::with_capacity(rest.len());
        let mut cursor = 0;
        while let Some(t) = rest.get(cursor) {
            cursor += 1;
            match t.text() {
                "defined" => {
                    let parenthesized = rest.get(cursor).is_some_and(|t| t.kind == TokenKind::LParen);
                    let name_at = cursor + usize::from(parenthesized);
                    let Some(name) = rest.get(name_at).filter(|t| t.kind.is_word()) else {
                        self.malformed(hash, "expected a macro name after `defined`");
                        return Ok(false);
                    };
                    cursor = name_at + 1 + usize::from(parenthesized);
                    let defined = self.macros.contains_key(name.text());
                    replaced.push(number_token(t, defined));
                }
                "__has_include" | "__has_include_next" | "__has_attribute" | "__has_cpp_attribute"
                | "__has_builtin" | "__has_feature" | "__has_extension" => {
                    let Some((args, end)) = rest
                        .get(cursor)
                        .filter(|t| t.kind == TokenKind::LParen)
                        .and_then(|_| collect_args(rest, cursor + 1))
                    else {
                        self.malformed(hash, format!("expected `(` after `{}`", t.text()));
                        return Ok(false);
                    };
                    cursor = end;
                    let found = t.text().starts_with("__has_include")
                        && args.first().and_then(|a| a.first()).is_some_and(|a| {
                            a.kind == TokenKind::String
                                && self
                                    .sources
                                    .get_entry(&normalize_path(extract::string(a.text())))
                                    .is_some()
                        });
                    replaced.push(number_token(t, found));
                }
                _ => replaced.push(t.clone()),
            }
        }

        let expanded = self.expand(replaced)?;
        match Evaluator::new(&expanded).evaluate() {
            Some(value) => Ok(value != 0),
            None => {
                let message = format!("invalid conditional expression `{}`", spell(rest));
                self.malformed(hash, message);
                Ok(false)
            }
        }
    }
}

fn lex_error(token: &Token<'_>, kind: LexErrorKind) -> ExtractError {
    ExtractError::Lex {
        file: token.loc.file.to_owned(),
        location: token.loc.into(),
        kind,
    }
}

/// Returns the index of the first token after the directive line starting at
/// `start`.
fn line_end(tokens: &[Token<'_>], start: usize) -> usize {
    tokens[start + 1..]
        .iter()
        .position(|t| t.line_start || t.is_eof())
        .map_or(tokens.len(), |p| start + 1 + p)
}

/// Recognizes the `#ifndef X` / `#define X` / ... / `#endif` pattern wrapping
/// a whole file, returning the guarding macro.
fn detect_guard(tokens: &[Token<'_>]) -> Option<String> {
    let [hash, ifndef, guard, ..] = tokens else {
        return None;
    };
    if hash.kind != TokenKind::Hash || ifndef.text() != "ifndef" || !guard.kind.is_word() {
        return None;
    }

    let mut depth = 0_usize;
    let mut saw_define = false;
    let mut cursor = 0;
    while let Some(t) = tokens.get(cursor) {
        let end = line_end(tokens, cursor);
        if t.kind == TokenKind::Hash && t.line_start {
            let name = tokens.get(cursor + 1).map_or("", Token::text);
            let arg = tokens.get(cursor + 2).map_or("", Token::text);
            match name {
                "if" | "ifdef" | "ifndef" => depth += 1,
                "endif" => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        let trailing = tokens[end..].iter().all(Token::is_eof);
                        return (saw_define && trailing).then(|| guard.text().to_owned());
                    }
                }
                "define" if depth == 1 && cursor > 0 && !saw_define => {
                    if arg != guard.text() {
                        return None;
                    }
                    saw_define = true;
                }
                _ => (),
            }
        } else if !saw_define && !t.is_eof() {
            // Something other than the guard definition comes first.
            return None;
        }
        cursor = end.max(cursor + 1);
    }
    None
}

/// Parses a macro parameter list starting at the `(`. Returns the names, the
/// variadic name and the number of consumed tokens.
fn parse_params(tokens: &[Token<'_>]) -> Option<(Vec<String>, Option<String>, usize)> {
    let mut names = Vec::new();
    let mut variadic = None;
    let mut cursor = 1;
    loop {
        let t = tokens.get(cursor)?;
        cursor += 1;
        match t.kind {
            TokenKind::RParen if names.is_empty() && variadic.is_none() => break,
            TokenKind::Ellipsis => variadic = Some("__VA_ARGS__".to_owned()),
            kind if kind.is_word() => {
                if tokens.get(cursor).is_some_and(|n| n.kind == TokenKind::Ellipsis) {
                    cursor += 1;
                    variadic = Some(t.text().to_owned());
                } else {
                    names.push(t.text().to_owned());
                }
            }
            _ => return None,
        }
        match tokens.get(cursor)?.kind {
            TokenKind::RParen => {
                cursor += 1;
                break;
            }
            TokenKind::Comma if variadic.is_none() => cursor += 1,
            _ => return None,
        }
    }
    Some((names, variadic, cursor))
}

/// Collects the arguments of a macro invocation, starting just after the
/// opening parenthesis. Returns the arguments and the index after the closing
/// parenthesis, or `None` if it is never closed.
fn collect_args<'src>(tokens: &[Token<'src>], start: usize) -> Option<(Vec<Vec<Token<'src>>>, usize)> {
    let mut args = Vec::new();
    let mut current = Vec::new();
    let mut depth = 0_usize;
    for (i, t) in tokens.iter().enumerate().skip(start) {
        match t.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen if depth == 0 => {
                args.push(current);
                return Some((args, i + 1));
            }
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                args.push(std::mem::take(&mut current));
                continue;
            }
            _ => (),
        }
        current.push(t.clone());
    }
    None
}

/// Moves expanded tokens to the invocation site.
fn relocate<'src>(mut tokens: Vec<Token<'src>>, site: &Token<'src>) -> Vec<Token<'src>> {
    for (i, t) in tokens.iter_mut().enumerate() {
        t.span = site.span;
        t.loc = site.loc;
        t.line_start = false;
        if i == 0 {
            t.spaced = site.spaced;
        }
    }
    tokens
}

fn number_token<'src>(site: &Token<'src>, value: bool) -> Token<'src> {
    let mut token = site.clone();
    token.kind = TokenKind::Number;
    token.text = Cow::Borrowed(if value { "1" } else { "0" });
    token
}

fn stringify<'src>(arg: &[Token<'src>]) -> Token<'src> {
    let mut text = String::from('"');
    for c in spell(arg).chars() {
        if matches!(c, '"' | '\\') {
            text.push('\\');
        }
        text.push(c);
    }
    text.push('"');
    Token::synthetic(TokenKind::String, text)
}

fn paste<'src>(left: &Token<'src>, right: &Token<'src>) -> Token<'src> {
    let text = format!("{}{}", left.text(), right.text());
    let mut lexer = lexer::Lexer::new("<paste>", &text);
    let kind = match (lexer.next(), lexer.next()) {
        (Some(first), Some(second)) if second.is_eof() => first.kind,
        _ => TokenKind::Unknown,
    };
    let mut token = left.clone();
    token.kind = kind;
    token.text = Cow::Owned(text);
    token
}

/// Recognizes a macro body made of a single (optionally signed or
/// parenthesized) literal.
fn literal_value(body: &[Token<'_>]) -> Option<ConstValue> {
    let mut body = body;
    while let [TokenKind::LParen, .., TokenKind::RParen] =
        [body.first()?.kind, body.last()?.kind].as_slice()
    {
        body = &body[1..body.len() - 1];
    }
    let (negative, literal) = match body {
        [sign, literal] if sign.kind == TokenKind::Minus => (true, literal),
        [sign, literal] if sign.kind == TokenKind::Plus => (false, literal),
        [literal] => (false, literal),
        _ => return None,
    };
    let value = match literal.kind {
        TokenKind::Number => match extract::int(literal.text()) {
            Some(int) => ConstValue::Int(if negative { int.wrapping_neg() } else { int }),
            None => {
                let float = extract::float(literal.text())?;
                ConstValue::Float(if negative { -float } else { float })
            }
        },
        TokenKind::CharLiteral => {
            let int = extract::char(literal.text())?;
            ConstValue::Int(if negative { -int } else { int })
        }
        TokenKind::String if !negative => ConstValue::Str(extract::string(literal.text()).to_owned()),
        _ => return None,
    };
    Some(value)
}

pub(crate) fn parent_dir(path: &str) -> &str {
    path.rfind('/').map_or("", |i| &path[..i])
}

pub(crate) fn join_path(dir: &str, path: &str) -> String {
    if dir.is_empty() || path.starts_with('/') {
        normalize_path(path)
    } else {
        normalize_path(&format!("{dir}/{path}"))
    }
}

/// Removes `.` segments and resolves `..` segments lexically.
pub(crate) fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." if !segments.is_empty() || !path.starts_with('/') => (),
            ".." if segments.last().is_some_and(|s| *s != ".." && !s.is_empty()) => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }
    segments.join("/")
}

/// Evaluates `#if` expressions, using binding powers for the binary
/// operators.
struct Evaluator<'t, 'src> {
    tokens: &'t [Token<'src>],
    cursor: usize,
}

#[derive(Copy, Clone)]
enum BinOp {
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl<'t, 'src> Evaluator<'t, 'src> {
    fn new(tokens: &'t [Token<'src>]) -> Self {
        Evaluator { tokens, cursor: 0 }
    }

    fn evaluate(&mut self) -> Option<i64> {
        let value = self.parse_expr_bp(0)?;
        (self.cursor == self.tokens.len()).then_some(value)
    }

    fn peek(&self) -> Option<&'t Token<'src>> {
        self.tokens.get(self.cursor)
    }

    fn advance(&mut self) -> Option<&'t Token<'src>> {
        let t = self.tokens.get(self.cursor)?;
        self.cursor += 1;
        Some(t)
    }

    fn parse_expr_bp(&mut self, min_bp: u8) -> Option<i64> {
        let mut lhs = self.parse_nud()?;

        loop {
            // Ternary: lowest precedence, right-associative.
            if self.peek().is_some_and(|t| t.kind == TokenKind::Question) && min_bp <= 1 {
                self.advance();
                let then_arm = self.parse_expr_bp(0)?;
                if self.advance()?.kind != TokenKind::Colon {
                    return None;
                }
                let else_arm = self.parse_expr_bp(1)?;
                lhs = if lhs != 0 { then_arm } else { else_arm };
                continue;
            }
            let Some((op, width, (lbp, rbp))) = self.infix_binding_power() else {
                break;
            };
            if lbp < min_bp {
                break;
            }
            self.cursor += width;
            let rhs = self.parse_expr_bp(rbp)?;
            lhs = apply(op, lhs, rhs)?;
        }

        Some(lhs)
    }

    fn parse_nud(&mut self) -> Option<i64> {
        let token = self.advance()?;
        match token.kind {
            TokenKind::Number => extract::int(token.text()),
            TokenKind::CharLiteral => extract::char(token.text()),
            TokenKind::True => Some(1),
            TokenKind::False => Some(0),
            // Identifiers left after expansion are not macros.
            kind if kind.is_word() => Some(0),
            TokenKind::LParen => {
                let value = self.parse_expr_bp(0)?;
                (self.advance()?.kind == TokenKind::RParen).then_some(value)
            }
            TokenKind::Bang => Some(i64::from(self.parse_expr_bp(Self::PREFIX_BP)? == 0)),
            TokenKind::Tilde => Some(!self.parse_expr_bp(Self::PREFIX_BP)?),
            TokenKind::Minus => Some(self.parse_expr_bp(Self::PREFIX_BP)?.wrapping_neg()),
            TokenKind::Plus => self.parse_expr_bp(Self::PREFIX_BP),
            _ => None,
        }
    }

    const PREFIX_BP: u8 = 23;

    /// Returns the operator, its width in tokens, and its binding power.
    fn infix_binding_power(&self) -> Option<(BinOp, usize, (u8, u8))> {
        let token = self.peek()?;
        let next = self.tokens.get(self.cursor + 1);
        let op = match token.kind {
            TokenKind::PipePipe => (BinOp::Or, 1, (2, 3)),
            TokenKind::AmpAmp => (BinOp::And, 1, (4, 5)),
            TokenKind::Pipe => (BinOp::BitOr, 1, (6, 7)),
            TokenKind::Caret => (BinOp::BitXor, 1, (8, 9)),
            TokenKind::Amp => (BinOp::BitAnd, 1, (10, 11)),
            TokenKind::EqEq => (BinOp::Eq, 1, (12, 13)),
            TokenKind::NotEq => (BinOp::Ne, 1, (12, 13)),
            // `>>` is lexed as two adjacent `>`.
            TokenKind::Greater
                if next.is_some_and(|n| n.kind == TokenKind::Greater && n.span.lo == token.span.hi()) =>
            {
                (BinOp::Shr, 2, (16, 17))
            }
            TokenKind::Less => (BinOp::Lt, 1, (14, 15)),
            TokenKind::LessEq => (BinOp::Le, 1, (14, 15)),
            TokenKind::Greater => (BinOp::Gt, 1, (14, 15)),
            TokenKind::GreaterEq => (BinOp::Ge, 1, (14, 15)),
            TokenKind::LessLess => (BinOp::Shl, 1, (16, 17)),
            TokenKind::Plus => (BinOp::Add, 1, (18, 19)),
            TokenKind::Minus => (BinOp::Sub, 1, (18, 19)),
            TokenKind::Star => (BinOp::Mul, 1, (20, 21)),
            TokenKind::Slash => (BinOp::Div, 1, (20, 21)),
            TokenKind::Percent => (BinOp::Rem, 1, (20, 21)),
            _ => return None,
        };
        Some(op)
    }
}

fn apply(op: BinOp, lhs: i64, rhs: i64) -> Option<i64> {
    let value = match op {
        BinOp::Or => i64::from(lhs != 0 || rhs != 0),
        BinOp::And => i64::from(lhs != 0 && rhs != 0),
        BinOp::BitOr => lhs | rhs,
        BinOp::BitXor => lhs ^ rhs,
        BinOp::BitAnd => lhs & rhs,
        BinOp::Eq => i64::from(lhs == rhs),
        BinOp::Ne => i64::from(lhs != rhs),
        BinOp::Lt => i64::from(lhs < rhs),
        BinOp::Le => i64::from(lhs <= rhs),
        BinOp::Gt => i64::from(lhs > rhs),
        BinOp::Ge => i64::from(lhs >= rhs),
        BinOp::Shl => lhs.wrapping_shl(u32::try_from(rhs).ok()?),
        BinOp::Shr => lhs.wrapping_shr(u32::try_from(rhs).ok()?),
        BinOp::Add => lhs.wrapping_add(rhs),
        BinOp::Sub => lhs.wrapping_sub(rhs),
        BinOp::Mul => lhs.wrapping_mul(rhs),
        BinOp::Div => lhs.checked_div(rhs)?,
        BinOp::Rem => lhs.checked_rem(rhs)?,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn run(files: &[(&str, &str)], config: &Config) -> (String, Vec<String>) {
        let mut sources = SourceMap::new();
        for (path, text) in files {
            sources.insert(*path, *text);
        }
        let mut diagnostics = Vec::new();
        let out = preprocess(&sources, files[0].0, config, &mut diagnostics).expect("preprocess failed");
        let text = spell(&out.tokens);
        let diagnostics = diagnostics.iter().map(ToString::to_string).collect();
        (text, diagnostics)
    }

    fn pp(src: &str) -> String {
        run(&[("test.h", src)], &Config::default()).0
    }

    #[test]
    fn object_like_macros_are_inlined() {
        let src = indoc! {"
            #define SIZE 16
            #define BUF char buf[SIZE]
            struct S { BUF; };
        "};
        assert_eq!(pp(src), "struct S { char buf[16]; };");
    }

    #[test]
    fn function_like_macros() {
        let src = indoc! {r#"
            #define DECL(type, name) type name;
            #define STR(x) #x
            #define CAT(a, b) a ## b
            #define LOG(fmt, ...) log(fmt, __VA_ARGS__)
            DECL(int, count)
            const char *s = STR(a "b");
            int CAT(foo, _bar);
            LOG("x", 1, 2);
            DECL
        "#};
        assert_eq!(
            pp(src),
            r#"int count; const char *s = "a \"b\""; int foo_bar; log("x", 1, 2); DECL"#
        );
    }

    #[test]
    fn recursive_macros_do_not_loop() {
        let src = indoc! {"
            #define foo foo + 1
            #define a b
            #define b a
            foo; a;
        "};
        assert_eq!(pp(src), "foo + 1; a;");
    }

    #[test]
    fn platform_flags_select_branches() {
        let src = indoc! {"
            #if defined(WIN)
            int win;
            #elif defined LINUX && !defined(OSX)
            int linux;
            #else
            int other;
            #endif
            #ifdef OSX
            int osx;
            #endif
        "};
        let config = Config::default()
            .with_flag("WIN", false)
            .with_flag("OSX", false)
            .with_flag("LINUX", true);
        let (text, diagnostics) = run(&[("test.h", src)], &config);
        assert_eq!(text, "int linux;");
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn nested_conditionals_in_dead_branches_stay_dead() {
        let src = indoc! {"
            #if 0
            #  if 1
            int a;
            #  else
            int b;
            #  endif
            #error never reported
            #else
            int c;
            #endif
        "};
        let (text, diagnostics) = run(&[("test.h", src)], &Config::default());
        assert_eq!(text, "int c;");
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn if_expressions() {
        let src = indoc! {"
            #define VERSION 0x0203
            #if (VERSION >> 8) == 2 && VERSION % 2 == 1 ? 1 : 0
            int yes;
            #endif
            #if UNDEFINED_NAME || 1 / 0
            int no;
            #endif
        "};
        let (text, diagnostics) = run(&[("test.h", src)], &Config::default());
        assert_eq!(text, "int yes;");
        assert_eq!(
            diagnostics,
            ["test.h:5:1: warning: invalid conditional expression `UNDEFINED_NAME || 1 / 0` [MalformedDirective]"]
        );
    }

    #[test]
    fn stripped_macros_are_removed() {
        let src = indoc! {"
            #define CORE_API __declspec(dllexport)
            CORE_API void f(void);
            DEPRECATED(\"use g\") void g(void);
        "};
        let config = Config::default()
            .with_stripped_macro("CORE_API")
            .with_stripped_macro("DEPRECATED");
        let (text, _) = run(&[("test.h", src)], &config);
        assert_eq!(text, "void f(void); void g(void);");
    }

    #[test]
    fn includes_resolve_against_the_source_map() {
        let files = [
            ("inc/main.h", "#include \"types.h\"\n#include \"types.h\"\n#include <stdio.h>\nint b;"),
            (
                "inc/types.h",
                "#ifndef TYPES_H\n#define TYPES_H\n#include \"../inc/once.h\"\nint a;\n#endif\n",
            ),
            ("inc/once.h", "#pragma once\nint o;\n#include \"once.h\"\n"),
        ];
        let (text, diagnostics) = run(&files, &Config::default());
        assert_eq!(text, "int o; int a; int b;");
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn include_guards_are_detected() {
        let tokens = lexer::lex_in_new("g.h", "#ifndef G\n#define G\n#if X\n#endif\nint a;\n#endif\n");
        assert_eq!(detect_guard(&tokens).as_deref(), Some("G"));

        let tokens = lexer::lex_in_new("g.h", "#ifndef G\n#define G\n#endif\nint a;\n");
        assert_eq!(detect_guard(&tokens), None);

        let tokens = lexer::lex_in_new("g.h", "#ifndef G\n#define H\n#endif\n");
        assert_eq!(detect_guard(&tokens), None);
    }

    #[test]
    fn literal_macros_become_constants() {
        let src = indoc! {r#"
            #define MAX_SIZE 1024
            #define NEGATIVE (-5)
            #define RATIO 1.5f
            #define NAME "jansson"
            #define EMPTY
            #define EXPR (1 << 2)
            #define MAX_SIZE 2048
        "#};
        let mut sources = SourceMap::new();
        sources.insert("c.h", src);
        let mut diagnostics = Vec::new();
        let out = preprocess(&sources, "c.h", &Config::default(), &mut diagnostics).unwrap();
        let constants: Vec<_> = out
            .constants
            .iter()
            .map(|c| (c.name.as_str(), c.value.clone()))
            .collect();
        assert_eq!(
            constants,
            [
                ("MAX_SIZE", ConstValue::Int(2048)),
                ("NEGATIVE", ConstValue::Int(-5)),
                ("RATIO", ConstValue::Float(1.5)),
                ("NAME", ConstValue::Str("jansson".into())),
                ("EXPR", ConstValue::Int(4)),
            ]
        );
    }

    #[test]
    fn integer_expression_macros_become_constants() {
        let src = indoc! {r"
            #define BASE 10
            #define TOTAL (BASE * 2)
            #define FLAGS (0x01 | 0x02 | 0x04)
            #define MASK ~(1 << 4)
            #define SIZE sizeof(int)
            #define UNKNOWN (OTHER + 1)
            #define THIRD (1.0 / 3)
            #define CALL f(1)
        "};
        let mut sources = SourceMap::new();
        sources.insert("c.h", src);
        let mut diagnostics = Vec::new();
        let out = preprocess(&sources, "c.h", &Config::default(), &mut diagnostics).unwrap();
        let constants: Vec<_> = out
            .constants
            .iter()
            .map(|c| (c.name.as_str(), c.value.clone()))
            .collect();
        assert_eq!(
            constants,
            [
                ("BASE", ConstValue::Int(10)),
                ("TOTAL", ConstValue::Int(20)),
                ("FLAGS", ConstValue::Int(7)),
                ("MASK", ConstValue::Int(!16)),
            ]
        );
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn undefined_macros_are_not_constants() {
        let src = indoc! {"
            #define LIMIT 5
            #define KEPT 6
            #undef LIMIT
            void f(void);
        "};
        let mut sources = SourceMap::new();
        sources.insert("c.h", src);
        let mut diagnostics = Vec::new();
        let out = preprocess(&sources, "c.h", &Config::default(), &mut diagnostics).unwrap();
        let names: Vec<_> = out.constants.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["KEPT"]);
    }

    #[test]
    fn directive_diagnostics() {
        let src = indoc! {"
            #error unsupported platform
            #endif
            #frobnicate
            #if 1
        "};
        let (_, diagnostics) = run(&[("d.h", src)], &Config::default());
        assert_eq!(
            diagnostics,
            [
                "d.h:1:1: error: #error unsupported platform [ErrorDirective]",
                "d.h:2:1: warning: #endif without #if [UnbalancedConditional]",
                "d.h:3:1: warning: unknown directive #frobnicate [MalformedDirective]",
                "d.h:5:1: warning: 1 unterminated conditional directive(s) [UnbalancedConditional]",
            ]
        );
    }

    #[test]
    fn lex_errors_abort() {
        let mut sources = SourceMap::new();
        sources.insert("bad.h", "int a;\nconst char *s = \"oops;\n");
        let mut diagnostics = Vec::new();
        let error = preprocess(&sources, "bad.h", &Config::default(), &mut diagnostics).unwrap_err();
        assert_eq!(error.to_string(), "bad.h:2:17: unterminated string literal");
        assert!(diagnostics.is_empty());

        // Unterminated literals in dead branches are harmless.
        sources.insert("ok.h", "#if 0\nchar c = 'x;\n#endif\n#error can't happen\n");
        assert!(preprocess(&sources, "ok.h", &Config::default(), &mut diagnostics).is_ok());
    }

    #[test]
    fn lex_errors_keep_earlier_diagnostics() {
        let mut sources = SourceMap::new();
        sources.insert("bad.h", "#foo\nint x;\nconst char *s = \"abc;\n");
        let mut diagnostics = Vec::new();
        let error = preprocess(&sources, "bad.h", &Config::default(), &mut diagnostics).unwrap_err();
        assert_eq!(error.to_string(), "bad.h:3:17: unterminated string literal");
        let diagnostics: Vec<_> = diagnostics.iter().map(ToString::to_string).collect();
        assert_eq!(
            diagnostics,
            ["bad.h:1:1: warning: unknown directive #foo [MalformedDirective]"]
        );
    }

    #[test]
    fn paths() {
        assert_eq!(normalize_path("a/./b/../c.h"), "a/c.h");
        assert_eq!(join_path("inc", "../x.h"), "x.h");
        assert_eq!(parent_dir("inc/sub/a.h"), "inc/sub");
        assert_eq!(parent_dir("a.h"), "");
    }
}
