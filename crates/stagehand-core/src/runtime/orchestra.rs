//! Parser for the simulated runtime's orchestra and score text.
//!
//! ```text
//! sr = 48000
//! ksmps = 64
//! nchnls = 2
//!
//! instr 1
//!   iamp = p4
//!   kenv = kenv + 1
//!   chnset iamp * kenv, "level"
//!   kgain chnget "gain"
//!   kstep table kenv, 1
//!   tablew kgain, 0, 1
//!   print iamp
//! endin
//!
//! f 1 0 4 -2 0 0.25 0.5 1
//! i 1 0 2 0.5
//! ```

use super::{InstrumentId, ScoreEvent, TableId};
use crate::error::{EngineError, Result};
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Binary arithmetic operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    /// p-field reference, 1-based (`p4`).
    PField(usize),
    Var(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

/// Update rate of a variable, derived from its name prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rate {
    /// `i` variables: evaluated on the init pass only.
    Init,
    /// Everything else: evaluated every control cycle.
    Control,
}

impl Rate {
    pub fn of(name: &str) -> Self {
        if name.starts_with('i') {
            Rate::Init
        } else {
            Rate::Control
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum StatementKind {
    Assign { target: String, expr: Expr },
    ChnGet { target: String, channel: String },
    ChnSet { expr: Expr, channel: String },
    /// `kx table kindex, ifn`
    TableRead { target: String, index: Expr, table: Expr },
    /// `tablew kvalue, kindex, ifn`
    TableWrite { value: Expr, index: Expr, table: Expr },
    /// `print iexpr`; `label` is the expression as written.
    Print { label: String, expr: Expr },
    TurnOff,
}

/// One instrument body line.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    /// 1-based source line.
    pub line: usize,
    pub kind: StatementKind,
}

impl Statement {
    /// Rate at which this statement executes.
    pub fn rate(&self) -> Rate {
        match &self.kind {
            StatementKind::Assign { target, .. }
            | StatementKind::ChnGet { target, .. }
            | StatementKind::TableRead { target, .. } => Rate::of(target),
            StatementKind::Print { .. } => Rate::Init,
            StatementKind::ChnSet { .. }
            | StatementKind::TableWrite { .. }
            | StatementKind::TurnOff => Rate::Control,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct InstrumentDef {
    pub id: InstrumentId,
    /// Line of the `instr` header.
    pub first_line: usize,
    /// Line of the `endin` footer.
    pub last_line: usize,
    pub statements: Vec<Statement>,
}

/// A function table from an `f` statement.
#[derive(Clone, Debug, PartialEq)]
pub struct TableDef {
    pub number: TableId,
    pub values: Vec<f64>,
}

/// Largest table an `f` statement may allocate.
const MAX_TABLE_SIZE: usize = 1 << 24;

/// Result of parsing one chunk of orchestra/score text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedCode {
    pub sample_rate: Option<f64>,
    pub ksmps: Option<u32>,
    pub control_rate: Option<f64>,
    pub nchnls: Option<u32>,
    pub instruments: Vec<InstrumentDef>,
    /// Score statements with their source line.
    pub score: Vec<(usize, ScoreEvent)>,
    pub tables: Vec<(usize, TableDef)>,
}

/// Parse orchestra and score text.
pub fn parse(code: &str) -> Result<ParsedCode> {
    let mut parsed = ParsedCode::default();
    let mut current: Option<InstrumentDef> = None;

    for (index, raw) in code.lines().enumerate() {
        let line = index + 1;
        let text = strip_comment(raw).trim();
        if text.is_empty() {
            continue;
        }
        let mut words = text.split_whitespace();
        let first = words.next().unwrap_or_default();

        if let Some(def) = current.as_mut() {
            match first {
                "instr" => return Err(EngineError::compile(line, "nested instr (missing endin)")),
                "endin" => {
                    def.last_line = line;
                    if let Some(def) = current.take() {
                        check_definitions(&def)?;
                        parsed.instruments.push(def);
                    }
                }
                _ => def.statements.push(parse_statement(text, line)?),
            }
            continue;
        }

        match first {
            "instr" => {
                let id = words
                    .next()
                    .and_then(|w| w.parse::<InstrumentId>().ok())
                    .filter(|id| *id > 0)
                    .ok_or_else(|| {
                        EngineError::compile(line, "instr needs a positive integer id")
                    })?;
                if parsed.instruments.iter().any(|i| i.id == id) {
                    return Err(EngineError::compile(line, format!("instr {} redefined", id)));
                }
                current = Some(InstrumentDef {
                    id,
                    first_line: line,
                    last_line: line,
                    statements: Vec::new(),
                });
            }
            "endin" => return Err(EngineError::compile(line, "endin without instr")),
            "i" => parsed.score.push((line, parse_score_line(text, line)?)),
            "f" => parsed.tables.push((line, parse_table_line(text, line)?)),
            _ => parse_header(text, line, &mut parsed)?,
        }
    }

    if let Some(def) = current {
        return Err(EngineError::compile(
            def.first_line,
            format!("instr {} is missing endin", def.id),
        ));
    }
    Ok(parsed)
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ';' if !in_string => return &line[..i],
            _ => {}
        }
    }
    line
}

fn parse_header(text: &str, line: usize, parsed: &mut ParsedCode) -> Result<()> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| EngineError::compile(line, format!("unexpected '{}'", text)))?;
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| EngineError::compile(line, "header value must be a number"))?;
    match name.trim() {
        "sr" => parsed.sample_rate = Some(value),
        "ksmps" => {
            if value < 1.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
                return Err(EngineError::compile(line, "ksmps must be a positive integer"));
            }
            parsed.ksmps = Some(value as u32);
        }
        "kr" => parsed.control_rate = Some(value),
        "nchnls" => {
            if value < 1.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
                return Err(EngineError::compile(line, "nchnls must be a positive integer"));
            }
            parsed.nchnls = Some(value as u32);
        }
        "nchnls_i" | "0dbfs" => {}
        other => {
            return Err(EngineError::compile(
                line,
                format!("unknown header variable '{}'", other),
            ))
        }
    }
    Ok(())
}

/// Arguments of an opcode without output, if `text` starts with it.
fn strip_opcode<'a>(text: &'a str, opcode: &str) -> Option<&'a str> {
    text.strip_prefix(opcode)
        .filter(|rest| rest.starts_with(char::is_whitespace))
}

/// Split comma separated arguments into exactly `N` expressions.
fn parse_args<const N: usize>(args: &str, line: usize, usage: &str) -> Result<[Expr; N]> {
    let parts: Vec<&str> = args.split(',').collect();
    if parts.len() != N {
        return Err(EngineError::compile(line, format!("usage: {}", usage)));
    }
    let exprs = parts
        .into_iter()
        .map(|part| parse_expr(part, line))
        .collect::<Result<Vec<_>>>()?;
    exprs
        .try_into()
        .map_err(|_| EngineError::compile(line, format!("usage: {}", usage)))
}

fn parse_statement(text: &str, line: usize) -> Result<Statement> {
    let kind = if text == "turnoff" {
        StatementKind::TurnOff
    } else if let Some(rest) = strip_opcode(text, "print") {
        StatementKind::Print {
            label: rest.trim().to_string(),
            expr: parse_expr(rest, line)?,
        }
    } else if let Some(rest) = strip_opcode(text, "tablew") {
        let [value, index, table] = parse_args(rest, line, "tablew value, index, table")?;
        StatementKind::TableWrite {
            value,
            index,
            table,
        }
    } else if let Some((target, args)) = split_opcode(text, "table") {
        check_identifier(target, line)?;
        let [index, table] = parse_args(args, line, "kout table index, table")?;
        StatementKind::TableRead {
            target: target.to_string(),
            index,
            table,
        }
    } else if let Some(rest) = strip_opcode(text, "chnset") {
        let (expr, channel) = rest
            .rsplit_once(',')
            .ok_or_else(|| EngineError::compile(line, "chnset needs: value, \"channel\""))?;
        StatementKind::ChnSet {
            expr: parse_expr(expr, line)?,
            channel: parse_string_literal(channel, line)?,
        }
    } else if let Some((target, channel)) = split_opcode(text, "chnget") {
        check_identifier(target, line)?;
        StatementKind::ChnGet {
            target: target.to_string(),
            channel: parse_string_literal(channel, line)?,
        }
    } else if let Some((target, expr)) = text.split_once('=') {
        let target = target.trim();
        check_identifier(target, line)?;
        StatementKind::Assign {
            target: target.to_string(),
            expr: parse_expr(expr, line)?,
        }
    } else {
        return Err(EngineError::compile(line, format!("unknown statement '{}'", text)));
    };
    Ok(Statement { line, kind })
}

fn split_opcode<'a>(text: &'a str, opcode: &str) -> Option<(&'a str, &'a str)> {
    let (target, rest) = text.split_once(char::is_whitespace)?;
    let args = rest.trim_start().strip_prefix(opcode)?;
    if !args.is_empty() && !args.starts_with(char::is_whitespace) {
        return None;
    }
    Some((target, args))
}

fn check_identifier(name: &str, line: usize) -> Result<()> {
    let mut chars = name.chars();
    let well_formed = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    let is_pfield = name
        .strip_prefix('p')
        .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    if well_formed && !is_pfield {
        Ok(())
    } else {
        Err(EngineError::compile(line, format!("invalid variable name '{}'", name)))
    }
}

fn parse_string_literal(text: &str, line: usize) -> Result<String> {
    let text = text.trim();
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .map(str::to_string)
        .ok_or_else(|| EngineError::compile(line, "expected a quoted channel name"))
}

/// Every variable read must be assigned somewhere in the instrument.
fn check_definitions(def: &InstrumentDef) -> Result<()> {
    let assigned: BTreeSet<&str> = def
        .statements
        .iter()
        .filter_map(|s| match &s.kind {
            StatementKind::Assign { target, .. }
            | StatementKind::ChnGet { target, .. }
            | StatementKind::TableRead { target, .. } => Some(target.as_str()),
            _ => None,
        })
        .collect();

    for statement in &def.statements {
        let exprs: Vec<&Expr> = match &statement.kind {
            StatementKind::Assign { expr, .. }
            | StatementKind::ChnSet { expr, .. }
            | StatementKind::Print { expr, .. } => vec![expr],
            StatementKind::TableRead { index, table, .. } => vec![index, table],
            StatementKind::TableWrite {
                value,
                index,
                table,
            } => vec![value, index, table],
            StatementKind::ChnGet { .. } | StatementKind::TurnOff => continue,
        };
        if let Some(name) = exprs.into_iter().find_map(|e| first_unknown(e, &assigned)) {
            return Err(EngineError::compile(
                statement.line,
                format!("variable '{}' used but never assigned", name),
            ));
        }
    }
    Ok(())
}

fn first_unknown<'a>(expr: &'a Expr, known: &BTreeSet<&str>) -> Option<&'a str> {
    match expr {
        Expr::Var(name) if !known.contains(name.as_str()) => Some(name),
        Expr::Neg(inner) => first_unknown(inner, known),
        Expr::Binary(lhs, _, rhs) => first_unknown(lhs, known).or_else(|| first_unknown(rhs, known)),
        _ => None,
    }
}

/// Next signed number of a score statement.
fn next_number(fields: &mut impl Iterator<Item = Token>, line: usize, what: &str) -> Result<f64> {
    match fields.next() {
        Some(Token::Number(v)) => Ok(v),
        Some(Token::Minus) => match fields.next() {
            Some(Token::Number(v)) => Ok(-v),
            _ => Err(EngineError::compile(line, format!("score {} must be numeric", what))),
        },
        _ => Err(EngineError::compile(line, format!("score {} must be numeric", what))),
    }
}

/// A positive integer field that fits in `u32`.
fn next_id(fields: &mut impl Iterator<Item = Token>, line: usize, what: &str) -> Result<u32> {
    let value = next_number(fields, line, what)?;
    if value < 1.0 || value.fract() != 0.0 || value > u32::MAX as f64 {
        return Err(EngineError::compile(
            line,
            format!("{} must be a positive integer", what),
        ));
    }
    Ok(value as u32)
}

/// Parse a score statement: `i <instr> <start> <dur> [p4 ...]`.
pub fn parse_score_line(text: &str, line: usize) -> Result<ScoreEvent> {
    let mut fields = tokenize(text.trim_start_matches('i'), line)?.into_iter();
    let instrument: InstrumentId = next_id(&mut fields, line, "instrument")?;
    let start = next_number(&mut fields, line, "start")?;
    let duration = next_number(&mut fields, line, "duration")?;

    let mut pfields = Vec::new();
    let mut negate = false;
    for token in fields {
        match token {
            Token::Minus => negate = true,
            Token::Number(v) => {
                pfields.push(Value::Scalar(if negate { -v } else { v }));
                negate = false;
            }
            Token::Text(s) => pfields.push(Value::Text(s)),
            other => {
                return Err(EngineError::compile(
                    line,
                    format!("unexpected {:?} in score statement", other),
                ))
            }
        }
    }

    Ok(ScoreEvent {
        instrument,
        start: start.max(0.0),
        duration,
        pfields,
    })
}

/// Parse a table statement: `f <table> <time> <size> <gen> [values ...]`.
///
/// Only GEN02 is supported: `2` normalizes the values to a peak of 1,
/// `-2` keeps them as written. Missing values are zero.
pub fn parse_table_line(text: &str, line: usize) -> Result<TableDef> {
    let mut fields = tokenize(text.trim_start_matches('f'), line)?.into_iter();
    let number: TableId = next_id(&mut fields, line, "table number")?;
    next_number(&mut fields, line, "table time")?;
    let size = next_id(&mut fields, line, "table size")? as usize;
    if size > MAX_TABLE_SIZE {
        return Err(EngineError::compile(
            line,
            format!("table size {} exceeds {}", size, MAX_TABLE_SIZE),
        ));
    }
    let routine = next_number(&mut fields, line, "GEN routine")?;
    if routine.abs() != 2.0 {
        return Err(EngineError::compile(
            line,
            format!("GEN{} is not supported (use 2 or -2)", routine),
        ));
    }

    let mut values = Vec::with_capacity(size);
    let mut rest = fields.peekable();
    while rest.peek().is_some() {
        values.push(next_number(&mut rest, line, "table value")?);
    }
    if values.len() > size {
        return Err(EngineError::compile(
            line,
            format!("{} values for a table of size {}", values.len(), size),
        ));
    }
    values.resize(size, 0.0);

    if routine > 0.0 {
        let peak = values.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if peak > 0.0 {
            values.iter_mut().for_each(|v| *v /= peak);
        }
    }
    Ok(TableDef { number, values })
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Text(String),
    Ident(String),
    PField(usize),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(text: &str, line: usize) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&c| c == '"')
                    .ok_or_else(|| EngineError::compile(line, "unterminated string"))?;
                tokens.push(Token::Text(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse()
                    .map_err(|_| EngineError::compile(line, format!("bad number '{}'", literal)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.strip_prefix('p').and_then(|n| n.parse::<usize>().ok()) {
                    Some(0) => return Err(EngineError::compile(line, "p-fields start at p1")),
                    Some(n) => tokens.push(Token::PField(n)),
                    None => tokens.push(Token::Ident(word)),
                }
            }
            other => {
                return Err(EngineError::compile(
                    line,
                    format!("unexpected character '{}'", other),
                ))
            }
        }
    }
    Ok(tokens)
}

/// Parse an arithmetic expression.
pub fn parse_expr(text: &str, line: usize) -> Result<Expr> {
    let tokens = tokenize(text, line)?;
    if tokens.is_empty() {
        return Err(EngineError::compile(line, "missing expression"));
    }
    let mut parser = ExprParser {
        tokens,
        pos: 0,
        line,
    };
    let expr = parser.sum()?;
    if parser.pos != parser.tokens.len() {
        return Err(EngineError::compile(line, "trailing tokens in expression"));
    }
    Ok(expr)
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn sum(&mut self) -> Result<Expr> {
        let mut lhs = self.product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.product()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
    }

    fn product(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(Box::new(lhs), op, Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Minus) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Text(s)) => Ok(Expr::Text(s)),
            Some(Token::PField(n)) => Ok(Expr::PField(n)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::LParen) => {
                let inner = self.sum()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(EngineError::compile(self.line, "missing ')'")),
                }
            }
            other => Err(EngineError::compile(
                self.line,
                format!("unexpected {:?} in expression", other),
            )),
        }
    }
}

/// Index of instruments by id, as returned by a successful parse.
pub fn index(instruments: Vec<InstrumentDef>) -> BTreeMap<InstrumentId, InstrumentDef> {
    instruments.into_iter().map(|def| (def.id, def)).collect()
}
