//! A small snippet language.
//!
//! Statements are separated by `;`:
//!
//! | statement        | effect                                             |
//! |------------------|----------------------------------------------------|
//! | `var x = <expr>` | defines or redefines `x`                           |
//! | `print <expr>`   | writes the value and a new line to `out`           |
//! | `eprint <expr>`  | writes the value and a new line to `err`           |
//! | `read x`         | reads one line of `in` into `x`                    |
//! | `sleep <expr>`   | sleeps for that many milliseconds                  |
//! | `spin`           | never completes on its own                         |
//! | `<expr>`         | evaluates the expression                           |
//!
//! Expressions are made of integers, double-quoted strings, variables, `+ - * /` and
//! parentheses. `+` concatenates as soon as one side is a string.
//!
//! The value of a snippet is the value of its last statement, `print`, `eprint`, `read`, `sleep`
//! having none.

use std::{collections::BTreeMap, fmt, time::Duration};

use crate::{
    operate::capnp::execution::{ERR, OUT},
    runtime::Unwind,
};

/// What a snippet can do to the process hosting it.
pub trait Host {
    /// Gives process control a chance to suspend or unwind the snippet.
    fn safepoint(&mut self) -> Result<(), Unwind>;

    fn sleep(&mut self, duration: Duration) -> Result<(), Unwind>;

    fn write(&mut self, stream: &str, text: &str) -> Result<(), String>;

    /// Reads one line without its terminator, `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>, String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datum {
    Int(i64),
    Text(String),
}

impl Datum {
    /// Rendering used by `print` and concatenation.
    fn plain(&self) -> String {
        match self {
            Datum::Int(i) => i.to_string(),
            Datum::Text(s) => s.clone(),
        }
    }
}

/// Rendering of a snippet value.
impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Int(i) => write!(f, "{i}"),
            Datum::Text(s) => write!(f, "{s:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnippetError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("{0}")]
    Run(String),
    #[error(transparent)]
    Interrupted(#[from] Unwind),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int(i64),
    Text(String),
    Ident(String),
    Punct(char),
}

fn tokenize(source: &str) -> Result<Vec<Token>, SnippetError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(d);
                    chars.next();
                }
                let value = digits
                    .parse()
                    .map_err(|_| SnippetError::Syntax(format!("integer {digits} is too large")))?;
                tokens.push(Token::Int(value));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(c @ ('"' | '\\')) => text.push(c),
                            Some(c) => {
                                return Err(SnippetError::Syntax(format!("unknown escape \\{c}")))
                            }
                            None => {
                                return Err(SnippetError::Syntax("unterminated string".to_owned()))
                            }
                        },
                        Some(c) => text.push(c),
                        None => return Err(SnippetError::Syntax("unterminated string".to_owned())),
                    }
                }
                tokens.push(Token::Text(text));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek().filter(|d| d.is_alphanumeric() || **d == '_') {
                    ident.push(d);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            '+' | '-' | '*' | '/' | '(' | ')' | '=' | ';' => {
                tokens.push(Token::Punct(c));
                chars.next();
            }
            c => return Err(SnippetError::Syntax(format!("unexpected `{c}`"))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Int(i64),
    Text(String),
    Var(String),
    Neg(Box<Expr>),
    Binary(char, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    Var(String, Expr),
    Print(&'static str, Expr),
    Read(String),
    Sleep(Expr),
    Spin,
    Expr(Expr),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, punct: char) -> bool {
        if self.peek() == Some(&Token::Punct(punct)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, SnippetError> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(SnippetError::Syntax(format!(
                "expected a name, found {}",
                describe(other.as_ref())
            ))),
        }
    }

    fn program(&mut self) -> Result<Vec<Statement>, SnippetError> {
        let mut statements = Vec::new();
        loop {
            while self.eat(';') {}
            if self.peek().is_none() {
                return Ok(statements);
            }
            statements.push(self.statement()?);
            if self.peek().is_some() && !self.eat(';') {
                return Err(SnippetError::Syntax(format!(
                    "expected `;`, found {}",
                    describe(self.peek())
                )));
            }
        }
    }

    fn statement(&mut self) -> Result<Statement, SnippetError> {
        let keyword = match self.peek() {
            Some(Token::Ident(keyword)) => keyword.clone(),
            _ => return Ok(Statement::Expr(self.expr()?)),
        };
        let statement = match keyword.as_str() {
            "var" => {
                self.pos += 1;
                let name = self.ident()?;
                if !self.eat('=') {
                    return Err(SnippetError::Syntax(format!("expected `=` after var {name}")));
                }
                Statement::Var(name, self.expr()?)
            }
            "print" => {
                self.pos += 1;
                Statement::Print(OUT, self.expr()?)
            }
            "eprint" => {
                self.pos += 1;
                Statement::Print(ERR, self.expr()?)
            }
            "read" => {
                self.pos += 1;
                Statement::Read(self.ident()?)
            }
            "sleep" => {
                self.pos += 1;
                Statement::Sleep(self.expr()?)
            }
            "spin" => {
                self.pos += 1;
                Statement::Spin
            }
            _ => Statement::Expr(self.expr()?),
        };
        Ok(statement)
    }

    fn expr(&mut self) -> Result<Expr, SnippetError> {
        let mut lhs = self.term()?;
        loop {
            let op = if self.eat('+') {
                '+'
            } else if self.eat('-') {
                '-'
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.term()?));
        }
    }

    fn term(&mut self) -> Result<Expr, SnippetError> {
        let mut lhs = self.factor()?;
        loop {
            let op = if self.eat('*') {
                '*'
            } else if self.eat('/') {
                '/'
            } else {
                return Ok(lhs);
            };
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(self.factor()?));
        }
    }

    fn factor(&mut self) -> Result<Expr, SnippetError> {
        match self.next() {
            Some(Token::Int(i)) => Ok(Expr::Int(i)),
            Some(Token::Text(s)) => Ok(Expr::Text(s)),
            Some(Token::Ident(name)) => Ok(Expr::Var(name)),
            Some(Token::Punct('-')) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(Token::Punct('(')) => {
                let inner = self.expr()?;
                if !self.eat(')') {
                    return Err(SnippetError::Syntax(format!(
                        "expected `)`, found {}",
                        describe(self.peek())
                    )));
                }
                Ok(inner)
            }
            other => Err(SnippetError::Syntax(format!(
                "expected an expression, found {}",
                describe(other.as_ref())
            ))),
        }
    }
}

fn describe(token: Option<&Token>) -> String {
    match token {
        None => "end of snippet".to_owned(),
        Some(Token::Int(i)) => i.to_string(),
        Some(Token::Text(s)) => format!("{s:?}"),
        Some(Token::Ident(name)) => format!("`{name}`"),
        Some(Token::Punct(c)) => format!("`{c}`"),
    }
}

fn parse(source: &str) -> Result<Vec<Statement>, SnippetError> {
    Parser {
        tokens: tokenize(source)?,
        pos: 0,
    }
    .program()
}

/// Variables persist from one snippet to the next.
#[derive(Debug, Default)]
pub struct Interpreter {
    vars: BTreeMap<String, Datum>,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn var(&self, name: &str) -> Option<&Datum> {
        self.vars.get(name)
    }

    /// Runs `source` and renders its value.
    pub fn run(&mut self, source: &str, host: &mut dyn Host) -> Result<String, SnippetError> {
        let statements = parse(source)?;
        let mut value = None;
        for statement in &statements {
            host.safepoint()?;
            value = self.execute(statement, host)?;
        }
        Ok(value.map(|v| v.to_string()).unwrap_or_default())
    }

    fn execute(
        &mut self,
        statement: &Statement,
        host: &mut dyn Host,
    ) -> Result<Option<Datum>, SnippetError> {
        match statement {
            Statement::Var(name, expr) => {
                let value = self.eval(expr)?;
                self.vars.insert(name.clone(), value.clone());
                Ok(Some(value))
            }
            Statement::Print(stream, expr) => {
                let mut text = self.eval(expr)?.plain();
                text.push('\n');
                host.write(stream, &text).map_err(SnippetError::Run)?;
                Ok(None)
            }
            Statement::Read(name) => {
                let line = host.read_line().map_err(SnippetError::Run)?;
                self.vars
                    .insert(name.clone(), Datum::Text(line.unwrap_or_default()));
                Ok(None)
            }
            Statement::Sleep(expr) => match self.eval(expr)? {
                Datum::Int(millis) if millis >= 0 => {
                    host.sleep(Duration::from_millis(millis as u64))?;
                    Ok(None)
                }
                other => Err(SnippetError::Run(format!("cannot sleep for {other}"))),
            },
            Statement::Spin => loop {
                host.safepoint()?;
                std::thread::yield_now();
            },
            Statement::Expr(expr) => Ok(Some(self.eval(expr)?)),
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Datum, SnippetError> {
        match expr {
            Expr::Int(i) => Ok(Datum::Int(*i)),
            Expr::Text(s) => Ok(Datum::Text(s.clone())),
            Expr::Var(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| SnippetError::Run(format!("unknown variable {name}"))),
            Expr::Neg(inner) => match self.eval(inner)? {
                Datum::Int(i) => i
                    .checked_neg()
                    .map(Datum::Int)
                    .ok_or_else(|| SnippetError::Run("integer overflow".to_owned())),
                other => Err(SnippetError::Run(format!("cannot negate {other}"))),
            },
            Expr::Binary(op, lhs, rhs) => binary(*op, self.eval(lhs)?, self.eval(rhs)?),
        }
    }
}

fn binary(op: char, lhs: Datum, rhs: Datum) -> Result<Datum, SnippetError> {
    let (a, b) = match (op, lhs, rhs) {
        ('+', Datum::Int(a), Datum::Int(b)) => (a, b),
        ('+', lhs, rhs) => return Ok(Datum::Text(lhs.plain() + &rhs.plain())),
        (_, Datum::Int(a), Datum::Int(b)) => (a, b),
        (op, lhs, rhs) => {
            return Err(SnippetError::Run(format!("cannot apply `{op}` to {lhs} and {rhs}")))
        }
    };
    let result = match op {
        '+' => a.checked_add(b),
        '-' => a.checked_sub(b),
        '*' => a.checked_mul(b),
        _ if b == 0 => return Err(SnippetError::Run("division by zero".to_owned())),
        _ => a.checked_div(b),
    };
    result
        .map(Datum::Int)
        .ok_or_else(|| SnippetError::Run("integer overflow".to_owned()))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::control::ObjectId;

    #[derive(Default)]
    struct TestHost {
        out: String,
        err: String,
        input: Vec<String>,
        slept: Duration,
        /// Unwind delivered at the given safepoint.
        unwind_at: Option<(usize, Unwind)>,
        safepoints: usize,
    }

    impl Host for TestHost {
        fn safepoint(&mut self) -> Result<(), Unwind> {
            self.safepoints += 1;
            match &self.unwind_at {
                Some((at, unwind)) if *at == self.safepoints => Err(unwind.clone()),
                _ => Ok(()),
            }
        }

        fn sleep(&mut self, duration: Duration) -> Result<(), Unwind> {
            self.slept += duration;
            Ok(())
        }

        fn write(&mut self, stream: &str, text: &str) -> Result<(), String> {
            match stream {
                OUT => self.out.push_str(text),
                _ => self.err.push_str(text),
            }
            Ok(())
        }

        fn read_line(&mut self) -> Result<Option<String>, String> {
            Ok((!self.input.is_empty()).then(|| self.input.remove(0)))
        }
    }

    fn run(source: &str) -> Result<String, SnippetError> {
        Interpreter::new().run(source, &mut TestHost::default())
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("3 + 15").unwrap(), "18");
        assert_eq!(run("2 * (3 + 4) - -1").unwrap(), "15");
        assert_eq!(run("7 / 2").unwrap(), "3");
        assert_eq!(run("\"a\" + 1 + 2").unwrap(), "\"a12\"");
        assert_eq!(run("").unwrap(), "");
    }

    #[test]
    fn test_errors() {
        assert_matches!(run("1 / 0"), Err(SnippetError::Run(message)) if message == "division by zero");
        assert_matches!(run("x + 1"), Err(SnippetError::Run(message)) if message == "unknown variable x");
        assert_matches!(run("3 +"), Err(SnippetError::Syntax(_)));
        assert_matches!(run("(1"), Err(SnippetError::Syntax(_)));
        assert_matches!(run("1 2"), Err(SnippetError::Syntax(_)));
        assert_matches!(run("\"open"), Err(SnippetError::Syntax(_)));
        assert_matches!(run("\"a\" * 2"), Err(SnippetError::Run(_)));
        assert_matches!(run("9223372036854775807 + 1"), Err(SnippetError::Run(_)));
    }

    #[test]
    fn test_statements_and_variables() {
        let mut interpreter = Interpreter::new();
        let mut host = TestHost {
            input: vec!["typed".to_owned()],
            ..Default::default()
        };
        assert_eq!(
            interpreter
                .run("var x = 20; print x + 1; eprint \"oops\"", &mut host)
                .unwrap(),
            ""
        );
        assert_eq!(host.out, "21\n");
        assert_eq!(host.err, "oops\n");
        assert_eq!(interpreter.run("x * 2", &mut host).unwrap(), "40");
        assert_eq!(interpreter.var("x"), Some(&Datum::Int(20)));

        interpreter.run("read line; sleep 15", &mut host).unwrap();
        assert_eq!(interpreter.var("line"), Some(&Datum::Text("typed".to_owned())));
        assert_eq!(host.slept, Duration::from_millis(15));
    }

    #[test]
    fn test_spin_until_unwound() {
        let exception = Unwind::Exception(ObjectId(3));
        let mut host = TestHost {
            unwind_at: Some((100, exception.clone())),
            ..Default::default()
        };
        assert_eq!(
            Interpreter::new().run("spin", &mut host),
            Err(SnippetError::Interrupted(exception))
        );
    }
}
