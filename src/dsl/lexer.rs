//! Tokenizer for the definition language.
//!
//! Lexing never stops at the first bad character: problems are recorded as
//! syntax violations and scanning resumes, so the caller gets every issue
//! in one pass.

use crate::error::{Violation, ViolationKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    Const(String),
    Global(String),
    Symbol(String),
    Int(i64),
    Float(f64),
    Str(String),
    Shell(String),

    Let,
    If,
    Else,
    For,
    In,
    While,
    Return,
    True,
    False,
    Nil,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Dot,
    Semi,
    Newline,

    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,

    Eof,
}

impl Tok {
    /// Short rendering used in "unexpected token" messages.
    pub fn describe(&self) -> String {
        match self {
            Tok::Ident(name) | Tok::Const(name) => format!("`{name}`"),
            Tok::Global(name) => format!("`${name}`"),
            Tok::Symbol(name) => format!("`:{name}`"),
            Tok::Int(n) => format!("`{n}`"),
            Tok::Float(n) => format!("`{n}`"),
            Tok::Str(_) => "string literal".to_string(),
            Tok::Shell(_) => "backtick literal".to_string(),
            Tok::Newline => "end of line".to_string(),
            Tok::Eof => "end of input".to_string(),
            other => format!("`{}`", other.punct()),
        }
    }

    fn punct(&self) -> &'static str {
        match self {
            Tok::Let => "let",
            Tok::If => "if",
            Tok::Else => "else",
            Tok::For => "for",
            Tok::In => "in",
            Tok::While => "while",
            Tok::Return => "return",
            Tok::True => "true",
            Tok::False => "false",
            Tok::Nil => "nil",
            Tok::LParen => "(",
            Tok::RParen => ")",
            Tok::LBrace => "{",
            Tok::RBrace => "}",
            Tok::LBracket => "[",
            Tok::RBracket => "]",
            Tok::Comma => ",",
            Tok::Colon => ":",
            Tok::Dot => ".",
            Tok::Semi => ";",
            Tok::Assign => "=",
            Tok::Plus => "+",
            Tok::Minus => "-",
            Tok::Star => "*",
            Tok::Slash => "/",
            Tok::Percent => "%",
            Tok::Bang => "!",
            Tok::EqEq => "==",
            Tok::NotEq => "!=",
            Tok::Lt => "<",
            Tok::Le => "<=",
            Tok::Gt => ">",
            Tok::Ge => ">=",
            Tok::AndAnd => "&&",
            Tok::OrOr => "||",
            _ => "?",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

pub fn tokenize(source: &str) -> (Vec<Token>, Vec<Violation>) {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    tokens: Vec<Token>,
    violations: Vec<Violation>,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            tokens: Vec::new(),
            violations: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn prev(&self) -> Option<char> {
        if self.pos == 0 {
            None
        } else {
            self.chars.get(self.pos - 1).copied()
        }
    }

    fn push(&mut self, tok: Tok, line: usize) {
        self.tokens.push(Token { tok, line });
    }

    fn error(&mut self, line: usize, message: impl Into<String>) {
        self.violations
            .push(Violation::new(ViolationKind::Syntax, line, message));
    }

    fn run(mut self) -> (Vec<Token>, Vec<Violation>) {
        while let Some(c) = self.peek() {
            let line = self.line;
            match c {
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    self.push(Tok::Newline, line);
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '"' => self.string('"', true),
                '\'' => self.string('\'', false),
                '`' => self.shell(),
                '$' => {
                    self.pos += 1;
                    let name = self.take_while(is_ident_char);
                    if name.is_empty() {
                        self.error(line, "expected a name after `$`");
                    } else {
                        self.push(Tok::Global(name), line);
                    }
                }
                ':' if self.starts_symbol() => {
                    self.pos += 1;
                    let name = self.take_while(is_ident_char);
                    self.push(Tok::Symbol(name), line);
                }
                c if c.is_ascii_digit() => self.number(),
                c if is_ident_start(c) => {
                    let word = self.take_while(is_ident_char);
                    let tok = keyword(&word).unwrap_or_else(|| {
                        if word.starts_with(|c: char| c.is_ascii_uppercase()) {
                            Tok::Const(word)
                        } else {
                            Tok::Ident(word)
                        }
                    });
                    self.push(tok, line);
                }
                _ => self.punct(c, line),
            }
        }
        let line = self.line;
        self.push(Tok::Eof, line);
        (self.tokens, self.violations)
    }

    /// `:name` is a symbol when the colon is not glued to a preceding
    /// identifier or value (which would make it a map key separator).
    fn starts_symbol(&self) -> bool {
        let next_is_name = self.peek_at(1).is_some_and(is_ident_start);
        let prev_allows = match self.prev() {
            None => true,
            Some(p) => p.is_whitespace() || "([{,=!".contains(p),
        };
        next_is_name && prev_allows
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(&pred) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn number(&mut self) {
        let line = self.line;
        let mut text = self.take_while(|c| c.is_ascii_digit() || c == '_');
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            text.push('.');
            text.push_str(&self.take_while(|c| c.is_ascii_digit() || c == '_'));
            is_float = true;
        }
        let clean: String = text.chars().filter(|c| *c != '_').collect();
        if is_float {
            match clean.parse::<f64>() {
                Ok(n) => self.push(Tok::Float(n), line),
                Err(_) => self.error(line, format!("invalid number `{text}`")),
            }
        } else {
            match clean.parse::<i64>() {
                Ok(n) => self.push(Tok::Int(n), line),
                Err(_) => self.error(line, format!("integer literal `{text}` is out of range")),
            }
        }
    }

    fn string(&mut self, quote: char, escapes: bool) {
        let line = self.line;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                self.error(line, "unterminated string literal");
                return;
            };
            self.pos += 1;
            match c {
                c if c == quote => break,
                '\n' => {
                    self.line += 1;
                    out.push('\n');
                }
                '\\' => {
                    let Some(next) = self.peek() else { continue };
                    self.pos += 1;
                    match (escapes, next) {
                        (true, 'n') => out.push('\n'),
                        (true, 't') => out.push('\t'),
                        (true, 'r') => out.push('\r'),
                        (true, '0') => out.push('\0'),
                        (_, '\\') => out.push('\\'),
                        (_, q) if q == quote => out.push(q),
                        (true, other) => {
                            self.error(self.line, format!("unknown escape `\\{other}`"));
                        }
                        (false, other) => {
                            out.push('\\');
                            out.push(other);
                        }
                    }
                }
                other => out.push(other),
            }
        }
        self.push(Tok::Str(out), line);
    }

    fn shell(&mut self) {
        let line = self.line;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                self.error(line, "unterminated backtick literal");
                return;
            };
            self.pos += 1;
            if c == '`' {
                break;
            }
            if c == '\n' {
                self.line += 1;
            }
            out.push(c);
        }
        self.push(Tok::Shell(out), line);
    }

    fn punct(&mut self, c: char, line: usize) {
        let next = self.peek_at(1);
        let (tok, width) = match (c, next) {
            ('=', Some('=')) => (Tok::EqEq, 2),
            ('!', Some('=')) => (Tok::NotEq, 2),
            ('<', Some('=')) => (Tok::Le, 2),
            ('>', Some('=')) => (Tok::Ge, 2),
            ('&', Some('&')) => (Tok::AndAnd, 2),
            ('|', Some('|')) => (Tok::OrOr, 2),
            ('(', _) => (Tok::LParen, 1),
            (')', _) => (Tok::RParen, 1),
            ('{', _) => (Tok::LBrace, 1),
            ('}', _) => (Tok::RBrace, 1),
            ('[', _) => (Tok::LBracket, 1),
            (']', _) => (Tok::RBracket, 1),
            (',', _) => (Tok::Comma, 1),
            (':', _) => (Tok::Colon, 1),
            ('.', _) => (Tok::Dot, 1),
            (';', _) => (Tok::Semi, 1),
            ('=', _) => (Tok::Assign, 1),
            ('+', _) => (Tok::Plus, 1),
            ('-', _) => (Tok::Minus, 1),
            ('*', _) => (Tok::Star, 1),
            ('/', _) => (Tok::Slash, 1),
            ('%', _) => (Tok::Percent, 1),
            ('!', _) => (Tok::Bang, 1),
            ('<', _) => (Tok::Lt, 1),
            ('>', _) => (Tok::Gt, 1),
            _ => {
                self.pos += 1;
                self.error(line, format!("unexpected character `{c}`"));
                return;
            }
        };
        self.pos += width;
        self.push(tok, line);
    }
}

fn keyword(word: &str) -> Option<Tok> {
    let tok = match word {
        "let" => Tok::Let,
        "if" => Tok::If,
        "else" => Tok::Else,
        "for" => Tok::For,
        "in" => Tok::In,
        "while" => Tok::While,
        "return" => Tok::Return,
        "true" => Tok::True,
        "false" => Tok::False,
        "nil" => Tok::Nil,
        _ => return None,
    };
    Some(tok)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        let (tokens, violations) = tokenize(source);
        assert!(violations.is_empty(), "unexpected violations: {violations:?}");
        tokens.into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_identifiers_constants_and_keywords() {
        assert_eq!(
            toks("let x = File"),
            vec![
                Tok::Let,
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Const("File".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_symbol_versus_map_colon() {
        assert_eq!(
            toks("f(:add)"),
            vec![
                Tok::Ident("f".into()),
                Tok::LParen,
                Tok::Symbol("add".into()),
                Tok::RParen,
                Tok::Eof
            ]
        );
        assert_eq!(
            toks("{a:b}"),
            vec![
                Tok::LBrace,
                Tok::Ident("a".into()),
                Tok::Colon,
                Tok::Ident("b".into()),
                Tok::RBrace,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            toks("1_000 2.5 3"),
            vec![Tok::Int(1000), Tok::Float(2.5), Tok::Int(3), Tok::Eof]
        );
    }

    #[test]
    fn test_string_escapes_and_raw_strings() {
        assert_eq!(
            toks(r#""a\n\"b\"" 'c\d'"#),
            vec![
                Tok::Str("a\n\"b\"".into()),
                Tok::Str("c\\d".into()),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn test_shell_and_global_tokens() {
        assert_eq!(
            toks("`ls` $stdout"),
            vec![Tok::Shell("ls".into()), Tok::Global("stdout".into()), Tok::Eof]
        );
    }

    #[test]
    fn test_comments_and_line_numbers() {
        let (tokens, _) = tokenize("# header\nx # trailing\ny");
        let idents: Vec<(String, usize)> = tokens
            .iter()
            .filter_map(|t| match &t.tok {
                Tok::Ident(n) => Some((n.clone(), t.line)),
                _ => None,
            })
            .collect();
        assert_eq!(idents, vec![("x".into(), 2), ("y".into(), 3)]);
    }

    #[test]
    fn test_errors_do_not_stop_scanning() {
        let (tokens, violations) = tokenize("a @ b ^ c");
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| v.kind == ViolationKind::Syntax));
        let idents = tokens
            .iter()
            .filter(|t| matches!(t.tok, Tok::Ident(_)))
            .count();
        assert_eq!(idents, 3);
    }

    #[test]
    fn test_unterminated_string_reports_start_line() {
        let (_, violations) = tokenize("x\n\"open\nstill open");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 2);
    }
}
