use crate::error::EmuError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// `#1/1/2020#` style date literal, kept as its raw text.
    Date(String),
    /// `#1` style file-number token, kept with the leading `#`.
    FileNum(String),

    // Operators / punctuation
    LParen,
    RParen,
    Comma,
    Dot,
    Bang,
    Colon,
    ColonEq,
    Semicolon,
    Eq,
    Plus,
    Minus,
    Star,
    Slash,
    Backslash,
    Caret,
    Amp,
    Lt,
    Gt,
    Le,
    Ge,
    Ne,

    Newline,
    Eof,

    // Keywords (case-insensitive, stored lowercased)
    Keyword(String),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub col: usize,
}

fn is_keyword(lower: &str) -> bool {
    matches!(
        lower,
        "sub"
            | "function"
            | "property"
            | "end"
            | "if"
            | "then"
            | "else"
            | "elseif"
            | "select"
            | "case"
            | "is"
            | "for"
            | "each"
            | "in"
            | "to"
            | "step"
            | "next"
            | "dim"
            | "redim"
            | "preserve"
            | "const"
            | "global"
            | "as"
            | "byval"
            | "byref"
            | "optional"
            | "paramarray"
            | "set"
            | "let"
            | "lset"
            | "with"
            | "on"
            | "error"
            | "resume"
            | "goto"
            | "gosub"
            | "exit"
            | "do"
            | "while"
            | "loop"
            | "until"
            | "wend"
            | "call"
            | "true"
            | "false"
            | "nothing"
            | "null"
            | "empty"
            | "and"
            | "or"
            | "xor"
            | "eqv"
            | "not"
            | "mod"
            | "like"
            | "new"
            | "rem"
            | "private"
            | "public"
            | "static"
            | "friend"
            | "option"
            | "explicit"
            | "declare"
            | "lib"
            | "alias"
            | "ptrsafe"
            | "open"
            | "close"
            | "print"
            | "write"
            | "input"
            | "output"
            | "append"
            | "binary"
            | "random"
            | "access"
            | "doevents"
            | "stop"
            | "attribute"
            | "type"
            | "enum"
    )
}

/// Joins `_` line continuations so the parser only ever sees logical lines.
pub fn join_continuations(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut lines = src.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_end();
        if trimmed.ends_with(" _") || trimmed == "_" {
            out.push_str(trimmed[..trimmed.len() - 1].trim_end());
            out.push(' ');
            // Swallow the newline; the next physical line continues this one.
            continue;
        }
        out.push_str(line);
        if lines.peek().is_some() {
            out.push('\n');
        }
    }
    out
}

pub struct Lexer<'a> {
    chars: std::str::Chars<'a>,
    peeked: Option<char>,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars(),
            peeked: None,
            line: 1,
            col: 0,
        }
    }

    /// Tokenizes the whole input. Continuations must already be joined.
    pub fn tokenize(src: &'a str) -> Result<Vec<Token>, EmuError> {
        let mut lexer = Lexer::new(src);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let done = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = if let Some(ch) = self.peeked.take() {
            Some(ch)
        } else {
            self.chars.next()
        };
        if let Some(ch) = ch {
            if ch == '\n' {
                self.line += 1;
                self.col = 0;
            } else {
                self.col += 1;
            }
        }
        ch
    }

    fn peek(&mut self) -> Option<char> {
        if self.peeked.is_none() {
            self.peeked = self.chars.next();
        }
        self.peeked
    }

    fn is_ident_start(ch: char) -> bool {
        ch.is_ascii_alphabetic() || ch == '_'
    }

    fn is_ident_continue(ch: char) -> bool {
        ch.is_ascii_alphanumeric() || ch == '_'
    }

    fn token(&self, kind: TokenKind, line: usize, col: usize) -> Token {
        Token { kind, line, col }
    }

    /// Consumes an optional integer type suffix (`%`, `&`, `^`) after a number.
    /// `&` is only a suffix when not introducing another literal.
    fn skip_int_suffix(&mut self) {
        if let Some(ch) = self.peek() {
            if ch == '%' || ch == '^' {
                self.bump();
            }
        }
    }

    fn lex_number(&mut self, first: char, line: usize, col: usize) -> Result<Token, EmuError> {
        let mut buf = String::new();
        buf.push(first);
        let mut is_float = false;
        while let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                buf.push(self.bump().unwrap_or_default());
            } else if ch == '.' && !is_float {
                is_float = true;
                buf.push(self.bump().unwrap_or_default());
            } else if ch == 'e' || ch == 'E' {
                // Exponent form, only when followed by a digit or sign+digit.
                let mut ahead = self.chars.clone();
                let after = match ahead.next() {
                    Some('+') | Some('-') => ahead.next(),
                    other => other,
                };
                if !matches!(after, Some(d) if d.is_ascii_digit()) {
                    break;
                }
                is_float = true;
                buf.push(self.bump().unwrap_or_default());
                if matches!(self.peek(), Some('+') | Some('-')) {
                    buf.push(self.bump().unwrap_or_default());
                }
                while let Some(d) = self.peek() {
                    if d.is_ascii_digit() {
                        buf.push(self.bump().unwrap_or_default());
                    } else {
                        break;
                    }
                }
                break;
            } else {
                break;
            }
        }
        // Float type suffixes are consumed and ignored.
        if let Some(ch) = self.peek() {
            if ch == '!' || ch == '#' || ch == '@' {
                self.bump();
                is_float = true;
            }
        }
        self.skip_int_suffix();
        if is_float {
            let value = buf.parse::<f64>().map_err(|_| {
                EmuError::Parse(format!("invalid number literal `{buf}` at {line}:{col}"))
            })?;
            Ok(self.token(TokenKind::Float(value), line, col))
        } else {
            let value = buf.parse::<i64>().map_err(|_| {
                EmuError::Parse(format!("invalid number literal `{buf}` at {line}:{col}"))
            })?;
            Ok(self.token(TokenKind::Int(value), line, col))
        }
    }

    /// `&H2A`, `&o52` and the bare-`&52` octal form.
    fn lex_radix_number(&mut self, line: usize, col: usize) -> Result<Token, EmuError> {
        let radix;
        match self.peek() {
            Some('h') | Some('H') => {
                self.bump();
                radix = 16;
            }
            Some('o') | Some('O') => {
                self.bump();
                radix = 8;
            }
            Some(ch) if ch.is_digit(8) => {
                radix = 8;
            }
            _ => {
                // Not a literal after all; this is the concatenation operator.
                return Ok(self.token(TokenKind::Amp, line, col));
            }
        }
        let mut buf = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_digit(radix) {
                buf.push(self.bump().unwrap_or_default());
            } else {
                break;
            }
        }
        if buf.is_empty() {
            return Err(EmuError::Parse(format!(
                "empty radix literal at {line}:{col}"
            )));
        }
        self.skip_int_suffix();
        if self.peek() == Some('&') {
            self.bump();
        }
        let value = i64::from_str_radix(&buf, radix).map_err(|_| {
            EmuError::Parse(format!("invalid radix literal `&{buf}` at {line}:{col}"))
        })?;
        Ok(self.token(TokenKind::Int(value), line, col))
    }

    fn lex_identifier(&mut self, first: char, line: usize, col: usize) -> Token {
        let mut buf = String::new();
        buf.push(first);
        while let Some(ch) = self.peek() {
            if Self::is_ident_continue(ch) {
                buf.push(self.bump().unwrap_or_default());
            } else {
                break;
            }
        }
        // Legacy type-declaration characters. Only `$` is kept as part of the
        // name (string functions like `Mid$` resolve through it); the numeric
        // suffixes are dropped.
        if let Some(ch) = self.peek() {
            if ch == '$' {
                self.bump();
                buf.push('$');
            } else if ch == '%' || ch == '!' || ch == '@' {
                self.bump();
            }
        }

        let lower = buf.to_ascii_lowercase();
        if is_keyword(&lower) {
            self.token(TokenKind::Keyword(lower), line, col)
        } else {
            self.token(TokenKind::Identifier(buf), line, col)
        }
    }

    fn lex_string(&mut self, line: usize, col: usize) -> Result<Token, EmuError> {
        let mut buf = String::new();
        loop {
            match self.bump() {
                Some('"') => {
                    // doubled quote is an escape
                    if self.peek() == Some('"') {
                        self.bump();
                        buf.push('"');
                        continue;
                    }
                    break;
                }
                Some(ch) => buf.push(ch),
                None => {
                    return Err(EmuError::Parse(format!(
                        "unterminated string literal at {line}:{col}"
                    )))
                }
            }
        }
        Ok(self.token(TokenKind::Str(buf), line, col))
    }

    /// `#...` is a file number when immediately numeric (`#1`), otherwise a
    /// date literal terminated by the closing `#`.
    fn lex_hash(&mut self, line: usize, col: usize) -> Result<Token, EmuError> {
        if let Some(ch) = self.peek() {
            if ch.is_ascii_digit() {
                let mut buf = String::from("#");
                while let Some(d) = self.peek() {
                    if d.is_ascii_digit() {
                        buf.push(self.bump().unwrap_or_default());
                    } else {
                        break;
                    }
                }
                // A `/` after the digits means this was a date after all.
                if self.peek() != Some('/') {
                    return Ok(self.token(TokenKind::FileNum(buf), line, col));
                }
                let mut date = buf[1..].to_string();
                loop {
                    match self.bump() {
                        Some('#') => break,
                        Some('\n') | None => {
                            return Err(EmuError::Parse(format!(
                                "unterminated date literal at {line}:{col}"
                            )))
                        }
                        Some(c) => date.push(c),
                    }
                }
                return Ok(self.token(TokenKind::Date(date), line, col));
            }
        }
        let mut date = String::new();
        loop {
            match self.bump() {
                Some('#') => break,
                Some('\n') | None => {
                    return Err(EmuError::Parse(format!(
                        "unterminated date literal at {line}:{col}"
                    )))
                }
                Some(c) => date.push(c),
            }
        }
        Ok(self.token(TokenKind::Date(date), line, col))
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.bump();
            } else {
                break;
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(ch) = self.peek() {
            if ch == '\n' {
                break;
            }
            self.bump();
        }
    }

    pub fn next_token(&mut self) -> Result<Token, EmuError> {
        self.skip_whitespace();
        let line = self.line;
        let col = self.col + 1;
        match self.bump() {
            Some('\n') => Ok(self.token(TokenKind::Newline, line, col)),
            Some('\'') => {
                self.skip_comment();
                self.next_token()
            }
            Some('"') => self.lex_string(line, col),
            Some('#') => self.lex_hash(line, col),
            Some('&') => self.lex_radix_number(line, col),
            Some(ch) if ch.is_ascii_digit() => self.lex_number(ch, line, col),
            Some(ch) if Self::is_ident_start(ch) => {
                // `Rem` comments swallow the rest of the line.
                let tok = self.lex_identifier(ch, line, col);
                if matches!(tok.kind, TokenKind::Keyword(ref k) if k == "rem") {
                    self.skip_comment();
                    return self.next_token();
                }
                Ok(tok)
            }
            Some('(') => Ok(self.token(TokenKind::LParen, line, col)),
            Some(')') => Ok(self.token(TokenKind::RParen, line, col)),
            Some(',') => Ok(self.token(TokenKind::Comma, line, col)),
            Some('.') => Ok(self.token(TokenKind::Dot, line, col)),
            Some('!') => Ok(self.token(TokenKind::Bang, line, col)),
            Some(':') => {
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(self.token(TokenKind::ColonEq, line, col))
                } else {
                    Ok(self.token(TokenKind::Colon, line, col))
                }
            }
            Some(';') => Ok(self.token(TokenKind::Semicolon, line, col)),
            Some('=') => Ok(self.token(TokenKind::Eq, line, col)),
            Some('+') => Ok(self.token(TokenKind::Plus, line, col)),
            Some('-') => Ok(self.token(TokenKind::Minus, line, col)),
            Some('*') => Ok(self.token(TokenKind::Star, line, col)),
            Some('/') => Ok(self.token(TokenKind::Slash, line, col)),
            Some('\\') => Ok(self.token(TokenKind::Backslash, line, col)),
            Some('^') => Ok(self.token(TokenKind::Caret, line, col)),
            Some('<') => {
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(self.token(TokenKind::Le, line, col))
                } else if self.peek() == Some('>') {
                    self.bump();
                    Ok(self.token(TokenKind::Ne, line, col))
                } else {
                    Ok(self.token(TokenKind::Lt, line, col))
                }
            }
            Some('>') => {
                if self.peek() == Some('=') {
                    self.bump();
                    Ok(self.token(TokenKind::Ge, line, col))
                } else {
                    Ok(self.token(TokenKind::Gt, line, col))
                }
            }
            Some('$') | Some('%') | Some('@') => {
                // Stray type-declaration characters are whitespace to us.
                self.next_token()
            }
            Some('[') => {
                // Bracketed names (`[A1]`, `[Sheet1]`) lex as identifiers.
                let mut buf = String::new();
                loop {
                    match self.bump() {
                        Some(']') | None => break,
                        Some('\n') => break,
                        Some(c) => buf.push(c),
                    }
                }
                Ok(self.token(TokenKind::Identifier(buf), line, col))
            }
            None => Ok(self.token(TokenKind::Eof, line, col)),
            Some(other) => Err(EmuError::Parse(format!(
                "unexpected character `{other}` at {line}:{col}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        Lexer::tokenize(src)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn radix_literals() {
        assert_eq!(kinds("&H2A"), vec![TokenKind::Int(42), TokenKind::Eof]);
        assert_eq!(kinds("&o52"), vec![TokenKind::Int(42), TokenKind::Eof]);
        assert_eq!(kinds("&52"), vec![TokenKind::Int(42), TokenKind::Eof]);
        assert_eq!(kinds("&HFF&"), vec![TokenKind::Int(255), TokenKind::Eof]);
    }

    #[test]
    fn amp_is_concat_when_not_a_literal() {
        assert_eq!(
            kinds("a & b"),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Amp,
                TokenKind::Identifier("b".into()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn doubled_quotes_escape() {
        assert_eq!(
            kinds("\"he said \"\"hi\"\"\""),
            vec![TokenKind::Str("he said \"hi\"".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn file_number_vs_date() {
        assert_eq!(
            kinds("#1"),
            vec![TokenKind::FileNum("#1".into()), TokenKind::Eof]
        );
        assert_eq!(
            kinds("#1/2/2020#"),
            vec![TokenKind::Date("1/2/2020".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn continuations_join() {
        let joined = join_continuations("a = 1 + _\n    2\nb = 3");
        assert_eq!(joined, "a = 1 + 2\nb = 3");
    }

    #[test]
    fn type_suffixes_dropped() {
        assert_eq!(kinds("42%"), vec![TokenKind::Int(42), TokenKind::Eof]);
        assert_eq!(kinds("1.5!"), vec![TokenKind::Float(1.5), TokenKind::Eof]);
        assert_eq!(
            kinds("Mid$"),
            vec![TokenKind::Identifier("Mid$".into()), TokenKind::Eof]
        );
    }
}
