//! Tokenizer
//!
//! UTF-8-aware, single pass. Produces either a stream (`next`/`undo`) or a
//! flat record array with `(type, offset, length, line)` fields per token
//! for user-mode processing by `use` preprocessors.
//!
//! Recognised forms: identifiers, function references (`ident#digits`),
//! decimal and hexadecimal integers, float literals with optional exponent,
//! character literals (1-4 packed codepoints when all fit a byte, a single
//! codepoint otherwise), strings with escape sequences, and symbols up to
//! four characters (`>>>=` is the longest). Invalid UTF-8 and surrogate
//! codepoints become U+FFFD inside strings; elsewhere bad input errors out
//! unless `ignore_errors` is set, which yields `TOK_UNKNOWN` tokens.

use crate::error::CompileError;

pub const TOK_IDENT: i32 = 0;
pub const TOK_FUNC_REF: i32 = 1;
pub const TOK_NUMBER: i32 = 2;
pub const TOK_HEX_NUMBER: i32 = 3;
pub const TOK_FLOAT_NUMBER: i32 = 4;
pub const TOK_CHAR: i32 = 5;
pub const TOK_STRING: i32 = 6;
pub const TOK_SYMBOL: i32 = 7;
pub const TOK_KEYWORD: i32 = 8;
pub const TOK_UNKNOWN: i32 = 9;

pub const KEYWORDS: &[&str] = &[
    "use", "import", "const", "var", "function", "if", "else", "while", "do", "for", "switch",
    "case", "default", "break", "continue", "return", "null",
];

/// One lexed token. `off`/`len` are byte offsets into the source; decoded
/// literal payloads are carried alongside so the parser never re-scans.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub ty: i32,
    pub off: usize,
    pub len: usize,
    pub line: u32,
    pub value: TokenValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Int(i32),
    Float(f32),
    Str(String),
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        src.get(self.off..self.off + self.len).unwrap_or("")
    }
}

pub struct Tokenizer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    line: u32,
    ignore_errors: bool,
    undo: Option<Token>,
}

impl<'a> Tokenizer<'a> {
    pub fn new(src: &'a str, first_line: u32, ignore_errors: bool) -> Tokenizer<'a> {
        Tokenizer {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            line: first_line,
            ignore_errors,
            undo: None,
        }
    }

    /// Push one token back; the next `next` returns it again.
    pub fn undo(&mut self, token: Token) {
        debug_assert!(self.undo.is_none());
        self.undo = Some(token);
    }

    /// Lex every remaining token.
    pub fn tokenize_all(mut self) -> Result<Vec<Token>, CompileError> {
        let mut out = Vec::new();
        while let Some(t) = self.next()? {
            out.push(t);
        }
        Ok(out)
    }

    pub fn next(&mut self) -> Result<Option<Token>, CompileError> {
        if let Some(t) = self.undo.take() {
            return Ok(Some(t));
        }
        self.skip_whitespace_and_comments();
        if self.pos >= self.bytes.len() {
            return Ok(None);
        }
        let start = self.pos;
        let line = self.line;
        let c = self.bytes[self.pos];
        let token = if c.is_ascii_alphabetic() || c == b'_' {
            self.lex_ident(start, line)
        } else if c.is_ascii_digit() {
            self.lex_number(start, line)?
        } else if c == b'"' {
            self.lex_string(start, line)?
        } else if c == b'\'' {
            self.lex_char(start, line)?
        } else {
            self.lex_symbol(start, line)?
        };
        Ok(Some(token))
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.pos < self.bytes.len() {
                match self.bytes[self.pos] {
                    b'\n' => {
                        self.line += 1;
                        self.pos += 1;
                    }
                    b' ' | b'\t' | b'\r' => self.pos += 1,
                    _ => break,
                }
            }
            if self.pos + 1 < self.bytes.len() && self.bytes[self.pos] == b'/' {
                match self.bytes[self.pos + 1] {
                    b'/' => {
                        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                            self.pos += 1;
                        }
                        continue;
                    }
                    b'*' => {
                        self.pos += 2;
                        while self.pos + 1 < self.bytes.len()
                            && !(self.bytes[self.pos] == b'*' && self.bytes[self.pos + 1] == b'/')
                        {
                            if self.bytes[self.pos] == b'\n' {
                                self.line += 1;
                            }
                            self.pos += 1;
                        }
                        self.pos = (self.pos + 2).min(self.bytes.len());
                        continue;
                    }
                    _ => {}
                }
            }
            break;
        }
    }

    fn lex_ident(&mut self, start: usize, line: u32) -> Token {
        while self.pos < self.bytes.len()
            && (self.bytes[self.pos].is_ascii_alphanumeric() || self.bytes[self.pos] == b'_')
        {
            self.pos += 1;
        }
        // ident#digits forms a function reference token
        if self.pos < self.bytes.len()
            && self.bytes[self.pos] == b'#'
            && self
                .bytes
                .get(self.pos + 1)
                .is_some_and(|b| b.is_ascii_digit())
        {
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
            return Token {
                ty: TOK_FUNC_REF,
                off: start,
                len: self.pos - start,
                line,
                value: TokenValue::None,
            };
        }
        let text = &self.src[start..self.pos];
        let ty = if KEYWORDS.contains(&text) {
            TOK_KEYWORD
        } else {
            TOK_IDENT
        };
        Token {
            ty,
            off: start,
            len: self.pos - start,
            line,
            value: TokenValue::None,
        }
    }

    fn lex_number(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        if self.bytes[self.pos] == b'0'
            && self
                .bytes
                .get(self.pos + 1)
                .is_some_and(|&b| b == b'x' || b == b'X')
        {
            self.pos += 2;
            let digits_start = self.pos;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_hexdigit() {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return self.bad_token(start, line, "invalid hexadecimal constant");
            }
            let text = &self.src[digits_start..self.pos];
            let v = u32::from_str_radix(text, 16)
                .map_err(|_| self.err(line, "hexadecimal constant too large"))?;
            return Ok(Token {
                ty: TOK_HEX_NUMBER,
                off: start,
                len: self.pos - start,
                line,
                value: TokenValue::Int(v as i32),
            });
        }
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        let mut is_float = false;
        if self.pos + 1 < self.bytes.len()
            && self.bytes[self.pos] == b'.'
            && self.bytes[self.pos + 1].is_ascii_digit()
        {
            is_float = true;
            self.pos += 1;
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                self.pos += 1;
            }
        }
        if self.pos < self.bytes.len() && (self.bytes[self.pos] | 32) == b'e' {
            let mut p = self.pos + 1;
            if self.bytes.get(p).is_some_and(|&b| b == b'+' || b == b'-') {
                p += 1;
            }
            if self.bytes.get(p).is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                self.pos = p;
                while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
                    self.pos += 1;
                }
            }
        }
        let text = &self.src[start..self.pos];
        if is_float {
            let v: f32 = text
                .parse()
                .map_err(|_| self.err(line, "invalid float constant"))?;
            Ok(Token {
                ty: TOK_FLOAT_NUMBER,
                off: start,
                len: self.pos - start,
                line,
                value: TokenValue::Float(v),
            })
        } else {
            let v: i64 = text
                .parse()
                .map_err(|_| self.err(line, "integer constant too large"))?;
            if v > i32::MAX as i64 {
                return Err(self.err(line, "integer constant too large"));
            }
            Ok(Token {
                ty: TOK_NUMBER,
                off: start,
                len: self.pos - start,
                line,
                value: TokenValue::Int(v as i32),
            })
        }
    }

    fn read_escape(&mut self, line: u32) -> Result<Option<char>, CompileError> {
        self.pos += 1;
        let Some(&c) = self.bytes.get(self.pos) else {
            return Err(self.err(line, "unterminated escape sequence"));
        };
        self.pos += 1;
        let decoded = match c {
            b'r' => '\r',
            b'n' => '\n',
            b't' => '\t',
            b'\\' => '\\',
            b'\'' => '\'',
            b'"' => '"',
            b'x' | b'u' | b'U' => {
                let digits = match c {
                    b'x' => 2,
                    b'u' => 4,
                    _ => 6,
                };
                let end = self.pos + digits;
                if end > self.bytes.len() {
                    return Err(self.err(line, "unterminated escape sequence"));
                }
                let text = &self.src[self.pos..end];
                let cp = u32::from_str_radix(text, 16)
                    .map_err(|_| self.err(line, "invalid escape sequence"))?;
                self.pos = end;
                match char::from_u32(cp) {
                    Some(ch) => ch,
                    None => return Ok(None),
                }
            }
            _ => return Err(self.err(line, "invalid escape sequence")),
        };
        Ok(Some(decoded))
    }

    fn lex_string(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(&c) = self.bytes.get(self.pos) else {
                return self.bad_token(start, line, "unterminated string literal");
            };
            match c {
                b'"' => {
                    self.pos += 1;
                    break;
                }
                b'\n' => return self.bad_token(start, line, "unterminated string literal"),
                b'\\' => match self.read_escape(line) {
                    // Surrogate or out-of-range codepoints decode as U+FFFD
                    Ok(Some(ch)) => out.push(ch),
                    Ok(None) => out.push('\u{FFFD}'),
                    Err(e) => {
                        if self.ignore_errors {
                            out.push('\u{FFFD}');
                        } else {
                            return Err(e);
                        }
                    }
                },
                _ => {
                    let rest = &self.src[self.pos..];
                    match rest.chars().next() {
                        Some(ch) => {
                            out.push(ch);
                            self.pos += ch.len_utf8();
                        }
                        None => {
                            // Invalid UTF-8 byte
                            out.push('\u{FFFD}');
                            self.pos += 1;
                        }
                    }
                }
            }
        }
        Ok(Token {
            ty: TOK_STRING,
            off: start,
            len: self.pos - start,
            line,
            value: TokenValue::Str(out),
        })
    }

    fn lex_char(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        self.pos += 1;
        let mut cps: Vec<u32> = Vec::new();
        loop {
            let Some(&c) = self.bytes.get(self.pos) else {
                return self.bad_token(start, line, "unterminated character literal");
            };
            match c {
                b'\'' => {
                    self.pos += 1;
                    break;
                }
                b'\n' => return self.bad_token(start, line, "unterminated character literal"),
                b'\\' => match self.read_escape(line) {
                    Ok(Some(ch)) => cps.push(ch as u32),
                    Ok(None) => {
                        return self.bad_token(start, line, "invalid escape in character literal");
                    }
                    Err(e) => {
                        if self.ignore_errors {
                            return self.bad_token(start, line, "invalid escape");
                        }
                        return Err(e);
                    }
                },
                _ => {
                    let rest = &self.src[self.pos..];
                    match rest.chars().next() {
                        Some(ch) => {
                            cps.push(ch as u32);
                            self.pos += ch.len_utf8();
                        }
                        None => return self.bad_token(start, line, "invalid character literal"),
                    }
                }
            }
        }
        // 1-4 codepoints that all fit a byte pack big-endian into one
        // integer; otherwise a single codepoint stands alone.
        let value = if cps.len() == 1 {
            cps[0] as i32
        } else if (2..=4).contains(&cps.len()) && cps.iter().all(|&c| c <= 0xFF) {
            cps.iter().fold(0i32, |acc, &c| (acc << 8) | c as i32)
        } else {
            return self.bad_token(start, line, "invalid character literal");
        };
        Ok(Token {
            ty: TOK_CHAR,
            off: start,
            len: self.pos - start,
            line,
            value: TokenValue::Int(value),
        })
    }

    fn lex_symbol(&mut self, start: usize, line: u32) -> Result<Token, CompileError> {
        const FOUR: &[&str] = &[">>>="];
        const THREE: &[&str] = &[">>>", "<<=", ">>=", "===", "!=="];
        const TWO: &[&str] = &[
            "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "==", "!=", "<=", ">=", "&&", "||",
            "<<", ">>", "++", "--", "..",
        ];
        const ONE: &[u8] = b"+-*/%&|^!~<>=?:;,.(){}[]";
        for (n, set) in [(4usize, FOUR), (3, THREE), (2, TWO)] {
            if start + n <= self.src.len()
                && let Some(text) = self.src.get(start..start + n)
                && set.contains(&text)
            {
                self.pos = start + n;
                return Ok(Token {
                    ty: TOK_SYMBOL,
                    off: start,
                    len: n,
                    line,
                    value: TokenValue::None,
                });
            }
        }
        let c = self.bytes[start];
        if ONE.contains(&c) {
            self.pos = start + 1;
            return Ok(Token {
                ty: TOK_SYMBOL,
                off: start,
                len: 1,
                line,
                value: TokenValue::None,
            });
        }
        // Skip one (possibly multi-byte) character
        let skip = self.src[start..].chars().next().map_or(1, |c| c.len_utf8());
        self.pos = start + skip;
        self.bad_token(start, line, "unexpected character")
    }

    fn bad_token(&mut self, start: usize, line: u32, msg: &str) -> Result<Token, CompileError> {
        if self.ignore_errors {
            if self.pos <= start {
                self.pos = start + 1;
            }
            Ok(Token {
                ty: TOK_UNKNOWN,
                off: start,
                len: self.pos - start,
                line,
                value: TokenValue::None,
            })
        } else {
            Err(self.err(line, msg))
        }
    }

    fn err(&self, line: u32, msg: &str) -> CompileError {
        CompileError::new("", line, msg)
    }
}

/// Re-derive a token (with its decoded payload) from a record produced by a
/// `use` preprocessor. The record's offsets index into `src`.
pub fn decode_record(
    src: &str,
    ty: i32,
    off: usize,
    len: usize,
    line: u32,
) -> Result<Token, CompileError> {
    let end = off.checked_add(len).filter(|&e| e <= src.len());
    let Some(end) = end else {
        return Err(CompileError::new("", line, "token record out of range"));
    };
    let text = &src[off..end];
    let mut t = Tokenizer::new(text, line, false);
    match t.next() {
        Ok(Some(mut tok)) if tok.ty == ty && tok.len == len => {
            tok.off = off;
            tok.line = line;
            Ok(tok)
        }
        _ => Err(CompileError::new("", line, "invalid token record")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(src: &str) -> Vec<Token> {
        Tokenizer::new(src, 1, false).tokenize_all().unwrap()
    }

    #[test]
    fn test_idents_and_keywords() {
        let toks = lex("function foo _bar x9");
        assert_eq!(toks[0].ty, TOK_KEYWORD);
        assert_eq!(toks[1].ty, TOK_IDENT);
        assert_eq!(toks[1].text("function foo _bar x9"), "foo");
        assert_eq!(toks[2].ty, TOK_IDENT);
        assert_eq!(toks[3].ty, TOK_IDENT);
    }

    #[test]
    fn test_func_ref_token() {
        let src = "foo#2 bar#0";
        let toks = lex(src);
        assert_eq!(toks[0].ty, TOK_FUNC_REF);
        assert_eq!(toks[0].text(src), "foo#2");
        assert_eq!(toks[1].text(src), "bar#0");
    }

    #[test]
    fn test_numbers() {
        let toks = lex("42 0xFF 1.5 2e3 7");
        assert_eq!(toks[0].value, TokenValue::Int(42));
        assert_eq!(toks[1].ty, TOK_HEX_NUMBER);
        assert_eq!(toks[1].value, TokenValue::Int(255));
        assert_eq!(toks[2].ty, TOK_FLOAT_NUMBER);
        assert_eq!(toks[2].value, TokenValue::Float(1.5));
        assert_eq!(toks[3].value, TokenValue::Float(2000.0));
        assert_eq!(toks[4].value, TokenValue::Int(7));
    }

    #[test]
    fn test_hex_wraps_to_i32() {
        let toks = lex("0xFFFFFFFF");
        assert_eq!(toks[0].value, TokenValue::Int(-1));
    }

    #[test]
    fn test_too_large_integer_fails() {
        assert!(Tokenizer::new("2147483648", 1, false).tokenize_all().is_err());
        let toks = lex("2147483647");
        assert_eq!(toks[0].value, TokenValue::Int(i32::MAX));
    }

    #[test]
    fn test_string_escapes() {
        let toks = lex(r#""a\tb\n\x41é\\""#);
        assert_eq!(toks[0].value, TokenValue::Str("a\tb\nA\u{E9}\\".to_string()));
    }

    #[test]
    fn test_surrogate_escape_becomes_replacement() {
        let toks = lex(r#""\uD800""#);
        assert_eq!(toks[0].value, TokenValue::Str("\u{FFFD}".to_string()));
    }

    #[test]
    fn test_char_literals() {
        let toks = lex("'A' 'ab' '\\n' '\u{E9}'");
        assert_eq!(toks[0].value, TokenValue::Int(65));
        assert_eq!(toks[1].value, TokenValue::Int(('a' as i32) << 8 | 'b' as i32));
        assert_eq!(toks[2].value, TokenValue::Int(10));
        assert_eq!(toks[3].value, TokenValue::Int(0xE9));
    }

    #[test]
    fn test_longest_symbols_win() {
        let src = ">>>= >>> >> > === == =";
        let toks = lex(src);
        let texts: Vec<&str> = toks.iter().map(|t| t.text(src)).collect();
        assert_eq!(texts, vec![">>>=", ">>>", ">>", ">", "===", "==", "="]);
    }

    #[test]
    fn test_comments_and_lines() {
        let toks = lex("a // comment\nb /* x\ny */ c");
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[1].line, 2);
        assert_eq!(toks[2].line, 3);
    }

    #[test]
    fn test_ignore_errors_yields_unknown() {
        let toks = Tokenizer::new("a $ b", 1, true).tokenize_all().unwrap();
        assert_eq!(toks[1].ty, TOK_UNKNOWN);
        assert_eq!(toks.len(), 3);
        assert!(Tokenizer::new("a $ b", 1, false).tokenize_all().is_err());
    }

    #[test]
    fn test_bad_escape_strict_vs_lenient() {
        assert!(Tokenizer::new(r#""\q""#, 1, false).tokenize_all().is_err());
        let toks = Tokenizer::new(r#""\q""#, 1, true).tokenize_all().unwrap();
        assert_eq!(toks[0].value, TokenValue::Str("\u{FFFD}".to_string()));
    }

    #[test]
    fn test_undo() {
        let mut t = Tokenizer::new("a b", 1, false);
        let a = t.next().unwrap().unwrap();
        t.undo(a.clone());
        assert_eq!(t.next().unwrap().unwrap(), a);
        assert_eq!(t.next().unwrap().unwrap().text("a b"), "b");
    }

    #[test]
    fn test_decode_record_roundtrip() {
        let src = r#"x = "hi" + 3"#;
        let toks = lex(src);
        for t in &toks {
            let d = decode_record(src, t.ty, t.off, t.len, t.line).unwrap();
            assert_eq!(&d, t);
        }
    }
}
