//! Scanner for Yan source text
//!
//! Source arrives as UTF-8 and is scanned as Unicode code points, so CJK
//! identifiers are ordinary identifiers. Fullwidth punctuation (，；（）
//! and friends) is normalized to its ASCII form outside string literals,
//! letting programs use either width.
//!
//! The whole input is tokenized up front; the compiler walks the token
//! vector.

/// A token with its lexeme and 1-indexed source line.
#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Single-character punctuation
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Dot,
    Semicolon,
    Tilde,
    // Operators, one or two characters
    Plus,
    PlusPlus,
    PlusEqual,
    Minus,
    MinusMinus,
    MinusEqual,
    Star,
    StarEqual,
    Slash,
    SlashEqual,
    Percent,
    PercentEqual,
    Ampersand,
    Pipe,
    Caret,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    ShiftRight,
    Less,
    LessEqual,
    ShiftLeft,
    // Literals
    Identifier,
    String,
    Number,
    // Keywords
    And,
    Class,
    Else,
    False,
    For,
    Fun,
    If,
    Nil,
    Or,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    // Sentinels
    Error,
    Eof,
}

/// Map fullwidth ASCII variants and CJK punctuation onto their ASCII
/// counterparts. Applied outside string literals only.
fn normalize(c: char) -> char {
    match c {
        '\u{FF01}'..='\u{FF5E}' => {
            char::from_u32(c as u32 - 0xFEE0).unwrap_or(c)
        }
        '。' => '.',
        '、' => ',',
        '\u{3000}' => ' ',
        _ => c,
    }
}

struct Scanner {
    chars: Vec<char>,
    start: usize,
    current: usize,
    line: u32,
    tokens: Vec<Token>,
}

/// Tokenize the whole source. The vector always ends with an `Eof` token;
/// malformed input yields `Error` tokens whose text is the message.
pub fn tokenize(source: &str) -> Vec<Token> {
    let mut scanner = Scanner {
        chars: source.chars().collect(),
        start: 0,
        current: 0,
        line: 1,
        tokens: Vec::new(),
    };
    scanner.run();
    scanner.tokens
}

impl Scanner {
    fn run(&mut self) {
        while !self.is_at_end() {
            self.skip_whitespace();
            if self.is_at_end() {
                break;
            }
            self.start = self.current;
            self.scan_token();
        }
        self.tokens.push(Token {
            kind: TokenKind::Eof,
            text: String::new(),
            line: self.line,
        });
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    fn peek(&self) -> char {
        self.chars.get(self.current).copied().map_or('\0', normalize)
    }

    fn peek_next(&self) -> char {
        self.chars
            .get(self.current + 1)
            .copied()
            .map_or('\0', normalize)
    }

    fn advance(&mut self) -> char {
        let c = self.peek();
        self.current += 1;
        c
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == expected {
            self.current += 1;
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.current += 1;
                }
                '\n' => {
                    self.line += 1;
                    self.current += 1;
                }
                '#' => {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.current += 1;
                    }
                }
                '/' if self.peek_next() == '/' => {
                    while self.peek() != '\n' && !self.is_at_end() {
                        self.current += 1;
                    }
                }
                _ => return,
            }
        }
    }

    fn scan_token(&mut self) {
        let c = self.advance();
        match c {
            '(' => self.push(TokenKind::LeftParen),
            ')' => self.push(TokenKind::RightParen),
            '{' => self.push(TokenKind::LeftBrace),
            '}' => self.push(TokenKind::RightBrace),
            '[' => self.push(TokenKind::LeftBracket),
            ']' => self.push(TokenKind::RightBracket),
            ',' => self.push(TokenKind::Comma),
            '.' => self.push(TokenKind::Dot),
            ';' => self.push(TokenKind::Semicolon),
            '~' => self.push(TokenKind::Tilde),
            '^' => self.push(TokenKind::Caret),
            '&' => self.push(TokenKind::Ampersand),
            '|' => self.push(TokenKind::Pipe),
            '+' => {
                let kind = if self.matches('+') {
                    TokenKind::PlusPlus
                } else if self.matches('=') {
                    TokenKind::PlusEqual
                } else {
                    TokenKind::Plus
                };
                self.push(kind);
            }
            '-' => {
                let kind = if self.matches('-') {
                    TokenKind::MinusMinus
                } else if self.matches('=') {
                    TokenKind::MinusEqual
                } else {
                    TokenKind::Minus
                };
                self.push(kind);
            }
            '*' => {
                let kind = if self.matches('=') {
                    TokenKind::StarEqual
                } else {
                    TokenKind::Star
                };
                self.push(kind);
            }
            '/' => {
                let kind = if self.matches('=') {
                    TokenKind::SlashEqual
                } else {
                    TokenKind::Slash
                };
                self.push(kind);
            }
            '%' => {
                let kind = if self.matches('=') {
                    TokenKind::PercentEqual
                } else {
                    TokenKind::Percent
                };
                self.push(kind);
            }
            '!' => {
                let kind = if self.matches('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                };
                self.push(kind);
            }
            '=' => {
                let kind = if self.matches('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                };
                self.push(kind);
            }
            '<' => {
                let kind = if self.matches('=') {
                    TokenKind::LessEqual
                } else if self.matches('<') {
                    TokenKind::ShiftLeft
                } else {
                    TokenKind::Less
                };
                self.push(kind);
            }
            '>' => {
                let kind = if self.matches('=') {
                    TokenKind::GreaterEqual
                } else if self.matches('>') {
                    TokenKind::ShiftRight
                } else {
                    TokenKind::Greater
                };
                self.push(kind);
            }
            '"' => self.string(),
            c if c.is_ascii_digit() => self.number(),
            c if is_identifier_start(c) => self.identifier(),
            c => self.error(format!("意外的字符「{c}」。")),
        }
    }

    /// String literals keep their characters raw; only the delimiter is
    /// recognized through normalization.
    fn string(&mut self) {
        let mut text = String::new();
        while !self.is_at_end() && self.peek() != '"' {
            let raw = self.chars[self.current];
            self.current += 1;
            if raw == '\n' {
                self.line += 1;
                text.push(raw);
            } else if raw == '\\' && !self.is_at_end() {
                let escaped = self.chars[self.current];
                self.current += 1;
                match escaped {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    '\\' => text.push('\\'),
                    '"' => text.push('"'),
                    other => {
                        text.push('\\');
                        text.push(other);
                    }
                }
            } else {
                text.push(raw);
            }
        }
        if self.is_at_end() {
            self.error("未终止的字符串。".to_string());
            return;
        }
        self.current += 1; // closing quote
        self.tokens.push(Token {
            kind: TokenKind::String,
            text,
            line: self.line,
        });
    }

    fn number(&mut self) {
        while self.peek().is_ascii_digit() {
            self.current += 1;
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.current += 1;
            while self.peek().is_ascii_digit() {
                self.current += 1;
            }
        }
        let text: String = self.chars[self.start..self.current]
            .iter()
            .map(|&c| normalize(c))
            .collect();
        self.tokens.push(Token {
            kind: TokenKind::Number,
            text,
            line: self.line,
        });
    }

    fn identifier(&mut self) {
        while is_identifier_part(self.peek()) {
            self.current += 1;
        }
        let text: String = self.chars[self.start..self.current].iter().collect();
        let kind = keyword_kind(&text).unwrap_or(TokenKind::Identifier);
        self.tokens.push(Token {
            kind,
            text,
            line: self.line,
        });
    }

    fn push(&mut self, kind: TokenKind) {
        let text: String = self.chars[self.start..self.current]
            .iter()
            .map(|&c| normalize(c))
            .collect();
        self.tokens.push(Token {
            kind,
            text,
            line: self.line,
        });
    }

    fn error(&mut self, message: String) {
        self.tokens.push(Token {
            kind: TokenKind::Error,
            text: message,
            line: self.line,
        });
    }
}

fn is_identifier_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_identifier_part(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn keyword_kind(text: &str) -> Option<TokenKind> {
    let kind = match text {
        "和" => TokenKind::And,
        "类" => TokenKind::Class,
        "否则" => TokenKind::Else,
        "假" => TokenKind::False,
        "为" => TokenKind::For,
        "功能" => TokenKind::Fun,
        "如果" => TokenKind::If,
        "空" => TokenKind::Nil,
        "或" => TokenKind::Or,
        "返回" => TokenKind::Return,
        "超" => TokenKind::Super,
        "这" => TokenKind::This,
        "真" => TokenKind::True,
        "变量" => TokenKind::Var,
        "而" => TokenKind::While,
        _ => return None,
    };
    Some(kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_keywords_and_identifiers() {
        let tokens = tokenize("变量 甲 = 1；");
        assert_eq!(
            tokens.iter().map(|t| t.kind).collect::<Vec<_>>(),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Equal,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Eof
            ]
        );
        assert_eq!(tokens[1].text, "甲");
    }

    #[test]
    fn test_fullwidth_punctuation_normalizes() {
        assert_eq!(
            kinds("（）｛｝，；"),
            kinds("(){},;"),
        );
    }

    #[test]
    fn test_two_character_operators() {
        assert_eq!(
            kinds("== != <= >= << >> ++ -- += -="),
            vec![
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::LessEqual,
                TokenKind::GreaterEqual,
                TokenKind::ShiftLeft,
                TokenKind::ShiftRight,
                TokenKind::PlusPlus,
                TokenKind::MinusMinus,
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_string_literal_keeps_raw_text() {
        let tokens = tokenize("\"你好，世界\\n\"");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text, "你好，世界\n");
    }

    #[test]
    fn test_unterminated_string_is_error_token() {
        let tokens = tokenize("\"没有结尾");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert!(tokens[0].text.contains("未终止"));
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            kinds("1 # 注释\n// 另一个\n2"),
            vec![TokenKind::Number, TokenKind::Number, TokenKind::Eof]
        );
    }

    #[test]
    fn test_lines_are_tracked() {
        let tokens = tokenize("1\n2\n3");
        assert_eq!(
            tokens.iter().map(|t| t.line).collect::<Vec<_>>(),
            vec![1, 2, 3, 3]
        );
    }
}
