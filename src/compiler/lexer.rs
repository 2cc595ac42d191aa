//! Turns shader source into a stream of [`SpannedToken`]s. Comment styles
//! `/* */` and `//`; line numbers track through the token stream.

use super::token::{SpannedToken, Token};
use crate::error::RenderError;

pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Lexer {
            chars: source.chars().peekable(),
            line: 1,
        }
    }

    pub fn tokenize(source: &'a str) -> Result<Vec<SpannedToken>, RenderError> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token()?;
            let done = tok.token == Token::Eof;
            tokens.push(tok);
            if done {
                break;
            }
        }
        Ok(tokens)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next();
        if c == Some('\n') {
            self.line += 1;
        }
        c
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), RenderError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') => {
                    let mut clone = self.chars.clone();
                    clone.next();
                    match clone.peek() {
                        Some('/') => {
                            self.bump();
                            self.bump();
                            while let Some(c) = self.peek() {
                                if c == '\n' {
                                    break;
                                }
                                self.bump();
                            }
                        }
                        Some('*') => {
                            let start_line = self.line;
                            self.bump();
                            self.bump();
                            let mut closed = false;
                            while let Some(c) = self.bump() {
                                if c == '*' && self.peek() == Some('/') {
                                    self.bump();
                                    closed = true;
                                    break;
                                }
                            }
                            if !closed {
                                return Err(RenderError::syntax(
                                    start_line,
                                    "unterminated block comment",
                                ));
                            }
                        }
                        _ => break,
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn next_token(&mut self) -> Result<SpannedToken, RenderError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        let Some(c) = self.peek() else {
            return Ok(SpannedToken {
                token: Token::Eof,
                line,
            });
        };

        let token = if c.is_ascii_digit() {
            self.lex_number()?
        } else if c == '"' {
            self.lex_string()?
        } else if c.is_alphabetic() || c == '_' {
            self.lex_identifier_or_keyword()
        } else {
            self.lex_operator(line)?
        };

        Ok(SpannedToken { token, line })
    }

    fn lex_number(&mut self) -> Result<Token, RenderError> {
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else if c == '.' && !is_float {
                is_float = true;
                text.push(c);
                self.bump();
            } else if (c == 'e' || c == 'E')
                && text
                    .chars()
                    .last()
                    .map(|last| last.is_ascii_digit())
                    .unwrap_or(false)
            {
                is_float = true;
                text.push(c);
                self.bump();
                if matches!(self.peek(), Some('+') | Some('-')) {
                    text.push(self.bump().unwrap());
                }
            } else {
                break;
            }
        }
        if is_float {
            text.parse::<f64>()
                .map(Token::FloatLiteral)
                .map_err(|_| RenderError::syntax(self.line, format!("invalid float literal `{text}`")))
        } else {
            text.parse::<i64>()
                .map(Token::IntLiteral)
                .map_err(|_| RenderError::syntax(self.line, format!("invalid integer literal `{text}`")))
        }
    }

    fn lex_string(&mut self) -> Result<Token, RenderError> {
        let start_line = self.line;
        self.bump();
        let mut text = String::new();
        loop {
            match self.bump() {
                Some('"') => break,
                Some('\\') => {
                    if let Some(escaped) = self.bump() {
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                }
                Some(c) => text.push(c),
                None => {
                    return Err(RenderError::syntax(start_line, "unterminated string literal"))
                }
            }
        }
        Ok(Token::StringLiteral(text))
    }

    fn lex_identifier_or_keyword(&mut self) -> Token {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        match text.as_str() {
            "constant" => Token::Constant,
            "uniform" => Token::Uniform,
            "varying" => Token::Varying,
            "vertex" => Token::Vertex,
            "float" => Token::Float,
            "integer" => Token::Integer,
            "color" => Token::Color,
            "point" => Token::Point,
            "vector" => Token::Vector,
            "normal" => Token::Normal,
            "matrix" => Token::Matrix,
            "string" => Token::StringType,
            "void" => Token::Void,
            "surface" => Token::Surface,
            "displacement" => Token::Displacement,
            "light" => Token::Light,
            "volume" => Token::Volume,
            "imager" => Token::Imager,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "for" => Token::For,
            "illuminance" => Token::Illuminance,
            "solar" => Token::Solar,
            "return" => Token::Return,
            "break" => Token::Break,
            "continue" => Token::Continue,
            _ => Token::Identifier(text),
        }
    }

    fn lex_operator(&mut self, line: u32) -> Result<Token, RenderError> {
        let c = self.bump().unwrap();
        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ';' => Token::Semicolon,
            ',' => Token::Comma,
            '+' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::PlusAssign
                } else {
                    Token::Plus
                }
            }
            '-' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::MinusAssign
                } else {
                    Token::Minus
                }
            }
            '*' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::StarAssign
                } else {
                    Token::Star
                }
            }
            '/' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::SlashAssign
                } else {
                    Token::Slash
                }
            }
            '=' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::Eq
                } else {
                    Token::Assign
                }
            }
            '!' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '<' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::Le
                } else {
                    Token::Lt
                }
            }
            '>' => {
                if self.peek() == Some('=') {
                    self.bump();
                    Token::Ge
                } else {
                    Token::Gt
                }
            }
            '&' if self.peek() == Some('&') => {
                self.bump();
                Token::And
            }
            '|' if self.peek() == Some('|') => {
                self.bump();
                Token::Or
            }
            other => {
                return Err(RenderError::syntax(line, format!("unexpected character `{other}`")))
            }
        };
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_line_numbers_across_newlines() {
        let tokens = Lexer::tokenize("surface s() { \n   break; \n}").unwrap();
        let break_tok = tokens.iter().find(|t| t.token == Token::Break).unwrap();
        assert_eq!(break_tok.line, 2);
    }

    #[test]
    fn line_comments_are_skipped() {
        let tokens = Lexer::tokenize("// comment\nfloat x;").unwrap();
        assert!(matches!(tokens[0].token, Token::Float));
    }

    #[test]
    fn block_comments_are_skipped() {
        let tokens = Lexer::tokenize("/* a \n b */ float x;").unwrap();
        assert!(matches!(tokens[0].token, Token::Float));
    }

    #[test]
    fn lexes_float_and_int_literals() {
        let tokens = Lexer::tokenize("1 1.5 0.0031308").unwrap();
        assert_eq!(tokens[0].token, Token::IntLiteral(1));
        assert_eq!(tokens[1].token, Token::FloatLiteral(1.5));
        assert_eq!(tokens[2].token, Token::FloatLiteral(0.003130_8));
    }
}
