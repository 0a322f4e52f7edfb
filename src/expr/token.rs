//! Lexer for the expression language.

use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Not,
    True,
    False,
    Null,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

fn keyword(word: &str) -> Option<Token> {
    match word {
        "and" => Some(Token::And),
        "or" => Some(Token::Or),
        "not" => Some(Token::Not),
        "true" | "True" => Some(Token::True),
        "false" | "False" => Some(Token::False),
        "null" | "None" => Some(Token::Null),
        _ => None,
    }
}

pub fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let byte = bytes[pos];
        let token = match byte {
            b' ' | b'\t' | b'\r' | b'\n' => {
                pos += 1;
                continue;
            }
            b'(' => {
                pos += 1;
                Token::LParen
            }
            b')' => {
                pos += 1;
                Token::RParen
            }
            b',' => {
                pos += 1;
                Token::Comma
            }
            b'+' => {
                pos += 1;
                Token::Plus
            }
            b'-' => {
                pos += 1;
                Token::Minus
            }
            b'*' => {
                pos += 1;
                Token::Star
            }
            b'/' => {
                pos += 1;
                Token::Slash
            }
            b'%' => {
                pos += 1;
                Token::Percent
            }
            b'=' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::EqEq
            }
            b'!' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::NotEq
            }
            b'!' => {
                pos += 1;
                Token::Not
            }
            b'&' if bytes.get(pos + 1) == Some(&b'&') => {
                pos += 2;
                Token::And
            }
            b'|' if bytes.get(pos + 1) == Some(&b'|') => {
                pos += 2;
                Token::Or
            }
            b'<' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::LtEq
            }
            b'<' => {
                pos += 1;
                Token::Lt
            }
            b'>' if bytes.get(pos + 1) == Some(&b'=') => {
                pos += 2;
                Token::GtEq
            }
            b'>' => {
                pos += 1;
                Token::Gt
            }
            b'\'' | b'"' => {
                let (text, next) = lex_string(src, pos, byte)?;
                pos = next;
                Token::Str(text)
            }
            b'0'..=b'9' => {
                let (token, next) = lex_number(src, pos)?;
                pos = next;
                token
            }
            b'_' | b'a'..=b'z' | b'A'..=b'Z' => {
                let mut end = pos;
                while end < bytes.len()
                    && (bytes[end] == b'_' || bytes[end].is_ascii_alphanumeric())
                {
                    end += 1;
                }
                let word = &src[pos..end];
                pos = end;
                keyword(word).unwrap_or_else(|| Token::Ident(word.to_string()))
            }
            other => {
                return Err(ExprError::Parse {
                    pos: start,
                    msg: format!("unexpected character {:?}", other as char),
                })
            }
        };
        tokens.push(Spanned { token, pos: start });
    }

    Ok(tokens)
}

fn lex_string(src: &str, start: usize, quote: u8) -> Result<(String, usize), ExprError> {
    let bytes = src.as_bytes();
    let mut text = String::new();
    let mut pos = start + 1;
    while pos < bytes.len() {
        match bytes[pos] {
            b'\\' => {
                let escaped = bytes.get(pos + 1).ok_or(ExprError::Parse {
                    pos,
                    msg: "dangling escape".into(),
                })?;
                text.push(match escaped {
                    b'n' => '\n',
                    b't' => '\t',
                    other => *other as char,
                });
                pos += 2;
            }
            byte if byte == quote => return Ok((text, pos + 1)),
            _ => {
                // Copy the full UTF-8 character, not just the lead byte.
                let ch = src[pos..].chars().next().ok_or(ExprError::Parse {
                    pos,
                    msg: "invalid utf-8".into(),
                })?;
                text.push(ch);
                pos += ch.len_utf8();
            }
        }
    }
    Err(ExprError::Parse {
        pos: start,
        msg: "unterminated string literal".into(),
    })
}

fn lex_number(src: &str, start: usize) -> Result<(Token, usize), ExprError> {
    let bytes = src.as_bytes();
    let mut end = start;
    let mut is_float = false;
    while end < bytes.len() {
        match bytes[end] {
            b'0'..=b'9' => end += 1,
            b'.' if !is_float => {
                is_float = true;
                end += 1;
            }
            _ => break,
        }
    }
    let literal = &src[start..end];
    let token = if is_float {
        Token::Float(literal.parse().map_err(|_| ExprError::Parse {
            pos: start,
            msg: format!("bad float literal {literal:?}"),
        })?)
    } else {
        Token::Int(literal.parse().map_err(|_| ExprError::Parse {
            pos: start,
            msg: format!("bad integer literal {literal:?}"),
        })?)
    };
    Ok((token, end))
}
