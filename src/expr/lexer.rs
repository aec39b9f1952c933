//! Single-pass tokenizer for the restricted expression grammar.
//!
//! Produces a flat token stream for the recursive-descent parser. Keywords
//! (`and`, `or`, `not`, `if`, `else`, `in`, literal `True`/`False`/`None`)
//! are recognized here so the parser never has to special-case identifiers.

use super::ExprError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),

    True,
    False,
    None,

    And,
    Or,
    Not,
    If,
    Else,
    In,

    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,

    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,

    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
}

/// Tokenize an expression string.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(i, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' => {
                tokens.push(lex_number(&mut chars, input)?);
            }
            // A leading dot starts a float only when followed by a digit.
            '.' => {
                chars.next();
                if chars.peek().map(|(_, c)| c.is_ascii_digit()) == Some(true) {
                    let start = i;
                    while chars.peek().map(|(_, c)| c.is_ascii_digit()) == Some(true) {
                        chars.next();
                    }
                    let end = chars.peek().map(|&(j, _)| j).unwrap_or(input.len());
                    let text = &input[start..end];
                    let value: f64 = text
                        .parse()
                        .map_err(|_| ExprError::Syntax(format!("invalid number '{}'", text)))?;
                    tokens.push(Token::Float(value));
                } else {
                    tokens.push(Token::Dot);
                }
            }
            '\'' | '"' => {
                tokens.push(lex_string(&mut chars, ch)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .peek()
                    .map(|(_, c)| c.is_alphanumeric() || *c == '_')
                    == Some(true)
                {
                    chars.next();
                }
                let end = chars.peek().map(|&(j, _)| j).unwrap_or(input.len());
                tokens.push(keyword_or_ident(&input[start..end]));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('*') {
                    chars.next();
                    tokens.push(Token::DoubleStar);
                } else {
                    tokens.push(Token::Star);
                }
            }
            '/' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('/') {
                    chars.next();
                    tokens.push(Token::DoubleSlash);
                } else {
                    tokens.push(Token::Slash);
                }
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '=' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    return Err(ExprError::Syntax(
                        "assignment is not allowed in expressions".into(),
                    ));
                }
            }
            '!' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    tokens.push(Token::NotEq);
                } else {
                    return Err(ExprError::Syntax("unexpected '!'".into()));
                }
            }
            '<' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    tokens.push(Token::LtEq);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek().map(|(_, c)| *c) == Some('=') {
                    chars.next();
                    tokens.push(Token::GtEq);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            other => {
                return Err(ExprError::Syntax(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

fn lex_number(
    chars: &mut std::iter::Peekable<std::str::CharIndices>,
    input: &str,
) -> Result<Token, ExprError> {
    let start = chars.peek().map(|&(i, _)| i).unwrap_or(0);
    let mut is_float = false;

    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_digit() {
            chars.next();
        } else if c == '.' && !is_float {
            // Only consume the dot when a digit follows; `1.upper` is
            // attribute access on an int, not a malformed float.
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek().map(|(_, c)| c.is_ascii_digit()) == Some(true) {
                is_float = true;
                chars.next();
            } else {
                break;
            }
        } else if (c == 'e' || c == 'E') && is_float {
            let mut lookahead = chars.clone();
            lookahead.next();
            match lookahead.peek() {
                Some((_, d)) if d.is_ascii_digit() || *d == '+' || *d == '-' => {
                    chars.next();
                    if chars.peek().map(|(_, c)| *c == '+' || *c == '-') == Some(true) {
                        chars.next();
                    }
                }
                _ => break,
            }
        } else {
            break;
        }
    }

    let end = chars.peek().map(|&(j, _)| j).unwrap_or(input.len());
    let text = &input[start..end];

    if is_float {
        let value: f64 = text
            .parse()
            .map_err(|_| ExprError::Syntax(format!("invalid number '{}'", text)))?;
        Ok(Token::Float(value))
    } else {
        let value: i64 = text
            .parse()
            .map_err(|_| ExprError::Syntax(format!("invalid number '{}'", text)))?;
        Ok(Token::Int(value))
    }
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices>,
    quote: char,
) -> Result<Token, ExprError> {
    chars.next(); // opening quote
    let mut out = String::new();

    while let Some((_, c)) = chars.next() {
        if c == quote {
            return Ok(Token::Str(out));
        }
        if c == '\\' {
            match chars.next() {
                Some((_, 'n')) => out.push('\n'),
                Some((_, 't')) => out.push('\t'),
                Some((_, 'r')) => out.push('\r'),
                Some((_, '\\')) => out.push('\\'),
                Some((_, c)) if c == quote => out.push(c),
                Some((_, other)) => {
                    out.push('\\');
                    out.push(other);
                }
                None => break,
            }
        } else {
            out.push(c);
        }
    }

    Err(ExprError::Syntax("unterminated string literal".into()))
}

fn keyword_or_ident(word: &str) -> Token {
    match word {
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "if" => Token::If,
        "else" => Token::Else,
        "in" => Token::In,
        "True" | "true" => Token::True,
        "False" | "false" => Token::False,
        "None" | "null" => Token::None,
        other => Token::Ident(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_arithmetic() {
        let tokens = tokenize("x + y * 2").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("x".into()),
                Token::Plus,
                Token::Ident("y".into()),
                Token::Star,
                Token::Int(2),
            ]
        );
    }

    #[test]
    fn test_tokenize_floats_and_attr_access() {
        assert_eq!(tokenize("1.5").unwrap(), vec![Token::Float(1.5)]);
        assert_eq!(
            tokenize("users.data").unwrap(),
            vec![
                Token::Ident("users".into()),
                Token::Dot,
                Token::Ident("data".into()),
            ]
        );
    }

    #[test]
    fn test_tokenize_strings() {
        assert_eq!(
            tokenize("'a\\'b'").unwrap(),
            vec![Token::Str("a'b".into())]
        );
        assert_eq!(tokenize("\"hi\"").unwrap(), vec![Token::Str("hi".into())]);
    }

    #[test]
    fn test_tokenize_comparison_chain() {
        let tokens = tokenize("0 <= x < 10").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Int(0),
                Token::LtEq,
                Token::Ident("x".into()),
                Token::Lt,
                Token::Int(10),
            ]
        );
    }

    #[test]
    fn test_tokenize_keywords() {
        let tokens = tokenize("a if not b else None").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Ident("a".into()),
                Token::If,
                Token::Not,
                Token::Ident("b".into()),
                Token::Else,
                Token::None,
            ]
        );
    }

    #[test]
    fn test_tokenize_rejects_assignment() {
        assert!(tokenize("x = 1").is_err());
    }

    #[test]
    fn test_tokenize_unterminated_string() {
        assert!(tokenize("'abc").is_err());
    }
}
