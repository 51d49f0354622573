// Expression Lexer
// Splits templates into text and ${{ }} spans and tokenizes expression bodies

use crate::{ServiceError, ServiceResult};

/// A piece of a template string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text, copied as-is
    Text(String),
    /// Body of a `${{ ... }}` span, trimmed
    Expression(String),
}

/// Split a template into literal text and `${{ }}` expression bodies.
pub fn segments(input: &str) -> ServiceResult<Vec<Segment>> {
    let mut result = Vec::new();
    let mut rest = input;

    while let Some(start) = rest.find("${{") {
        if start > 0 {
            result.push(Segment::Text(rest[..start].to_string()));
        }
        let body_start = start + 3;
        let end = find_closing(&rest[body_start..]).ok_or_else(|| {
            ServiceError::expression(input, "unterminated '${{' (missing '}}')")
        })?;
        let body = rest[body_start..body_start + end].trim();
        result.push(Segment::Expression(body.to_string()));
        rest = &rest[body_start + end + 2..];
    }

    if !rest.is_empty() {
        result.push(Segment::Text(rest.to_string()));
    }

    Ok(result)
}

/// Check whether a string contains any `${{ }}` span.
pub fn has_expressions(input: &str) -> bool {
    input.contains("${{")
}

/// Find the offset of the closing `}}`, ignoring braces inside string literals.
fn find_closing(body: &str) -> Option<usize> {
    let bytes = body.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                // '' is an escaped quote inside a literal
                if in_string && bytes.get(i + 1) == Some(&b'\'') {
                    i += 2;
                    continue;
                }
                in_string = !in_string;
            }
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Expression tokens
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Tokenize an expression body.
pub fn tokenize(expr: &str) -> ServiceResult<Vec<Token>> {
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let err = |message: String| ServiceError::expression(expr, message);

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' if !chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '!' | '=' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_is_eq) {
                    ('!', true) => Token::Ne,
                    ('!', false) => Token::Not,
                    ('=', true) => Token::Eq,
                    ('<', true) => Token::Le,
                    ('<', false) => Token::Lt,
                    ('>', true) => Token::Ge,
                    ('>', false) => Token::Gt,
                    _ => return Err(err("single '=' is not an operator, use '=='".into())),
                };
                tokens.push(token);
                i += if next_is_eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(err(format!("expected '{}{}'", c, c)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(err("unterminated string literal".into())),
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '+')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| err(format!("invalid number '{}'", text)))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(err(format!("unexpected character '{}'", other))),
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_mixed_text() {
        let parts = segments("torch==${{ matrix.torch }}+cpu").unwrap();
        assert_eq!(
            parts,
            vec![
                Segment::Text("torch==".into()),
                Segment::Expression("matrix.torch".into()),
                Segment::Text("+cpu".into()),
            ]
        );
    }

    #[test]
    fn test_segments_braces_inside_string() {
        let parts = segments("${{ format('{0}}}', 'x') }}").unwrap();
        assert_eq!(parts, vec![Segment::Expression("format('{0}}}', 'x')".into())]);
    }

    #[test]
    fn test_segments_unterminated() {
        assert!(segments("echo ${{ matrix.torch").is_err());
    }

    #[test]
    fn test_segments_plain_text() {
        assert_eq!(segments("make test").unwrap(), vec![Segment::Text("make test".into())]);
        assert!(segments("").unwrap().is_empty());
        assert!(!has_expressions("make test"));
    }

    #[test]
    fn test_tokenize_operators() {
        let tokens = tokenize("!a && b != 'x' || c <= 3").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Not,
                Token::Ident("a".into()),
                Token::And,
                Token::Ident("b".into()),
                Token::Ne,
                Token::Str("x".into()),
                Token::Or,
                Token::Ident("c".into()),
                Token::Le,
                Token::Number(3.0),
            ]
        );
    }

    #[test]
    fn test_tokenize_hyphenated_identifier_and_escaped_quote() {
        let tokens = tokenize("steps.set-up.outputs == 'it''s'").unwrap();
        assert_eq!(tokens[2], Token::Ident("set-up".into()));
        assert_eq!(tokens[6], Token::Str("it's".into()));
    }

    #[test]
    fn test_tokenize_rejects_single_equals() {
        assert!(tokenize("a = b").is_err());
        assert!(tokenize("a & b").is_err());
    }
}
