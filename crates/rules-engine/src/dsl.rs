//! Condition language used in rule expressions.
//!
//! ```text
//! payload.filename STARTS_WITH "/tmp" AND NOT header.image == "/usr/bin/make"
//! payload.flags == O_CREAT OR (payload.port >= 1024 AND payload.port < 2048)
//! ```
//!
//! `NOT` binds tighter than `AND`, which binds tighter than `OR`.
//! Conditions nest at most [`MAX_DEPTH`] levels, counting both parentheses
//! and the height of the resulting tree.

use thiserror::Error;

pub const MAX_DEPTH: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DslError {
    #[error("empty expression")]
    Empty,
    #[error("unterminated string starting at {0}")]
    UnterminatedString(usize),
    #[error("invalid token '{token}' at {position}")]
    InvalidToken { token: String, position: usize },
    #[error("unexpected token '{token}' at {position}")]
    UnexpectedToken { token: String, position: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("expression nested too deeply at {position}")]
    TooDeep { position: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Base {
        field: String,
        op: Operator,
        value: Value,
    },
    And {
        l: Box<Condition>,
        r: Box<Condition>,
    },
    Or {
        l: Box<Condition>,
        r: Box<Condition>,
    },
    Not(Box<Condition>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    StartsWith,
    EndsWith,
    Contains,
}

impl Operator {
    /// Operators which only make sense on strings.
    pub fn is_string_operator(&self) -> bool {
        matches!(
            self,
            Operator::StartsWith | Operator::EndsWith | Operator::Contains
        )
    }

    /// Operators which only make sense on integers.
    pub fn is_ordering_operator(&self) -> bool {
        matches!(
            self,
            Operator::Greater | Operator::GreaterEqual | Operator::Less | Operator::LessEqual
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Str(String),
    Int(i64),
    /// Named constant, resolved when the rule is compiled.
    Constant(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Op(Operator),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Str(s) => write!(f, "\"{s}\""),
            Token::Int(i) => write!(f, "{i}"),
            Token::Op(op) => write!(f, "{op:?}"),
            Token::And => write!(f, "AND"),
            Token::Or => write!(f, "OR"),
            Token::Not => write!(f, "NOT"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
        }
    }
}

/// Parse a rule expression into a [`Condition`] tree.
pub fn parse(input: &str) -> Result<Condition, DslError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(DslError::Empty);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };
    let (condition, _) = parser.or()?;

    match parser.tokens.get(parser.pos) {
        None => Ok(condition),
        Some((token, position)) => Err(DslError::UnexpectedToken {
            token: token.to_string(),
            position: *position,
        }),
    }
}

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, DslError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, position));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, position));
                i += 1;
            }
            '"' => {
                let mut value = String::new();
                let mut escaped = false;
                i += 1;
                loop {
                    let Some(&(_, c)) = chars.get(i) else {
                        return Err(DslError::UnterminatedString(position));
                    };
                    i += 1;
                    match (escaped, c) {
                        (true, c) => {
                            value.push(c);
                            escaped = false;
                        }
                        (false, '\\') => escaped = true,
                        (false, '"') => break,
                        (false, c) => value.push(c),
                    }
                }
                tokens.push((Token::Str(value), position));
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).map(|(_, c)| *c);
                let (op, len) = match (c, next) {
                    ('=', Some('=')) => (Operator::Equals, 2),
                    ('!', Some('=')) => (Operator::NotEquals, 2),
                    ('<', Some('=')) => (Operator::LessEqual, 2),
                    ('>', Some('=')) => (Operator::GreaterEqual, 2),
                    ('<', _) => (Operator::Less, 1),
                    ('>', _) => (Operator::Greater, 1),
                    _ => {
                        return Err(DslError::InvalidToken {
                            token: c.to_string(),
                            position,
                        });
                    }
                };
                tokens.push((Token::Op(op), position));
                i += len;
            }
            _ => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i].1) {
                    i += 1;
                }
                if start == i {
                    return Err(DslError::InvalidToken {
                        token: c.to_string(),
                        position,
                    });
                }
                let word: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((classify(word, position)?, position));
            }
        }
    }

    Ok(tokens)
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn classify(word: String, position: usize) -> Result<Token, DslError> {
    let token = match word.as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "STARTS_WITH" => Token::Op(Operator::StartsWith),
        "ENDS_WITH" => Token::Op(Operator::EndsWith),
        "CONTAINS" => Token::Op(Operator::Contains),
        _ => {
            if let Ok(i) = word.parse::<i64>() {
                Token::Int(i)
            } else if is_identifier(&word) {
                Token::Ident(word)
            } else {
                return Err(DslError::InvalidToken {
                    token: word,
                    position,
                });
            }
        }
    };
    Ok(token)
}

/// Dotted identifier where each segment starts with a letter or underscore.
fn is_identifier(word: &str) -> bool {
    word.split('.').all(|segment| {
        let mut chars = segment.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    /// Open parentheses and `NOT`s around the current position.
    nesting: usize,
}

/// A parsed condition along with the height of its tree.
type Parsed = (Condition, usize);

impl Parser {
    fn next(&mut self) -> Result<(Token, usize), DslError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(DslError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(token)
    }

    fn or(&mut self) -> Result<Parsed, DslError> {
        let (mut l, mut height) = self.and()?;
        while let Some((Token::Or, position)) = self.tokens.get(self.pos) {
            let position = *position;
            self.pos += 1;
            let (r, r_height) = self.and()?;
            height = grow(height.max(r_height), position)?;
            l = Condition::Or {
                l: Box::new(l),
                r: Box::new(r),
            };
        }
        Ok((l, height))
    }

    fn and(&mut self) -> Result<Parsed, DslError> {
        let (mut l, mut height) = self.unary()?;
        while let Some((Token::And, position)) = self.tokens.get(self.pos) {
            let position = *position;
            self.pos += 1;
            let (r, r_height) = self.unary()?;
            height = grow(height.max(r_height), position)?;
            l = Condition::And {
                l: Box::new(l),
                r: Box::new(r),
            };
        }
        Ok((l, height))
    }

    fn unary(&mut self) -> Result<Parsed, DslError> {
        match self.next()? {
            (Token::Not, position) => {
                let (inner, height) = self.nested(position, Self::unary)?;
                Ok((Condition::Not(Box::new(inner)), grow(height, position)?))
            }
            (Token::LParen, position) => {
                let inner = self.nested(position, Self::or)?;
                match self.next()? {
                    (Token::RParen, _) => Ok(inner),
                    (token, position) => Err(unexpected(token, position)),
                }
            }
            (Token::Ident(field), _) => {
                let op = match self.next()? {
                    (Token::Op(op), _) => op,
                    (token, position) => return Err(unexpected(token, position)),
                };
                let value = match self.next()? {
                    (Token::Str(s), _) => Value::Str(s),
                    (Token::Int(i), _) => Value::Int(i),
                    (Token::Ident(name), _) => Value::Constant(name),
                    (token, position) => return Err(unexpected(token, position)),
                };
                Ok((Condition::Base { field, op, value }, 1))
            }
            (token, position) => Err(unexpected(token, position)),
        }
    }

    fn nested(
        &mut self,
        position: usize,
        parse: fn(&mut Self) -> Result<Parsed, DslError>,
    ) -> Result<Parsed, DslError> {
        if self.nesting >= MAX_DEPTH {
            return Err(DslError::TooDeep { position });
        }
        self.nesting += 1;
        let parsed = parse(self);
        self.nesting -= 1;
        parsed
    }
}

fn grow(height: usize, position: usize) -> Result<usize, DslError> {
    if height >= MAX_DEPTH {
        Err(DslError::TooDeep { position })
    } else {
        Ok(height + 1)
    }
}

fn unexpected(token: Token, position: usize) -> DslError {
    DslError::UnexpectedToken {
        token: token.to_string(),
        position,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(field: &str, op: Operator, value: Value) -> Condition {
        Condition::Base {
            field: field.to_string(),
            op,
            value,
        }
    }

    #[test]
    fn simple_field_string_op() {
        let parsed = parse(r#"payload.filename STARTS_WITH "/tmp""#).unwrap();
        assert_eq!(
            parsed,
            base(
                "payload.filename",
                Operator::StartsWith,
                Value::Str("/tmp".to_string())
            )
        );
    }

    #[test]
    fn numbers_and_constants() {
        assert_eq!(
            parse("header.pid >= -3").unwrap(),
            base("header.pid", Operator::GreaterEqual, Value::Int(-3))
        );
        assert_eq!(
            parse("payload.flags == O_CREAT").unwrap(),
            base(
                "payload.flags",
                Operator::Equals,
                Value::Constant("O_CREAT".to_string())
            )
        );
    }

    #[test]
    fn escaped_string() {
        assert_eq!(
            parse(r#"header.image == "a \"b\" \\c""#).unwrap(),
            base(
                "header.image",
                Operator::Equals,
                Value::Str(r#"a "b" \c"#.to_string())
            )
        );
    }

    #[test]
    fn precedence() {
        let parsed = parse(r#"a == 1 OR b == 2 AND NOT c == 3"#).unwrap();
        let expected = Condition::Or {
            l: Box::new(base("a", Operator::Equals, Value::Int(1))),
            r: Box::new(Condition::And {
                l: Box::new(base("b", Operator::Equals, Value::Int(2))),
                r: Box::new(Condition::Not(Box::new(base(
                    "c",
                    Operator::Equals,
                    Value::Int(3),
                )))),
            }),
        };
        assert_eq!(parsed, expected);
    }

    #[test]
    fn parentheses() {
        let parsed = parse(r#"(a == 1 OR b == 2) AND c != "x""#).unwrap();
        let expected = Condition::And {
            l: Box::new(Condition::Or {
                l: Box::new(base("a", Operator::Equals, Value::Int(1))),
                r: Box::new(base("b", Operator::Equals, Value::Int(2))),
            }),
            r: Box::new(base(
                "c",
                Operator::NotEquals,
                Value::Str("x".to_string()),
            )),
        };
        assert_eq!(parsed, expected);
    }

    #[test]
    fn no_number_field_start() {
        assert!(matches!(
            parse("4ad == 3"),
            Err(DslError::InvalidToken { .. })
        ));
    }

    #[test]
    fn errors() {
        assert_eq!(parse("   "), Err(DslError::Empty));
        assert_eq!(parse(r#"a == "open"#), Err(DslError::UnterminatedString(5)));
        assert_eq!(parse("a =="), Err(DslError::UnexpectedEnd));
        assert!(matches!(
            parse("a == 1 b == 2"),
            Err(DslError::UnexpectedToken { .. })
        ));
        assert!(matches!(
            parse("(a == 1"),
            Err(DslError::UnexpectedEnd)
        ));
        assert!(matches!(parse("a = 1"), Err(DslError::InvalidToken { .. })));
        assert!(matches!(parse("a == 1 &"), Err(DslError::InvalidToken { .. })));
    }

    #[test]
    fn nesting_limit() {
        let nested = |depth: usize| {
            format!("{}a == 1{}", "(".repeat(depth), ")".repeat(depth))
        };
        assert!(parse(&nested(MAX_DEPTH)).is_ok());
        assert_eq!(
            parse(&nested(MAX_DEPTH + 1)),
            Err(DslError::TooDeep { position: MAX_DEPTH })
        );
        assert!(matches!(
            parse(&nested(100_000)),
            Err(DslError::TooDeep { .. })
        ));

        let negated = format!("{}a == 1", "NOT ".repeat(100_000));
        assert!(matches!(parse(&negated), Err(DslError::TooDeep { .. })));

        // Long chains grow the tree as much as nesting does.
        let chain = |terms: usize| vec!["a == 1"; terms].join(" AND ");
        assert!(parse(&chain(MAX_DEPTH)).is_ok());
        assert!(matches!(
            parse(&chain(100_000)),
            Err(DslError::TooDeep { .. })
        ));
    }
}
