//! Descriptive-string encoding of [`Query`].
//!
//! ```text
//! query       := step*
//! step        := field | join | existential
//! field       := 'F.' name '="' literal '"'
//! join        := ('S.' | 'P.') role
//! existential := ('N' | 'E') '(' query ')'
//! ```
//!
//! Steps are separated by single spaces in the canonical form. Names and
//! roles are made of alphanumerics, `_`, `-` and `$`. Inside a literal, `"`
//! and `\` are escaped with a backslash.

use super::{Direction, Quantifier, Query, Step};

/// A malformed descriptive string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("query parse error at byte {position}: {message}")]
pub struct ParseError {
    /// Byte offset into the input where parsing failed.
    pub position: usize,
    pub message: String,
}

/// Render the canonical descriptive string.
pub fn render(query: &Query) -> String {
    let mut out = String::new();
    write_steps(&mut out, query.steps());
    out
}

/// Parse a descriptive string. Rejects anything that is not a complete query.
pub fn parse(text: &str) -> Result<Query, ParseError> {
    let mut parser = Parser { text, pos: 0 };
    let query = parser.query()?;
    parser.skip_whitespace();
    if parser.pos < text.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(query)
}

fn write_steps(out: &mut String, steps: &[Step]) {
    for (i, step) in steps.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match step {
            Step::Field { name, value } => {
                out.push_str("F.");
                out.push_str(name);
                out.push_str("=\"");
                for c in value.chars() {
                    if c == '"' || c == '\\' {
                        out.push('\\');
                    }
                    out.push(c);
                }
                out.push('"');
            }
            Step::Join { direction, role } => {
                out.push_str(match direction {
                    Direction::Successor => "S.",
                    Direction::Predecessor => "P.",
                });
                out.push_str(role);
            }
            Step::Existential { quantifier, query } => {
                out.push(match quantifier {
                    Quantifier::NotExists => 'N',
                    Quantifier::Exists => 'E',
                });
                out.push('(');
                write_steps(out, query.steps());
                out.push(')');
            }
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-' || c == '$'
}

/// Whether `name` can be written as a field name or role: non-empty, and
/// only alphanumerics, `_`, `-` and `$`.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_name_char)
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.pos,
            message: message.into(),
        }
    }

    fn rest(&self) -> &str {
        &self.text[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), ParseError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.error(format!("expected `{expected}`, found `{c}`"))),
            None => Err(self.error(format!("expected `{expected}`, found end of input"))),
        }
    }

    /// Steps up to end of input or an unconsumed `)`.
    fn query(&mut self) -> Result<Query, ParseError> {
        let mut steps = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                None | Some(')') => break,
                Some(_) => {}
            }
            steps.push(self.step()?);
            // Steps must be separated.
            match self.peek() {
                None | Some(')') => {}
                Some(c) if c.is_whitespace() => {}
                Some(c) => return Err(self.error(format!("unexpected `{c}` after step"))),
            }
        }
        Ok(Query::from_steps(steps))
    }

    fn step(&mut self) -> Result<Step, ParseError> {
        let start = self.pos;
        match self.bump() {
            Some('F') => {
                self.expect('.')?;
                let name = self.name()?;
                self.expect('=')?;
                let value = self.literal()?;
                Ok(Step::Field { name, value })
            }
            Some(c @ ('S' | 'P')) => {
                self.expect('.')?;
                let role = self.name()?;
                let direction = if c == 'S' {
                    Direction::Successor
                } else {
                    Direction::Predecessor
                };
                Ok(Step::Join { direction, role })
            }
            Some(c @ ('N' | 'E')) => {
                self.expect('(')?;
                let query = self.query()?;
                self.expect(')')?;
                let quantifier = if c == 'N' {
                    Quantifier::NotExists
                } else {
                    Quantifier::Exists
                };
                Ok(Step::Existential { quantifier, query })
            }
            Some(c) => {
                self.pos = start;
                Err(self.error(format!("unexpected `{c}`, expected a step")))
            }
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn name(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while self.peek().is_some_and(is_name_char) {
            self.bump();
        }
        if self.pos == start {
            return Err(self.error("expected a name"));
        }
        Ok(self.text[start..self.pos].to_string())
    }

    fn literal(&mut self) -> Result<String, ParseError> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(value),
                Some('\\') => match self.bump() {
                    Some(c @ ('"' | '\\')) => value.push(c),
                    Some(c) => return Err(self.error(format!("invalid escape `\\{c}`"))),
                    None => return Err(self.error("unterminated literal")),
                },
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated literal")),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(text: &str) {
        let query = parse(text).unwrap();
        assert_eq!(render(&query), text);
    }

    #[test]
    fn empty_query() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse("   ").unwrap().is_empty());
        assert_eq!(render(&Query::new()), "");
    }

    #[test]
    fn canonical_forms_round_trip() {
        round_trip("S.parent");
        round_trip("P.parent");
        round_trip(r#"F.type="Type" S.parent"#);
        round_trip(r#"F.type="Project" S.project F.type="Task" N(S.task F.type="TaskCompleted")"#);
        round_trip("S.a E(S.b N(S.c)) P.d");
        round_trip("N()");
    }

    #[test]
    fn parse_builds_expected_steps() {
        let query = parse(r#"S.list F.description="Take out the trash""#).unwrap();
        assert_eq!(
            query.steps(),
            &[
                Step::Join {
                    direction: Direction::Successor,
                    role: "list".into()
                },
                Step::Field {
                    name: "description".into(),
                    value: "Take out the trash".into()
                },
            ]
        );
    }

    #[test]
    fn extra_whitespace_normalises() {
        let query = parse("  S.a \t P.b  ").unwrap();
        assert_eq!(render(&query), "S.a P.b");
    }

    #[test]
    fn literals_escape_quotes_and_backslashes() {
        let query = Query::new().field("note", r#"say "hi" \o/"#);
        let text = render(&query);
        assert_eq!(text, r#"F.note="say \"hi\" \\o/""#);
        assert_eq!(parse(&text).unwrap(), query);
    }

    #[test]
    fn valid_names() {
        assert!(is_valid_name("list"));
        assert!(is_valid_name("$owner_2-x"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("a b"));
        assert!(!is_valid_name("a.b"));
        assert!(!is_valid_name("a=\"x\""));
    }

    #[test]
    fn rejects_trailing_garbage() {
        let err = parse("S.a )").unwrap_err();
        assert_eq!(err.position, 4);
        assert!(parse("S.a P.b)").is_err());
    }

    #[test]
    fn rejects_malformed_steps() {
        assert!(parse("X.a").is_err());
        assert!(parse("S.").is_err());
        assert!(parse("S a").is_err());
        assert!(parse("F.type=Task").is_err());
        assert!(parse(r#"F.type="Task"#).is_err());
        assert!(parse(r#"F.type="a\nb""#).is_err());
        assert!(parse("N(S.a").is_err());
        assert!(parse("N S.a").is_err());
        assert!(parse(r#"S.a"S.b""#).is_err());
    }

    #[test]
    fn steps_must_be_separated() {
        assert!(parse("N(S.a)S.b").is_err());
        assert!(parse("S.a(").is_err());
    }
}
