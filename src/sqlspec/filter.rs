use std::collections::HashMap;

use super::SpecError;

/// Event metadata the upstream attaches to each delivered event; filters
/// are evaluated against this map.
pub type TagMap = HashMap<String, String>;

/// A compiled filter predicate: a conjunction of tag conditions, parsed
/// once at spec load and cached on the binding.
///
/// Grammar: `key = 'value'`, `key != 'value'`, `key CONTAINS 'value'`,
/// joined by `AND`. Unquoted values run to the next whitespace. The empty
/// filter matches every event. A condition on a tag that is absent never
/// matches.
#[derive(Debug, Clone)]
pub struct Filter {
    source: String,
    conditions: Vec<Condition>,
}

#[derive(Debug, Clone)]
struct Condition {
    key: String,
    op: Op,
    value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Contains,
}

impl Filter {
    pub fn parse(input: &str) -> Result<Self, SpecError> {
        let tokens = tokenize(input).map_err(|reason| SpecError::BadFilter {
            filter: input.to_string(),
            reason,
        })?;

        let mut conditions = Vec::new();
        let mut iter = tokens.into_iter().peekable();

        while let Some(key) = iter.next() {
            let key = match key {
                Token::Word(w) => w,
                other => {
                    return Err(bad(input, format!("expected tag name, found {other:?}")));
                }
            };
            let op = match iter.next() {
                Some(Token::Eq) => Op::Eq,
                Some(Token::Ne) => Op::Ne,
                Some(Token::Word(w)) if w.eq_ignore_ascii_case("CONTAINS") => Op::Contains,
                other => return Err(bad(input, format!("expected operator, found {other:?}"))),
            };
            let value = match iter.next() {
                Some(Token::Quoted(v)) | Some(Token::Word(v)) => v,
                other => return Err(bad(input, format!("expected value, found {other:?}"))),
            };
            conditions.push(Condition { key, op, value });

            match iter.next() {
                None => break,
                Some(Token::Word(w)) if w.eq_ignore_ascii_case("AND") => continue,
                Some(other) => return Err(bad(input, format!("expected AND, found {other:?}"))),
            }
        }

        Ok(Self { source: input.to_string(), conditions })
    }

    pub fn matches(&self, tags: &TagMap) -> bool {
        self.conditions.iter().all(|c| match tags.get(&c.key) {
            Some(tag) => match c.op {
                Op::Eq => tag == &c.value,
                Op::Ne => tag != &c.value,
                Op::Contains => tag.contains(&c.value),
            },
            None => false,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn bad(filter: &str, reason: String) -> SpecError {
    SpecError::BadFilter { filter: filter.to_string(), reason }
}

#[derive(Debug, Clone)]
enum Token {
    Word(String),
    Quoted(String),
    Eq,
    Ne,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ch if ch.is_whitespace() => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => value.push(ch),
                        None => return Err("unterminated quoted value".to_string()),
                    }
                }
                tokens.push(Token::Quoted(value));
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '!' => {
                chars.next();
                match chars.next() {
                    Some('=') => tokens.push(Token::Ne),
                    _ => return Err("expected '=' after '!'".to_string()),
                }
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || ch == '=' || ch == '!' || ch == '\'' {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_equality_match() {
        let f = Filter::parse("LOG0 = 'UserAccounts'").unwrap();
        assert!(f.matches(&tags(&[("LOG0", "UserAccounts")])));
        assert!(!f.matches(&tags(&[("LOG0", "Other")])));
        assert!(!f.matches(&tags(&[])));
    }

    #[test]
    fn test_conjunction() {
        let f = Filter::parse("EventType = 'LogEvent' AND Address = '0xabc'").unwrap();
        assert!(f.matches(&tags(&[("EventType", "LogEvent"), ("Address", "0xabc")])));
        assert!(!f.matches(&tags(&[("EventType", "LogEvent")])));
    }

    #[test]
    fn test_not_equal_requires_tag() {
        let f = Filter::parse("EventType != 'CallEvent'").unwrap();
        assert!(f.matches(&tags(&[("EventType", "LogEvent")])));
        assert!(!f.matches(&tags(&[("EventType", "CallEvent")])));
        assert!(!f.matches(&tags(&[])));
    }

    #[test]
    fn test_contains() {
        let f = Filter::parse("Log1Text CONTAINS 'EVENT'").unwrap();
        assert!(f.matches(&tags(&[("Log1Text", "AN_EVENT_TEST")])));
        assert!(!f.matches(&tags(&[("Log1Text", "nothing")])));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let f = Filter::parse("").unwrap();
        assert!(f.matches(&tags(&[])));
        assert!(f.matches(&tags(&[("anything", "at all")])));
    }

    #[test]
    fn test_value_with_spaces() {
        let f = Filter::parse("Name = 'two words'").unwrap();
        assert!(f.matches(&tags(&[("Name", "two words")])));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Filter::parse("LOG0 = 'unterminated").is_err());
        assert!(Filter::parse("LOG0 ! 'x'").is_err());
        assert!(Filter::parse("LOG0 = 'a' OR LOG1 = 'b'").is_err());
        assert!(Filter::parse("= 'a'").is_err());
    }
}
