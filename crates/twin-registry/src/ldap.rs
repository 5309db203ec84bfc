//! LDAP-style filter expressions over provider attributes, e.g.
//! `(&(name=Foo*)(|(services=data)(!(location=0:0))))`.

use std::str::FromStr;

use twin_protocol::{GatewayError, GatewayResult};

/// Deepest nesting of `(...)` groups a filter may use.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LdapFilter {
    And(Vec<LdapFilter>),
    Or(Vec<LdapFilter>),
    Not(Box<LdapFilter>),
    Present(String),
    Equal { attribute: String, pattern: String },
    Approx { attribute: String, value: String },
    GreaterOrEqual { attribute: String, value: String },
    LessOrEqual { attribute: String, value: String },
}

impl LdapFilter {
    pub fn parse(input: &str) -> GatewayResult<Self> {
        let mut parser = Parser {
            input,
            chars: input.char_indices().collect(),
            position: 0,
            depth: 0,
        };
        parser.skip_whitespace();
        let filter = parser.filter()?;
        parser.skip_whitespace();
        if parser.position != parser.chars.len() {
            return Err(parser.error("trailing characters"));
        }
        Ok(filter)
    }

    /// `(&(self)(other))`, flattening nested conjunctions.
    pub fn and(self, other: LdapFilter) -> Self {
        match self {
            Self::And(mut items) => {
                items.push(other);
                Self::And(items)
            }
            filter => Self::And(vec![filter, other]),
        }
    }

    /// Evaluate against an attribute source returning every value of the
    /// named attribute (empty when absent).
    pub fn matches(&self, values: &dyn Fn(&str) -> Vec<String>) -> bool {
        match self {
            Self::And(items) => items.iter().all(|item| item.matches(values)),
            Self::Or(items) => items.iter().any(|item| item.matches(values)),
            Self::Not(item) => !item.matches(values),
            Self::Present(attribute) => !values(attribute).is_empty(),
            Self::Equal { attribute, pattern } => values(attribute)
                .iter()
                .any(|candidate| wildcard_match(pattern, candidate)),
            Self::Approx { attribute, value } => {
                let wanted = normalize(value);
                values(attribute)
                    .iter()
                    .any(|candidate| normalize(candidate) == wanted)
            }
            Self::GreaterOrEqual { attribute, value } => values(attribute)
                .iter()
                .any(|candidate| compare(candidate, value) != std::cmp::Ordering::Less),
            Self::LessOrEqual { attribute, value } => values(attribute)
                .iter()
                .any(|candidate| compare(candidate, value) != std::cmp::Ordering::Greater),
        }
    }
}

impl FromStr for LdapFilter {
    type Err = GatewayError;

    fn from_str(input: &str) -> GatewayResult<Self> {
        Self::parse(input)
    }
}

fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn compare(candidate: &str, value: &str) -> std::cmp::Ordering {
    match (candidate.trim().parse::<f64>(), value.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        _ => candidate.cmp(value),
    }
}

/// Glob match where `*` stands for any run of characters.
fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == candidate;
    }
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut rest = candidate;
    let last = parts.len() - 1;
    for (index, part) in parts.iter().enumerate() {
        if index == 0 {
            match rest.strip_prefix(part) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if index == last {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(found) => rest = &rest[found + part.len()..],
                None => return false,
            }
        }
    }
    true
}

struct Parser<'a> {
    input: &'a str,
    chars: Vec<(usize, char)>,
    position: usize,
    depth: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> GatewayError {
        GatewayError::InvalidFilter {
            filter: self.input.to_owned(),
            reason: format!("{reason} at position {}", self.position),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).map(|(_, c)| *c)
    }

    fn bump(&mut self) -> Option<char> {
        let next = self.peek();
        if next.is_some() {
            self.position += 1;
        }
        next
    }

    fn expect(&mut self, wanted: char) -> GatewayResult<()> {
        match self.bump() {
            Some(c) if c == wanted => Ok(()),
            _ => Err(self.error(&format!("expected '{wanted}'"))),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn filter(&mut self) -> GatewayResult<LdapFilter> {
        if self.depth == MAX_DEPTH {
            return Err(self.error(&format!("nesting deeper than {MAX_DEPTH}")));
        }
        self.depth += 1;
        let filter = self.group();
        self.depth -= 1;
        filter
    }

    fn group(&mut self) -> GatewayResult<LdapFilter> {
        self.expect('(')?;
        self.skip_whitespace();
        let filter = match self.peek() {
            Some('&') => {
                self.bump();
                LdapFilter::And(self.list()?)
            }
            Some('|') => {
                self.bump();
                LdapFilter::Or(self.list()?)
            }
            Some('!') => {
                self.bump();
                self.skip_whitespace();
                LdapFilter::Not(Box::new(self.filter()?))
            }
            Some(_) => self.item()?,
            None => return Err(self.error("unexpected end")),
        };
        self.skip_whitespace();
        self.expect(')')?;
        Ok(filter)
    }

    fn list(&mut self) -> GatewayResult<Vec<LdapFilter>> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('(') => items.push(self.filter()?),
                _ => break,
            }
        }
        if items.is_empty() {
            return Err(self.error("empty filter list"));
        }
        Ok(items)
    }

    fn item(&mut self) -> GatewayResult<LdapFilter> {
        let mut attribute = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, '=' | '<' | '>' | '~' | '(' | ')') {
                break;
            }
            attribute.push(c);
            self.position += 1;
        }
        let attribute = attribute.trim().to_owned();
        if attribute.is_empty() {
            return Err(self.error("missing attribute"));
        }

        let operator = match self.bump() {
            Some('=') => '=',
            Some(c @ ('<' | '>' | '~')) => {
                self.expect('=')?;
                c
            }
            _ => return Err(self.error("missing operator")),
        };

        let mut value = String::new();
        while let Some(c) = self.peek() {
            match c {
                ')' => break,
                '(' => return Err(self.error("unescaped '('")),
                '\\' => {
                    self.position += 1;
                    match self.bump() {
                        Some(escaped) => value.push(escaped),
                        None => return Err(self.error("dangling escape")),
                    }
                }
                _ => {
                    value.push(c);
                    self.position += 1;
                }
            }
        }

        Ok(match operator {
            '=' if value == "*" => LdapFilter::Present(attribute),
            '=' => LdapFilter::Equal {
                attribute,
                pattern: value,
            },
            '~' => LdapFilter::Approx { attribute, value },
            '>' => LdapFilter::GreaterOrEqual { attribute, value },
            _ => LdapFilter::LessOrEqual { attribute, value },
        })
    }
}
