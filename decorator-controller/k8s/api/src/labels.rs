use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

#[derive(Clone, Debug, Eq, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct Expression {
    key: String,
    operator: Operator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<BTreeSet<String>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A set-based label selector.
///
/// An empty selector matches every label set.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_labels: Option<Map>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    match_expressions: Option<Expressions>,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty requirement in selector {0:?}")]
    EmptyRequirement(String),

    #[error("invalid label key {0:?}")]
    InvalidKey(String),

    #[error("invalid label value {0:?}")]
    InvalidValue(String),

    #[error("malformed set in requirement {0:?}")]
    MalformedSet(String),
}

// === Selector ===

impl Selector {
    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.as_ref().map_or(true, |m| m.is_empty())
            && self.match_expressions.as_ref().map_or(true, |e| e.is_empty())
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_map(labels.as_ref())
    }

    pub fn matches_map(&self, labels: &Map) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels.iter() {
                if labels.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

/// Renders the selector in the textual form accepted by the API server's
/// `labelSelector` list parameter.
impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| {
            if first {
                first = false;
                Ok(())
            } else {
                f.write_str(",")
            }
        };

        for (k, v) in self.match_labels.iter().flatten() {
            sep(f)?;
            write!(f, "{k}={v}")?;
        }

        for Expression {
            key,
            operator,
            values,
        } in self.match_expressions.iter().flatten()
        {
            sep(f)?;
            let values = values
                .iter()
                .flatten()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",");
            match operator {
                Operator::In => write!(f, "{key} in ({values})")?,
                Operator::NotIn => write!(f, "{key} notin ({values})")?,
                Operator::Exists => write!(f, "{key}")?,
                Operator::DoesNotExist => write!(f, "!{key}")?,
            }
        }

        Ok(())
    }
}

/// Parses the kubectl selector syntax, e.g. `app=web,tier in (a,b),!legacy`.
impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut match_labels = Map::new();
        let mut match_expressions = Expressions::new();

        for req in split_requirements(s)? {
            let req = req.trim();
            if req.is_empty() {
                return Err(ParseError::EmptyRequirement(s.to_string()));
            }

            if let Some(key) = req.strip_prefix('!') {
                match_expressions.push(Expression::new(
                    validate_key(key.trim())?,
                    Operator::DoesNotExist,
                    None,
                ));
            } else if let Some((key, value)) = req.split_once("!=") {
                let values = Some(validate_value(value.trim())?).into_iter().collect();
                match_expressions.push(Expression::new(
                    validate_key(key.trim())?,
                    Operator::NotIn,
                    Some(values),
                ));
            } else if let Some((key, value)) = req.split_once('=') {
                let value = value.strip_prefix('=').unwrap_or(value);
                match_labels.insert(validate_key(key.trim())?, validate_value(value.trim())?);
            } else if let Some((key, set)) = split_set_op(req, " notin ") {
                match_expressions.push(Expression::new(
                    validate_key(key)?,
                    Operator::NotIn,
                    Some(parse_set(set)?),
                ));
            } else if let Some((key, set)) = split_set_op(req, " in ") {
                match_expressions.push(Expression::new(
                    validate_key(key)?,
                    Operator::In,
                    Some(parse_set(set)?),
                ));
            } else {
                match_expressions.push(Expression::new(validate_key(req)?, Operator::Exists, None));
            }
        }

        Ok(Self {
            match_labels: (!match_labels.is_empty()).then_some(match_labels),
            match_expressions: (!match_expressions.is_empty()).then_some(match_expressions),
        })
    }
}

/// Splits on commas that are not enclosed in a `( ... )` set.
fn split_requirements(s: &str) -> Result<Vec<&str>, ParseError> {
    if s.trim().is_empty() {
        return Ok(vec![]);
    }

    let mut reqs = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| ParseError::MalformedSet(s.to_string()))?
            }
            ',' if depth == 0 => {
                reqs.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(ParseError::MalformedSet(s.to_string()));
    }
    reqs.push(&s[start..]);
    Ok(reqs)
}

fn split_set_op<'a>(req: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, set) = req.split_once(op)?;
    Some((key.trim(), set.trim()))
}

fn parse_set(set: &str) -> Result<BTreeSet<String>, ParseError> {
    let inner = set
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| ParseError::MalformedSet(set.to_string()))?;
    inner
        .split(',')
        .map(|v| validate_value(v.trim()))
        .collect()
}

fn validate_key(key: &str) -> Result<String, ParseError> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    let prefix_ok = prefix.map_or(true, |p| {
        !p.is_empty()
            && p.len() <= 253
            && p.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    });
    if !prefix_ok || name.is_empty() || !is_label_token(name) {
        return Err(ParseError::InvalidKey(key.to_string()));
    }
    Ok(key.to_string())
}

fn validate_value(value: &str) -> Result<String, ParseError> {
    if value.is_empty() || is_label_token(value) {
        return Ok(value.to_string());
    }
    Err(ParseError::InvalidValue(value.to_string()))
}

fn is_label_token(s: &str) -> bool {
    let alnum = |c: char| c.is_ascii_alphanumeric();
    s.len() <= 63
        && s.starts_with(alnum)
        && s.ends_with(alnum)
        && s.chars()
            .all(|c| alnum(c) || c == '-' || c == '_' || c == '.')
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === Labels ===

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl<T: AsRef<Map>> std::cmp::PartialEq<T> for Labels {
    #[inline]
    fn eq(&self, t: &T) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === Expression ===

impl Expression {
    pub fn new(key: impl Into<String>, operator: Operator, values: Option<BTreeSet<String>>) -> Self {
        Self {
            key: key.into(),
            operator,
            values,
        }
    }

    fn matches(&self, labels: &Map) -> bool {
        let contains = |v: &String| self.values.as_ref().is_some_and(|vs| vs.contains(v));
        match self.operator {
            Operator::In => labels.get(&self.key).is_some_and(contains),
            Operator::NotIn => !labels.get(&self.key).is_some_and(contains),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn test_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("foo", "bar"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                Labels::from_iter(Some(("baz", "caz"))),
                false,
                "missing label",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::In,
                    Some(Some("bar".to_string()).into_iter().collect()),
                ))),
                Labels::from_iter(vec![("foo", "bar"), ("bah", "baz")]),
                true,
                "expression match",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::NotIn,
                    Some(Some("bar".to_string()).into_iter().collect()),
                ))),
                Labels::from_iter(vec![("foo", "bar")]),
                false,
                "notin excludes listed value",
            ),
            (
                Selector::from_iter(Some(Expression::new(
                    "foo",
                    Operator::NotIn,
                    Some(Some("bar".to_string()).into_iter().collect()),
                ))),
                Labels::default(),
                true,
                "notin matches absent key",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::Exists, None))),
                Labels::from_iter(vec![("foo", "")]),
                true,
                "exists",
            ),
            (
                Selector::from_iter(Some(Expression::new("foo", Operator::DoesNotExist, None))),
                Labels::from_iter(vec![("foo", "bar")]),
                false,
                "does not exist",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn parses_kubectl_syntax() {
        let sel = "foo=bar,env in (prod, staging),tier notin (db),canary,!legacy,x!=y"
            .parse::<Selector>()
            .expect("selector must parse");

        assert!(sel.matches(&Labels::from_iter(vec![
            ("foo", "bar"),
            ("env", "prod"),
            ("tier", "web"),
            ("canary", "true"),
        ])));
        assert!(!sel.matches(&Labels::from_iter(vec![
            ("foo", "bar"),
            ("env", "prod"),
            ("canary", "true"),
            ("legacy", "true"),
        ])));
        assert!(!sel.matches(&Labels::from_iter(vec![
            ("foo", "bar"),
            ("env", "prod"),
            ("canary", "true"),
            ("x", "y"),
        ])));
    }

    #[test]
    fn double_equals() {
        let sel = "foo==bar".parse::<Selector>().unwrap();
        assert_eq!(sel, Selector::from_iter(Some(("foo", "bar"))));
    }

    #[test]
    fn empty_string_is_empty_selector() {
        let sel = "".parse::<Selector>().unwrap();
        assert!(sel.is_empty());
        assert!(sel.matches(&Labels::from_iter(Some(("baz", "caz")))));
    }

    #[test]
    fn rejects_invalid() {
        for s in ["foo=bar,", "foo in (a,b", "in (a)", "foo=b@r", "-foo=bar", "a/b/c=d"] {
            assert!(s.parse::<Selector>().is_err(), "{s:?} must not parse");
        }
    }

    #[test]
    fn renders_round_trippable_text() {
        let text = "foo=bar,env in (prod,staging),!legacy";
        let sel = text.parse::<Selector>().unwrap();
        assert_eq!(sel.to_string(), text);
        assert_eq!(sel.to_string().parse::<Selector>().unwrap(), sel);
    }

    #[test]
    fn deserializes_standard_shape() {
        let sel: Selector = serde_json::from_value(serde_json::json!({
            "matchLabels": {"test": "test-target"},
            "matchExpressions": [{"key": "tier", "operator": "Exists"}],
        }))
        .unwrap();
        assert!(sel.matches(&Labels::from_iter(vec![
            ("test", "test-target"),
            ("tier", "web"),
        ])));
        assert!(!sel.matches(&Labels::from_iter(Some(("test", "test-target")))));
    }
}
