use crate::errors::ControllerError;
use kube::core::{Expression, Selector};
use std::collections::BTreeSet;

/// Parse a label selector in the `kubectl --selector` syntax, e.g.
/// `app=web,tier in (frontend,backend),!canary`.
pub(crate) fn parse_label_selector(input: &str) -> Result<Selector, ControllerError> {
    split_terms(input)?
        .into_iter()
        .map(parse_term)
        .collect()
}

fn invalid(input: &str) -> ControllerError {
    ControllerError::Configuration(format!("invalid label selector {:?}", input))
}

/// Split on commas outside of parentheses.
fn split_terms(input: &str) -> Result<Vec<&str>, ControllerError> {
    let mut terms = Vec::new();
    let (mut depth, mut start) = (0usize, 0usize);
    for (i, c) in input.char_indices() {
        match c {
            '(' if depth == 0 => depth += 1,
            ')' if depth == 1 => depth -= 1,
            '(' | ')' => return Err(invalid(input)),
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(invalid(input));
    }
    terms.push(&input[start..]);
    Ok(terms)
}

fn token(value: &str, allow_empty: bool) -> Option<String> {
    let value = value.trim();
    let valid = (allow_empty || !value.is_empty())
        && !value
            .chars()
            .any(|c| c.is_whitespace() || "=!(),".contains(c));
    valid.then(|| value.to_string())
}

fn parse_term(term: &str) -> Result<Expression, ControllerError> {
    let term = term.trim();
    let key = |k: &str| token(k, false).ok_or_else(|| invalid(term));
    let value = |v: &str| token(v, true).ok_or_else(|| invalid(term));

    if let Some((head, values)) = term.split_once('(') {
        let values = values.strip_suffix(')').ok_or_else(|| invalid(term))?;
        let values = values
            .split(',')
            .map(value)
            .collect::<Result<BTreeSet<String>, _>>()?;
        let head = head.trim_end();
        return if let Some(k) = head.strip_suffix(" notin") {
            Ok(Expression::NotIn(key(k)?, values))
        } else if let Some(k) = head.strip_suffix(" in") {
            Ok(Expression::In(key(k)?, values))
        } else {
            Err(invalid(term))
        };
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Ok(Expression::NotEqual(key(k)?, value(v)?));
    }
    if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
        return Ok(Expression::Equal(key(k)?, value(v)?));
    }
    match term.strip_prefix('!') {
        Some(k) => Ok(Expression::DoesNotExist(key(k)?)),
        None => Ok(Expression::Exists(key(term)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::SelectorExt;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_all_operators() {
        let selector =
            parse_label_selector("app=web, tier in (frontend, backend),env!=dev,team,!canary")
                .unwrap();
        let expected: Selector = vec![
            Expression::Equal("app".into(), "web".into()),
            Expression::In(
                "tier".into(),
                ["backend".to_string(), "frontend".to_string()].into(),
            ),
            Expression::NotEqual("env".into(), "dev".into()),
            Expression::Exists("team".into()),
            Expression::DoesNotExist("canary".into()),
        ]
        .into_iter()
        .collect();
        assert_eq!(expected, selector);

        let selector = parse_label_selector("app==web,tier notin (batch)").unwrap();
        assert!(selector.matches(&labels(&[("app", "web"), ("tier", "frontend")])));
        assert!(!selector.matches(&labels(&[("app", "web"), ("tier", "batch")])));
        assert!(!selector.matches(&labels(&[("tier", "frontend")])));
    }

    #[test]
    fn rejects_malformed_selectors() {
        for input in [
            "",
            "app=web,",
            "=web",
            "app in (web",
            "app in web)",
            "app within (web)",
            "app in ((web))",
            "app name=web",
            "!",
        ] {
            assert!(
                matches!(
                    parse_label_selector(input),
                    Err(ControllerError::Configuration(_))
                ),
                "{input:?} must be rejected"
            );
        }
    }
}
