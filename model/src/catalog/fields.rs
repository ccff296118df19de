//! Accessors for the loosely structured paper JSON.
//!
//! Papers were produced by several generations of scraping scripts, so the same concept can live
//! under different keys (`id` or `qid`, `title` or `stem`, ...) and with different JSON types
//! (question IDs are sometimes numbers). These helpers give the rest of the crate one consistent
//! view.

use serde_json::{Number, Value};

/// Whether a value should count as "present".
///
/// `null`, `false`, zero, and empty strings, arrays and objects are all absent.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// The first present value among `keys`.
pub fn first<'a>(object: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| object.get(key))
        .find(|value| truthy(value))
}

/// Interpret an identifier, which may be a string or a number, as a string.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Does `question` have the identifier `id` (under either `id` or `qid`)?
pub fn has_id(question: &Value, id: &str) -> bool {
    ["id", "qid"].iter().any(|key| {
        question
            .get(key)
            .and_then(id_string)
            .is_some_and(|qid| qid == id)
    })
}

/// Interpret a score, which may be an integer, a float or a numeric string.
///
/// The number is kept as written, so half points survive. Zero and negative scores count as
/// absent, since a question worth nothing is always a scraping error.
pub fn score(value: &Value) -> Option<Number> {
    let score = match value {
        Value::Number(n) => n.clone(),
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<u64>() {
                Ok(n) => n.into(),
                Err(_) => Number::from_f64(s.parse().ok()?)?,
            }
        }
        _ => return None,
    };
    (score.as_f64()? > 0.0).then_some(score)
}

/// Parse a run of decimal digits, which in scraped or generated Chinese text may be fullwidth.
pub fn digits(text: &str) -> Option<u64> {
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from_digit(c as u32 - '０' as u32, 10),
            c => Some(c),
        })
        .collect::<Option<String>>()?
        .parse()
        .ok()
}

/// The materials or questions of a paper, skipping entries that are not objects.
pub fn objects<'a>(paper: &'a Value, key: &str) -> impl Iterator<Item = &'a Value> {
    paper
        .get(key)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|value| value.is_object())
}

/// The material IDs a question refers to, under `materialIds` or `material_ids`.
///
/// A single ID is accepted in place of a list.
pub fn material_ids(question: &Value) -> Vec<String> {
    match first(question, &["materialIds", "material_ids"]) {
        Some(Value::Array(ids)) => ids.iter().filter_map(id_string).collect(),
        Some(id) => id_string(id).into_iter().collect(),
        None => vec![],
    }
}

/// Is this an essay question?
pub fn is_essay(question: &Value) -> bool {
    question
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|ty| ty.eq_ignore_ascii_case("essay"))
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthy() {
        for value in [json!(null), json!(false), json!(0), json!(""), json!([]), json!({})] {
            assert!(!truthy(&value), "{value}");
        }
        for value in [json!(true), json!(1), json!("a"), json!([0]), json!({"a": 0})] {
            assert!(truthy(&value), "{value}");
        }
    }

    #[test]
    fn test_first_skips_empty_fields() {
        let q = json!({"title": "", "question": "概括问题", "stem": "ignored"});
        assert_eq!(
            first(&q, &["title", "question", "stem"]),
            Some(&json!("概括问题"))
        );
        assert_eq!(first(&q, &["text"]), None);
    }

    #[test]
    fn test_has_id_matches_numbers() {
        assert!(has_id(&json!({"id": 3}), "3"));
        assert!(has_id(&json!({"qid": "q2"}), "q2"));
        assert!(!has_id(&json!({"id": "q1"}), "q2"));
    }

    #[test]
    fn test_score() {
        assert_eq!(score(&json!(20)), Some(20.into()));
        assert_eq!(score(&json!(12.5)).and_then(|n| n.as_f64()), Some(12.5));
        assert_eq!(score(&json!("15")), Some(15.into()));
        assert_eq!(score(&json!(" 7.5 ")).and_then(|n| n.as_f64()), Some(7.5));
        assert_eq!(score(&json!(0)), None);
        assert_eq!(score(&json!(-3)), None);
        assert_eq!(score(&json!("abc")), None);
        assert_eq!(score(&json!(null)), None);
    }

    #[test]
    fn test_digits() {
        assert_eq!(digits("15"), Some(15));
        assert_eq!(digits("１５"), Some(15));
        assert_eq!(digits("2０"), Some(20));
        assert_eq!(digits("1a"), None);
        assert_eq!(digits(""), None);
    }

    #[test]
    fn test_material_ids() {
        assert_eq!(
            material_ids(&json!({"materialIds": ["m1", 2]})),
            vec!["m1".to_string(), "2".to_string()]
        );
        assert_eq!(material_ids(&json!({"material_ids": "m3"})), vec!["m3"]);
        assert!(material_ids(&json!({"materialIds": []})).is_empty());
    }
}
