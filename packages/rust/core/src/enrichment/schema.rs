//! Parsing and validation of enrichment responses.
//!
//! The response is untrusted. A body that does not contain an `items` array
//! rejects the whole batch; otherwise each requested item is judged only by
//! its own entry.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;

use dailybrief_shared::{Argument, EnrichedVersion, Keyword, Language, Level, QuizQuestion};

/// Why a payload (or part of one) was rejected, and the text that was judged.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub reason: String,
    pub payload: String,
}

impl Rejection {
    fn new(reason: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            payload: payload.into(),
        }
    }
}

/// Per-item validation result, in request order.
pub type ItemResult = (i64, Result<Vec<EnrichedVersion>, Rejection>);

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(default)]
    versions: Vec<RawVersion>,
}

#[derive(Debug, Deserialize)]
struct RawVersion {
    level: Level,
    language: Language,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    keywords: Vec<Keyword>,
    #[serde(default)]
    questions: Vec<QuizQuestion>,
    background: Option<String>,
    arguments: Option<Vec<Argument>>,
}

/// Remove a surrounding Markdown code fence, if any.
pub fn strip_code_fences(body: &str) -> &str {
    let trimmed = body.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening line.
    let rest = rest.split_once('\n').map(|(_, r)| r).unwrap_or("");
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Split a batch response into per-item results.
pub fn parse_batch(
    body: &str,
    item_ids: &[i64],
    groups: &[(Level, Language)],
) -> Result<Vec<ItemResult>, Rejection> {
    let json = strip_code_fences(body);
    let value: Value = serde_json::from_str(json)
        .map_err(|e| Rejection::new(format!("response is not valid JSON: {e}"), body))?;
    let Some(entries) = value.get("items").and_then(Value::as_array) else {
        return Err(Rejection::new("response has no `items` array", body));
    };

    let results = item_ids
        .iter()
        .map(|&id| {
            let mut matching = entries
                .iter()
                .filter(|e| e.get("item_id").and_then(Value::as_i64) == Some(id));
            let result = match (matching.next(), matching.next()) {
                (None, _) => Err(Rejection::new(
                    format!("item {id} missing from response"),
                    body,
                )),
                (Some(_), Some(_)) => Err(Rejection::new(
                    format!("item {id} appears more than once"),
                    body,
                )),
                (Some(entry), None) => parse_item(entry, groups),
            };
            (id, result)
        })
        .collect();
    Ok(results)
}

fn parse_item(entry: &Value, groups: &[(Level, Language)]) -> Result<Vec<EnrichedVersion>, Rejection> {
    let payload = entry.to_string();
    let raw: RawItem = serde_json::from_value(entry.clone())
        .map_err(|e| Rejection::new(format!("malformed item: {e}"), payload.as_str()))?;
    validate_versions(raw.versions, groups).map_err(|reason| Rejection::new(reason, payload))
}

/// Check every requested group is present exactly once and well-formed.
///
/// Groups that were not requested are ignored. Output follows `groups` order.
fn validate_versions(
    raw: Vec<RawVersion>,
    groups: &[(Level, Language)],
) -> Result<Vec<EnrichedVersion>, String> {
    let mut found: Vec<Option<EnrichedVersion>> = vec![None; groups.len()];

    for version in raw {
        let key = (version.level, version.language);
        let Some(slot) = groups.iter().position(|g| *g == key) else {
            continue;
        };
        let label = format!("{}/{}", key.0.as_str(), key.1.as_str());
        if found[slot].is_some() {
            return Err(format!("{label}: group appears more than once"));
        }
        found[slot] = Some(validate_version(version).map_err(|e| format!("{label}: {e}"))?);
    }

    groups
        .iter()
        .zip(found)
        .map(|((level, language), v)| {
            v.ok_or_else(|| format!("{}/{}: group missing", level.as_str(), language.as_str()))
        })
        .collect()
}

fn validate_version(raw: RawVersion) -> Result<EnrichedVersion, String> {
    let summary = raw.summary.trim().to_string();
    if summary.is_empty() {
        return Err("summary is empty".into());
    }

    if raw.keywords.is_empty() {
        return Err("no keywords".into());
    }
    let keywords = raw
        .keywords
        .into_iter()
        .map(|k| {
            let term = k.term.trim().to_string();
            let explanation = k.explanation.trim().to_string();
            if term.is_empty() || explanation.is_empty() {
                Err("keyword with empty term or explanation".to_string())
            } else {
                Ok(Keyword { term, explanation })
            }
        })
        .collect::<Result<Vec<_>, _>>()?;

    if raw.questions.is_empty() {
        return Err("no questions".into());
    }
    let questions = raw
        .questions
        .into_iter()
        .map(validate_question)
        .collect::<Result<Vec<_>, _>>()?;

    let background = match raw.background {
        Some(b) if b.trim().is_empty() => return Err("background present but empty".into()),
        Some(b) => Some(b.trim().to_string()),
        None => None,
    };

    let arguments = match raw.arguments {
        None => Vec::new(),
        Some(args) if args.is_empty() => return Err("arguments present but empty".into()),
        Some(args) => args
            .into_iter()
            .map(|a| {
                let (pro, con) = (a.pro.trim().to_string(), a.con.trim().to_string());
                if pro.is_empty() || con.is_empty() {
                    Err("argument with empty side".to_string())
                } else {
                    Ok(Argument { pro, con })
                }
            })
            .collect::<Result<Vec<_>, _>>()?,
    };

    Ok(EnrichedVersion {
        level: raw.level,
        language: raw.language,
        summary,
        keywords,
        questions,
        background,
        arguments,
    })
}

fn validate_question(q: QuizQuestion) -> Result<QuizQuestion, String> {
    let question = q.question.trim().to_string();
    if question.is_empty() {
        return Err("question text is empty".into());
    }
    let options: Vec<String> = q.options.iter().map(|o| o.trim().to_string()).collect();
    if options.iter().any(String::is_empty) {
        return Err(format!("question '{question}' has an empty option"));
    }
    let distinct: HashSet<&str> = options.iter().map(String::as_str).collect();
    if distinct.len() < 2 {
        return Err(format!("question '{question}' needs at least two distinct options"));
    }
    let answer = q.answer.trim().to_string();
    if !options.contains(&answer) {
        return Err(format!("question '{question}' answer is not among its options"));
    }
    Ok(QuizQuestion {
        question,
        options,
        answer,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    /// A well-formed version object for one group.
    pub(crate) fn version_json(level: Level, language: Language) -> Value {
        let mut v = json!({
            "level": level.as_str(),
            "language": language.as_str(),
            "summary": format!("Summary {}/{}", level.as_str(), language.as_str()),
            "keywords": [{"term": "ceasefire", "explanation": "an agreement to stop fighting"}],
            "questions": [{
                "question": "What was agreed?",
                "options": ["A ceasefire", "A merger", "A holiday"],
                "answer": "A ceasefire"
            }]
        });
        if level == Level::Hard {
            v["background"] = json!("Talks began last year.");
            v["arguments"] = json!([{"pro": "Saves lives", "con": "May not hold"}]);
        }
        v
    }

    /// A full valid response body for the given items and groups.
    pub(crate) fn response_json(item_ids: &[i64], groups: &[(Level, Language)]) -> String {
        let items: Vec<Value> = item_ids
            .iter()
            .map(|id| {
                json!({
                    "item_id": id,
                    "versions": groups.iter().map(|(l, g)| version_json(*l, *g)).collect::<Vec<_>>()
                })
            })
            .collect();
        json!({ "items": items }).to_string()
    }

    const GROUPS: [(Level, Language); 2] = [(Level::Easy, Language::En), (Level::Hard, Language::Zh)];

    #[test]
    fn accepts_valid_batch() {
        let body = response_json(&[1, 2], &GROUPS);
        let results = parse_batch(&body, &[1, 2], &GROUPS).unwrap();
        assert_eq!(results.len(), 2);
        for (_, result) in &results {
            let versions = result.as_ref().unwrap();
            assert_eq!(versions.len(), 2);
            assert_eq!(versions[1].background.as_deref(), Some("Talks began last year."));
            assert_eq!(versions[1].arguments.len(), 1);
        }
    }

    #[test]
    fn strips_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn unparseable_body_rejects_batch() {
        assert!(parse_batch("not json", &[1], &GROUPS).is_err());
        let err = parse_batch(r#"{"results": []}"#, &[1], &GROUPS).unwrap_err();
        assert!(err.reason.contains("items"));
    }

    #[test]
    fn items_are_judged_independently() {
        let mut body: Value = serde_json::from_str(&response_json(&[1, 2], &GROUPS)).unwrap();
        body["items"][1]["versions"][0]["summary"] = json!("   ");
        let results = parse_batch(&body.to_string(), &[1, 2, 3], &GROUPS).unwrap();

        assert!(results[0].1.is_ok());
        let rejection = results[1].1.as_ref().unwrap_err();
        assert!(rejection.reason.contains("summary is empty"));
        assert!(rejection.payload.contains("\"item_id\":2"));
        assert!(results[2].1.as_ref().unwrap_err().reason.contains("missing"));
    }

    #[test]
    fn missing_group_is_rejected() {
        let body = response_json(&[1], &GROUPS[..1]);
        let results = parse_batch(&body, &[1], &GROUPS).unwrap();
        let reason = &results[0].1.as_ref().unwrap_err().reason;
        assert!(reason.contains("hard/zh: group missing"));
    }

    #[test]
    fn duplicate_group_is_rejected() {
        let body = json!({"items": [{"item_id": 1, "versions": [
            version_json(Level::Easy, Language::En),
            version_json(Level::Easy, Language::En),
        ]}]});
        let results = parse_batch(&body.to_string(), &[1], &GROUPS[..1]).unwrap();
        assert!(results[0].1.as_ref().unwrap_err().reason.contains("more than once"));
    }

    #[test]
    fn unrequested_groups_are_ignored() {
        let body = json!({"items": [{"item_id": 1, "versions": [
            version_json(Level::Easy, Language::En),
            version_json(Level::Mid, Language::Zh),
        ]}]});
        let results = parse_batch(&body.to_string(), &[1], &GROUPS[..1]).unwrap();
        assert_eq!(results[0].1.as_ref().unwrap().len(), 1);
    }

    fn reason_for(mutate: impl FnOnce(&mut Value)) -> String {
        let mut version = version_json(Level::Hard, Language::En);
        mutate(&mut version);
        let body = json!({"items": [{"item_id": 7, "versions": [version]}]});
        let groups = [(Level::Hard, Language::En)];
        parse_batch(&body.to_string(), &[7], &groups).unwrap()[0]
            .1
            .as_ref()
            .unwrap_err()
            .reason
            .clone()
    }

    #[test]
    fn field_rules() {
        assert!(reason_for(|v| v["keywords"] = json!([])).contains("no keywords"));
        assert!(
            reason_for(|v| v["keywords"] = json!([{"term": "x", "explanation": ""}]))
                .contains("empty term or explanation")
        );
        assert!(reason_for(|v| v["questions"] = json!([])).contains("no questions"));
        assert!(
            reason_for(|v| v["questions"][0]["options"] = json!(["Same", "Same"]))
                .contains("two distinct options")
        );
        assert!(
            reason_for(|v| v["questions"][0]["answer"] = json!("Elsewhere"))
                .contains("not among its options")
        );
        assert!(reason_for(|v| v["background"] = json!(" ")).contains("background"));
        assert!(reason_for(|v| v["arguments"] = json!([])).contains("arguments"));
        assert!(reason_for(|v| v["level"] = json!("expert")).contains("malformed"));
    }
}
