//! Prompt construction for enrichment batches.

use serde_json::json;

use dailybrief_shared::{EnrichmentConfig, WorkItem};

use super::client::ChatMessage;

/// Build the system and user messages for one batch of items.
///
/// The user message is a JSON document listing each item with its id, so
/// the response can be matched back per item.
pub fn build_messages(items: &[WorkItem], config: &EnrichmentConfig) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt(config)),
        ChatMessage::user(user_payload(items, config.max_body_chars)),
    ]
}

fn system_prompt(config: &EnrichmentConfig) -> String {
    let groups: Vec<String> = config
        .combinations()
        .iter()
        .map(|(level, language)| format!("{}/{}", level.as_str(), language.as_str()))
        .collect();
    let context_levels: Vec<&str> = config.context_levels.iter().map(|l| l.as_str()).collect();

    format!(
        "You turn news articles into learning material for language learners.\n\
         For every article produce one version per requested level/language group: {groups}.\n\
         Levels: easy uses short sentences and common words; mid is standard news prose; \
         hard keeps full nuance. Language codes: en = English, zh = Simplified Chinese.\n\
         Each version has: a summary; keywords (term + explanation); \
         multiple-choice questions (question, at least two distinct options, \
         answer copied exactly from the options).\n\
         For levels {context} also add a short background paragraph and \
         a list of arguments, each with a pro and a con.\n\
         Reply with JSON only, shaped as:\n\
         {{\"items\": [{{\"item_id\": <id>, \"versions\": [{{\"level\": \"easy\", \
         \"language\": \"en\", \"summary\": \"...\", \
         \"keywords\": [{{\"term\": \"...\", \"explanation\": \"...\"}}], \
         \"questions\": [{{\"question\": \"...\", \"options\": [\"...\"], \"answer\": \"...\"}}], \
         \"background\": \"...\", \"arguments\": [{{\"pro\": \"...\", \"con\": \"...\"}}]}}]}}]}}\n\
         Return every article exactly once, using its item_id.",
        groups = groups.join(", "),
        context = context_levels.join(", "),
    )
}

fn user_payload(items: &[WorkItem], max_body_chars: usize) -> String {
    let articles: Vec<serde_json::Value> = items
        .iter()
        .map(|item| {
            json!({
                "item_id": item.id,
                "title": item.title,
                "body": truncate_chars(&item.body, max_body_chars),
            })
        })
        .collect();
    json!({ "items": articles }).to_string()
}

/// Truncate to at most `max_chars` characters, marking the cut.
fn truncate_chars(content: &str, max_chars: usize) -> String {
    match content.char_indices().nth(max_chars) {
        None => content.to_string(),
        Some((cut, _)) => format!("{} [truncated]", &content[..cut]),
    }
}
