use crate::domain::{ConversationMessage, MessageKind};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Rebuild the conversation order from the flat entry log.
///
/// Entries form a parent/child chain via `parentUuid`. Output is a pre-order
/// depth-first traversal starting at the roots (entries with no parent, or
/// whose parent never appears), with siblings ordered by ascending
/// timestamp. Entries unreachable from any root are appended at the end,
/// timestamp-sorted. Every input entry appears exactly once.
pub fn reconstruct_chain(messages: Vec<ConversationMessage>) -> Vec<ConversationMessage> {
    if messages.len() <= 1 {
        return messages;
    }

    let uuids: HashSet<&str> = messages.iter().map(|m| m.uuid.as_str()).collect();

    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut roots: Vec<usize> = Vec::new();
    for (idx, message) in messages.iter().enumerate() {
        match message.parent_uuid.as_deref() {
            Some(parent) if uuids.contains(parent) && parent != message.uuid => {
                children.entry(parent).or_default().push(idx);
            }
            _ => roots.push(idx),
        }
    }

    let by_timestamp =
        |a: &usize, b: &usize| messages[*a].timestamp.cmp(&messages[*b].timestamp);
    roots.sort_by(by_timestamp);
    for siblings in children.values_mut() {
        siblings.sort_by(by_timestamp);
    }

    let mut visited: HashSet<usize> = HashSet::new();
    let mut order: Vec<usize> = Vec::with_capacity(messages.len());
    let mut stack: Vec<usize> = Vec::new();

    for root in roots {
        stack.push(root);
        while let Some(idx) = stack.pop() {
            if !visited.insert(idx) {
                continue;
            }
            order.push(idx);
            if let Some(siblings) = children.get(messages[idx].uuid.as_str()) {
                for child in siblings.iter().rev() {
                    if !visited.contains(child) {
                        stack.push(*child);
                    }
                }
            }
        }
    }

    // Cycle members are the only entries a root walk can miss.
    let mut orphans: Vec<usize> = (0..messages.len())
        .filter(|idx| !visited.contains(idx))
        .collect();
    orphans.sort_by(by_timestamp);
    order.extend(orphans);

    let mut slots: Vec<Option<ConversationMessage>> = messages.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}

/// Drop user entries that only carry tool results back to the assistant.
/// They are log plumbing, not something a person typed.
pub fn filter_visible_messages(messages: Vec<ConversationMessage>) -> Vec<ConversationMessage> {
    messages
        .into_iter()
        .filter(|message| !is_tool_result_only(message))
        .collect()
}

fn is_tool_result_only(message: &ConversationMessage) -> bool {
    if message.kind != MessageKind::User {
        return false;
    }
    let content = message.message.get("content").unwrap_or(&Value::Null);
    let Some(blocks) = content.as_array() else {
        return false;
    };
    !blocks.is_empty()
        && blocks
            .iter()
            .all(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(uuid: &str, parent: Option<&str>, ts: &str) -> ConversationMessage {
        ConversationMessage {
            uuid: uuid.to_string(),
            parent_uuid: parent.map(|p| p.to_string()),
            session_id: "s".to_string(),
            kind: MessageKind::User,
            timestamp: ts.to_string(),
            is_sidechain: false,
            working_directory: None,
            duration_ms: None,
            message: serde_json::json!({"content": "text"}),
        }
    }

    #[test]
    fn orders_branches_by_timestamp() {
        // u1 <- a1, u1 <- a2 (a2 earlier than a1), a1 <- u2.
        let input = vec![
            message("a1", Some("u1"), "2024-01-01T00:00:03Z"),
            message("u1", None, "2024-01-01T00:00:00Z"),
            message("u2", Some("a1"), "2024-01-01T00:00:04Z"),
            message("a2", Some("u1"), "2024-01-01T00:00:01Z"),
        ];
        let chain = reconstruct_chain(input);
        let uuids: Vec<&str> = chain.iter().map(|m| m.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["u1", "a2", "a1", "u2"]);
    }

    #[test]
    fn output_is_a_permutation_with_children_after_parents() {
        let input = vec![
            message("u1", None, "2024-01-01T00:00:00Z"),
            message("a1", Some("u1"), "2024-01-01T00:00:01Z"),
            message("u2", Some("a1"), "2024-01-01T00:00:02Z"),
            message("a2", Some("u2"), "2024-01-01T00:00:03Z"),
            message("u3", Some("a2"), "2024-01-01T00:00:04Z"),
        ];
        let expected: HashSet<String> = input.iter().map(|m| m.uuid.clone()).collect();
        let chain = reconstruct_chain(input);

        let produced: HashSet<String> = chain.iter().map(|m| m.uuid.clone()).collect();
        assert_eq!(produced, expected);
        assert_eq!(chain.len(), expected.len());

        let position: HashMap<&str, usize> = chain
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.uuid.as_str(), idx))
            .collect();
        for entry in &chain {
            if let Some(parent) = entry.parent_uuid.as_deref() {
                assert!(position[parent] < position[entry.uuid.as_str()]);
            }
        }
    }

    #[test]
    fn orphans_are_appended_in_timestamp_order() {
        let input = vec![
            message("u1", None, "2024-01-01T00:00:00Z"),
            message("lost2", Some("missing"), "2024-01-01T00:00:09Z"),
            message("lost1", Some("missing"), "2024-01-01T00:00:05Z"),
        ];
        let chain = reconstruct_chain(input);
        let uuids: Vec<&str> = chain.iter().map(|m| m.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["u1", "lost1", "lost2"]);
    }

    #[test]
    fn cycles_do_not_hang_or_drop_entries() {
        let input = vec![
            message("u1", None, "2024-01-01T00:00:00Z"),
            message("x", Some("y"), "2024-01-01T00:00:01Z"),
            message("y", Some("x"), "2024-01-01T00:00:02Z"),
        ];
        let chain = reconstruct_chain(input);
        assert_eq!(chain.len(), 3);
        let uuids: HashSet<&str> = chain.iter().map(|m| m.uuid.as_str()).collect();
        assert!(uuids.contains("x") && uuids.contains("y"));
    }

    #[test]
    fn filter_drops_pure_tool_result_user_messages() {
        let mut tool_result = message("t1", None, "2024-01-01T00:00:00Z");
        tool_result.message = serde_json::json!({
            "content": [{"type": "tool_result", "tool_use_id": "c1", "content": "ok"}]
        });

        let mut mixed = message("m1", None, "2024-01-01T00:00:01Z");
        mixed.message = serde_json::json!({
            "content": [
                {"type": "tool_result", "tool_use_id": "c2", "content": "ok"},
                {"type": "text", "text": "and a question"},
            ]
        });

        let plain = message("p1", None, "2024-01-01T00:00:02Z");

        let visible = filter_visible_messages(vec![tool_result, mixed, plain]);
        let uuids: Vec<&str> = visible.iter().map(|m| m.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["m1", "p1"]);
    }

    #[test]
    fn assistant_tool_result_shape_is_kept() {
        let mut assistant = message("a1", None, "2024-01-01T00:00:00Z");
        assistant.kind = MessageKind::Assistant;
        assistant.message = serde_json::json!({
            "content": [{"type": "tool_result", "content": "odd but not a user entry"}]
        });
        let visible = filter_visible_messages(vec![assistant]);
        assert_eq!(visible.len(), 1);
    }
}
