//! Plain-text report formatting.

use crate::detect::Delta;
use crate::types::{Entity, EntityId, Group};

const RULE: &str = "----------------------";

/// Direct chat link for an entity.
pub fn chat_link(id: EntityId) -> String {
    format!("tg://user?id={}", id)
}

fn group_names(groups: &[Group]) -> String {
    if groups.is_empty() {
        "none".to_string()
    } else {
        groups
            .iter()
            .map(|g| g.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn shown(value: &str) -> &str {
    if value.is_empty() { "(empty)" } else { value }
}

pub fn format_change(entity: &Entity, groups: &[Group], deltas: &[Delta]) -> String {
    let mut out = String::new();
    out.push_str("Attribute change\n");
    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!("Entity: {} ({})\n", entity.display_name(), entity.id));
    out.push_str(&format!("Groups: {}\n\n", group_names(groups)));
    for delta in deltas {
        out.push_str(&format!(
            "{}: {} -> {}\n",
            delta.attribute.label(),
            shown(&delta.old),
            shown(&delta.new)
        ));
    }
    out.push_str(RULE);
    out
}

pub fn format_left(
    entity_id: EntityId,
    entity: Option<&Entity>,
    group: &Group,
    remaining: &[Group],
) -> String {
    let name = entity
        .map(Entity::display_name)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    let mut out = String::new();
    out.push_str("Left group\n");
    out.push_str(RULE);
    out.push('\n');
    out.push_str(&format!("Entity: {}\n", name));
    out.push_str(&format!("Id: {}\n", entity_id));
    out.push_str(&format!("Left: {}\n", group.name));
    out.push_str(&format!("Chat: {}\n", chat_link(entity_id)));
    if remaining.is_empty() {
        out.push_str("\nNo longer in any monitored group");
    } else {
        out.push_str("\nStill in:");
        for g in remaining {
            out.push_str(&format!("\n- {}", g.name));
        }
    }
    out
}

pub fn format_started(tracked_entities: usize, monitored_groups: usize) -> String {
    format!(
        "Monitoring started\n{}\nTracking {} entities in {} groups",
        RULE, tracked_entities, monitored_groups
    )
}
