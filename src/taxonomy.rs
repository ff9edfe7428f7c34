//! Canonical entity/action taxonomy and normalization (spec §4.4).
//!
//! All normalization happens at admission; the journal only ever stores
//! canonical forms. This keeps query paths free of alias handling.

use crate::error::ApiError;

/// Canonical entity types, as listed in spec §4.4.
pub const CANONICAL_ENTITIES: &[&str] = &[
    "issues",
    "logs",
    "handoffs",
    "comments",
    "sessions",
    "boards",
    "board_issue_positions",
    "work_sessions",
    "work_session_issues",
    "issue_files",
    "issue_dependencies",
    "git_snapshots",
    "issue_session_history",
    "notes",
];

/// Canonical action types, as listed in spec §3.
pub const CANONICAL_ACTIONS: &[&str] = &["create", "update", "delete", "soft_delete", "restore"];

/// Normalize a raw entity-type string (lowercased, alias-mapped) to its
/// canonical form. Returns `None` if the entity is not recognized at all
/// (not even as an alias).
pub fn normalize_entity(raw: &str) -> Option<&'static str> {
    let lowered = raw.to_lowercase();
    let canonical = match lowered.as_str() {
        "issue" | "issues" => "issues",
        "log" | "logs" => "logs",
        "handoff" | "handoffs" => "handoffs",
        "comment" | "comments" => "comments",
        "session" | "sessions" => "sessions",
        "board" | "boards" => "boards",
        "board_issue_position" | "board_issue_positions" | "board_position" => {
            "board_issue_positions"
        }
        "work_session" | "work_sessions" => "work_sessions",
        "work_session_issue" | "work_session_issues" => "work_session_issues",
        "issue_file" | "issue_files" | "file_link" => "issue_files",
        "issue_dependency" | "issue_dependencies" | "dependency" => "issue_dependencies",
        "git_snapshot" | "git_snapshots" => "git_snapshots",
        "issue_session_history" => "issue_session_history",
        "note" | "notes" => "notes",
        _ => return None,
    };
    Some(canonical)
}

/// Normalize a raw action-type string to its canonical form. Unlike entity
/// normalization, legacy action names always map to *something* (possibly
/// `update`, the fallback) — there is no "unrecognized action" outcome here;
/// validity is instead determined by the `(entity, action)` pair below.
pub fn normalize_action(raw: &str) -> &'static str {
    match raw.to_lowercase().as_str() {
        "create" | "handoff" | "board_create" | "board_add_issue" | "link_file"
        | "work_session_tag" => "create",
        "update" => "update",
        "delete" | "board_unposition" | "board_remove_issue" => "soft_delete",
        "soft_delete" => "soft_delete",
        "restore" => "restore",
        _ => "update",
    }
}

/// Returns whether `(entity, action)` is a valid combination once both sides
/// have already been normalized to their canonical forms.
///
/// The combination matrix: every canonical entity accepts `create`, `update`,
/// `soft_delete`, and `restore`. Pure append-only streams (`logs`,
/// `git_snapshots`, `issue_session_history`) are immutable once written —
/// they accept only `create`.
fn is_valid_combination(entity: &str, action: &str) -> bool {
    const APPEND_ONLY: &[&str] = &["logs", "git_snapshots", "issue_session_history"];
    if APPEND_ONLY.contains(&entity) {
        return action == "create";
    }
    CANONICAL_ACTIONS.contains(&action)
}

/// The outcome of normalizing one incoming event's entity/action pair.
pub struct Normalized {
    pub entity_type: &'static str,
    pub action_type: &'static str,
}

/// Normalize and validate one event's `(entity_type, action_type)`.
/// Invalid combinations are rejected at admission (spec §4.6 step 1), never
/// persisted — the caller is expected to put the event into `rejected`
/// rather than abort the whole push.
pub fn normalize(entity_type: &str, action_type: &str) -> Result<Normalized, ApiError> {
    let entity = normalize_entity(entity_type)
        .ok_or_else(|| ApiError::invalid_entity_type(entity_type))?;
    let action = normalize_action(action_type);
    if !is_valid_combination(entity, action) {
        return Err(ApiError::invalid_entity_action(entity, action));
    }
    Ok(Normalized {
        entity_type: entity,
        action_type: action,
    })
}

/// Validate a canonical entity type supplied directly by an admin filter
/// (spec §4.6 Admin reads: "Invalid entity filter ⇒ 400 invalid_entity_type").
pub fn validate_canonical_entity(entity: &str) -> Result<&'static str, ApiError> {
    CANONICAL_ENTITIES
        .iter()
        .find(|&&e| e == entity)
        .copied()
        .ok_or_else(|| ApiError::invalid_entity_type(entity))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_legacy_aliases() {
        assert_eq!(normalize_entity("dependency"), Some("issue_dependencies"));
        assert_eq!(normalize_entity("file_link"), Some("issue_files"));
        assert_eq!(normalize_entity("board_position"), Some("board_issue_positions"));
        assert_eq!(normalize_entity("ISSUE"), Some("issues"));
    }

    #[test]
    fn unknown_entity_is_none() {
        assert_eq!(normalize_entity("widgets"), None);
    }

    #[test]
    fn normalizes_legacy_actions() {
        assert_eq!(normalize_action("handoff"), "create");
        assert_eq!(normalize_action("board_add_issue"), "create");
        assert_eq!(normalize_action("delete"), "soft_delete");
        assert_eq!(normalize_action("board_unposition"), "soft_delete");
        assert_eq!(normalize_action("whatever_unknown"), "update");
    }

    #[test]
    fn append_only_entities_reject_non_create() {
        let err = normalize("logs", "update").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidEntityAction);
        assert!(normalize("logs", "create").is_ok());
    }

    #[test]
    fn ordinary_entity_accepts_full_matrix() {
        for action in CANONICAL_ACTIONS {
            assert!(normalize("issues", action).is_ok());
        }
    }

    #[test]
    fn unrecognized_entity_is_rejected() {
        let err = normalize("widgets", "create").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::InvalidEntityType);
    }
}
