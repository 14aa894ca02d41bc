//! Maps server-originated messages back to the turn that produced them.
//!
//! Explicit turn ids in the payload are preferred. Messages without a usable
//! hint go to the most recently started turn that is still running. That
//! fallback is a heuristic: with two turns running and hint-less messages
//! interleaved, attribution can be wrong, so such routes are marked
//! `lowConfidence` in the event log.

use serde::Serialize;
use serde_json::Value;

use crate::turns::{TurnStatus, TurnTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteVia {
    Explicit,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    pub via: RouteVia,
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Route {
    pub(crate) turn_id: String,
    pub(crate) routing: Routing,
}

const TOP_LEVEL_HINT_KEYS: [&str; 3] = ["turnId", "turn_id", "id"];
const NESTED_HINT_KEYS: [&str; 2] = ["id", "turnId"];

/// Candidate turn ids in priority order: top-level `turnId`, `turn_id`,
/// `id`, then `turn.id`, `turn.turnId`.
pub fn turn_hints(params: &Value) -> Vec<String> {
    let top_level = TOP_LEVEL_HINT_KEYS
        .iter()
        .filter_map(|key| params.get(*key));
    let nested = params
        .get("turn")
        .into_iter()
        .flat_map(|turn| NESTED_HINT_KEYS.iter().filter_map(move |key| turn.get(*key)));

    top_level.chain(nested).filter_map(hint_string).collect()
}

pub fn extract_turn_hint(params: &Value) -> Option<String> {
    turn_hints(params).into_iter().next()
}

fn hint_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub(crate) fn route(turns: &TurnTable, params: &Value) -> Option<Route> {
    for hint in turn_hints(params) {
        if let Some(turn_id) = resolve_hint(turns, &hint) {
            return Some(Route {
                turn_id,
                routing: Routing {
                    via: RouteVia::Explicit,
                    low_confidence: false,
                },
            });
        }
    }

    let running = turns.running_ids();
    let turn_id = latest_running(turns)?;
    Some(Route {
        turn_id,
        routing: Routing {
            via: RouteVia::Fallback,
            low_confidence: running.len() > 1,
        },
    })
}

/// Local turn ids first, then protocol turn ids.
pub(crate) fn resolve_hint(turns: &TurnTable, hint: &str) -> Option<String> {
    if turns.contains(hint) {
        return Some(hint.to_string());
    }
    turns.turn_for_protocol_id(hint).map(ToOwned::to_owned)
}

pub(crate) fn latest_running(turns: &TurnTable) -> Option<String> {
    turns
        .entries()
        .filter(|entry| entry.status() == TurnStatus::Running)
        .max_by_key(|entry| entry.created_seq())
        .map(|entry| entry.turn_id().to_string())
}
