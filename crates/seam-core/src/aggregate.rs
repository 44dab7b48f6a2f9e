//! Response aggregation
//!
//! Combines listings from several clusters into one response: concatenate,
//! sort, window by marker/limit, re-link pagination, and optionally strip
//! detail fields that a bare legacy listing would not have had. The merge
//! is an order-independent multiset union; everything downstream of the
//! concatenation is deterministic.

use std::cmp::Ordering;

use serde_json::{json, Map, Value};

use crate::config::ServiceType;
use crate::error::{Error, Result};
use crate::response::BackendResponse;

/// Top-level keys copied into the merged envelope from the first backend
/// that carries them.
const PASS_THROUGH_KEYS: [&str; 2] = ["schema", "first"];

/// Listing pagination parameters, decoded from the caller's query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingParams {
    /// 0 means unlimited
    pub limit: usize,
    pub marker: Option<String>,
    pub sort_key: Option<String>,
    pub descending: bool,
}

impl ListingParams {
    /// Decode `limit`, `marker`, and `sort=field:dir` (or the separate
    /// `sort_key`/`sort_dir` pair). An explicit direction other than
    /// `asc`/`desc` is an error; an absent direction means ascending.
    pub fn from_query(query: &[(String, String)]) -> Result<Self> {
        let get = |name: &str| {
            query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let limit = match get("limit") {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| Error::InvalidPagination(format!("limit={raw}")))?,
            None => 0,
        };
        let marker = get("marker").map(str::to_string);

        let mut sort_key = get("sort_key").map(str::to_string);
        let mut sort_dir = get("sort_dir").map(str::to_string);
        if sort_key.is_none() {
            if let Some(sort) = get("sort") {
                let (key, dir) = sort
                    .split_once(':')
                    .ok_or_else(|| Error::InvalidPagination(format!("sort={sort}")))?;
                sort_key = Some(key.to_string());
                sort_dir = Some(dir.to_string());
            }
        }

        let descending = match sort_dir.as_deref() {
            None | Some("asc") => false,
            Some("desc") => true,
            Some(other) => return Err(Error::InvalidSortDirection(other.to_string())),
        };

        Ok(Self {
            limit,
            marker,
            sort_key,
            descending,
        })
    }
}

/// Combine responses from several clusters into one listing envelope.
///
/// `request_url` is the caller-facing URL without its query string, used
/// verbatim when synthesizing pagination links. `version` selects the
/// allowed-key table for detail stripping.
pub fn merge(
    responses: &[BackendResponse],
    key: &str,
    service: ServiceType,
    version: Option<&str>,
    query: &[(String, String)],
    request_url: &str,
    strip_details: bool,
) -> Result<Value> {
    let params = ListingParams::from_query(query)?;

    let bodies: Vec<Value> = responses
        .iter()
        .filter_map(|r| serde_json::from_slice(&r.body).ok())
        .collect();

    // Error payloads and other non-object bodies carry no listing.
    let mut items: Vec<Value> = Vec::new();
    for body in &bodies {
        if let Some(list) = body.as_object().and_then(|o| o.get(key)).and_then(Value::as_array) {
            items.extend(list.iter().cloned());
        }
    }

    if let Some(sort_key) = &params.sort_key {
        items.sort_by(|a, b| {
            let ordering = compare_values(a.get(sort_key), b.get(sort_key));
            if params.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    let total = items.len();
    let start = match &params.marker {
        Some(marker) => items
            .iter()
            .position(|item| item.get("id").and_then(Value::as_str) == Some(marker.as_str()))
            // An unknown marker silently restarts the listing from the top.
            .map(|index| index + 1)
            .unwrap_or(0),
        None => 0,
    };
    let end = if params.limit > 0 {
        (start + params.limit).min(total)
    } else {
        total
    };
    let start = start.min(end);

    let mut window: Vec<Value> = items[start..end].to_vec();
    if strip_details && key == "volumes" {
        let allowed = detail_allowed_keys(version);
        for item in &mut window {
            if let Some(object) = item.as_object_mut() {
                object.retain(|k, _| allowed.contains(&k.as_str()));
            }
        }
    }

    let last_id = window
        .last()
        .and_then(|item| item.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut envelope = Map::new();
    envelope.insert(key.to_string(), Value::Array(window));

    for pass_key in PASS_THROUGH_KEYS {
        if envelope.contains_key(pass_key) {
            continue;
        }
        for body in &bodies {
            if let Some(value) = body.as_object().and_then(|o| o.get(pass_key)) {
                envelope.insert(pass_key.to_string(), value.clone());
                break;
            }
        }
    }

    if start > 0 {
        let without_marker: Vec<_> = query
            .iter()
            .filter(|(k, _)| k != "marker")
            .cloned()
            .collect();
        envelope.insert(
            "start".to_string(),
            Value::String(link_url(request_url, &without_marker)),
        );
    }

    if end < total {
        if let Some(last_id) = last_id {
            let mut with_marker: Vec<_> = query
                .iter()
                .filter(|(k, _)| k != "marker")
                .cloned()
                .collect();
            with_marker.push(("marker".to_string(), last_id));
            let url = link_url(request_url, &with_marker);
            match service {
                ServiceType::Image => {
                    envelope.insert("next".to_string(), Value::String(url));
                }
                ServiceType::Volume => {
                    envelope.insert(
                        format!("{key}_links"),
                        json!([{ "href": url, "rel": "next" }]),
                    );
                }
            }
        }
    }

    Ok(Value::Object(envelope))
}

/// Fields a bare (non-detail) volume listing is allowed to carry, keyed by
/// the API version the caller spoke.
fn detail_allowed_keys(version: Option<&str>) -> &'static [&'static str] {
    match version {
        Some("v1") => &["id", "display_name", "links"],
        _ => &["id", "name", "links"],
    }
}

fn link_url(request_url: &str, query: &[(String, String)]) -> String {
    match serde_urlencoded::to_string(query) {
        Ok(qs) if !qs.is_empty() => format!("{request_url}?{qs}"),
        _ => request_url.to_string(),
    }
}

/// Total order over JSON values for listing sorts: null < bool < number <
/// string < array < object; numbers compare as f64, strings
/// lexicographically. A missing sort field orders first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (x, y) => rank(x).cmp(&rank(y)),
    }
}
