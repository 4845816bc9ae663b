//! Route - タスクをどのノードに届けるか
//!
//! - `Any`: 共有の input queue。consume しているノードのどれか 1 つが処理する
//! - `Node(id)`: そのノード専用の queue（`node.<id>`）。他のノードは受け取らない
//! - `Broadcast`: broadcast exchange に bind された全ノードの queue へコピーを配る
//!
//! 返信は送信元ノードの reply queue（`node.<id>.replies`）に届く。

use std::fmt;
use std::str::FromStr;

/// Delivery target of a submitted task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Route {
    #[default]
    Any,
    Node(String),
    Broadcast,
}

impl Route {
    pub fn node(id: impl Into<String>) -> Self {
        Route::Node(id.into())
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::Any => f.write_str("any"),
            Route::Node(id) => write!(f, "node:{id}"),
            Route::Broadcast => f.write_str("broadcast"),
        }
    }
}

impl FromStr for Route {
    type Err = String;

    /// `any`, `broadcast` or `node:<id>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(Route::Any),
            "broadcast" => Ok(Route::Broadcast),
            _ => match s.strip_prefix("node:") {
                Some(id) if !id.trim().is_empty() => Ok(Route::Node(id.to_string())),
                _ => Err(format!("expected `any`, `broadcast` or `node:<id>`, got `{s}`")),
            },
        }
    }
}

/// Queue that only `node_id` consumes.
pub fn node_queue(node_id: &str) -> String {
    format!("node.{node_id}")
}

/// Queue that outcomes addressed back to `node_id` land on.
pub fn reply_queue(node_id: &str) -> String {
    format!("node.{node_id}.replies")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::any("any", Route::Any)]
    #[case::broadcast("broadcast", Route::Broadcast)]
    #[case::node("node:worker-2", Route::node("worker-2"))]
    fn routes_parse_and_print(#[case] raw: &str, #[case] route: Route) {
        assert_eq!(raw.parse::<Route>().unwrap(), route);
        assert_eq!(route.to_string(), raw);
    }

    #[rstest]
    #[case::empty_node("node:")]
    #[case::unknown("everyone")]
    fn bad_routes_are_rejected(#[case] raw: &str) {
        assert!(raw.parse::<Route>().is_err());
    }

    #[test]
    fn queue_names_follow_the_node_id() {
        assert_eq!(node_queue("host-1"), "node.host-1");
        assert_eq!(reply_queue("host-1"), "node.host-1.replies");
    }
}
