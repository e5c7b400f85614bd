//! Socket.io-over-Engine.IO text frames, only as much as the agent needs.

/// Kind of event pushed by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// The server-side set of watched processes was edited.
    WatchSetChanged,
    Other(String),
}

/// One inbound text frame, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Engine.IO open packet (`0{...}`).
    Open,
    /// Engine.IO ping (`2`); must be answered with [`PONG`].
    Ping,
    /// Namespace connect acknowledgement (`40<ns>`).
    Handshake,
    Event(EventKind),
    Unknown,
}

pub const PONG: &str = "3";

impl ControlFrame {
    pub fn parse(text: &str, namespace: &str, refresh_marker: &str) -> Self {
        // Marker detection is a substring match on the raw frame, whatever
        // shape the event payload takes.
        if !refresh_marker.is_empty() && text.contains(refresh_marker) {
            return ControlFrame::Event(EventKind::WatchSetChanged);
        }
        if text == "2" {
            return ControlFrame::Ping;
        }
        if text.starts_with('0') && !text.starts_with("0/") {
            return ControlFrame::Open;
        }
        if let Some(rest) = text.strip_prefix("40") {
            return match strip_namespace(rest, namespace) {
                Some(tail) if tail.is_empty() || tail.starts_with(',') || tail.starts_with('{') => {
                    ControlFrame::Handshake
                }
                _ => ControlFrame::Unknown,
            };
        }
        if let Some(rest) = text.strip_prefix("42") {
            return strip_namespace(rest, namespace)
                .and_then(|tail| event_name(tail.strip_prefix(',').unwrap_or(tail)))
                .map(|name| ControlFrame::Event(EventKind::Other(name)))
                .unwrap_or(ControlFrame::Unknown);
        }
        ControlFrame::Unknown
    }
}

/// Strips `namespace` from the front of a socket.io packet body. The root
/// namespace is written as nothing at all.
fn strip_namespace<'a>(rest: &'a str, namespace: &str) -> Option<&'a str> {
    if namespace.is_empty() || namespace == "/" {
        return if rest.starts_with('/') { None } else { Some(rest) };
    }
    let tail = rest.strip_prefix(namespace)?;
    // `/metrics` must not match `/metrics2`.
    match tail.chars().next() {
        None | Some(',') | Some('{') | Some('[') => Some(tail),
        _ => None,
    }
}

fn event_name(payload: &str) -> Option<String> {
    let args: Vec<serde_json::Value> = serde_json::from_str(payload).ok()?;
    args.first()?.as_str().map(str::to_string)
}

/// Namespace join frame sent right after the transport opens.
pub fn handshake_frame(namespace: &str) -> String {
    if namespace.is_empty() || namespace == "/" {
        "40".to_string()
    } else {
        format!("40{namespace}")
    }
}

/// Outbound event frame carrying one JSON argument.
pub fn event_frame(namespace: &str, event: &str, payload: &serde_json::Value) -> String {
    let name = serde_json::Value::from(event);
    if namespace.is_empty() || namespace == "/" {
        format!("42[{name},{payload}]")
    } else {
        format!("42{namespace},[{name},{payload}]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "/metrics";
    const MARKER: &str = "selected-process-refresh";

    fn parse(text: &str) -> ControlFrame {
        ControlFrame::parse(text, NS, MARKER)
    }

    #[test]
    fn engine_io_packets() {
        assert_eq!(parse(r#"0{"sid":"abc","pingInterval":25000}"#), ControlFrame::Open);
        assert_eq!(parse("2"), ControlFrame::Ping);
    }

    #[test]
    fn namespace_ack_is_handshake() {
        assert_eq!(parse("40/metrics"), ControlFrame::Handshake);
        assert_eq!(parse(r#"40/metrics,{"sid":"x"}"#), ControlFrame::Handshake);
        assert_eq!(parse("40/other"), ControlFrame::Unknown);
        assert_eq!(parse("40/metrics2"), ControlFrame::Unknown);
    }

    #[test]
    fn refresh_marker_anywhere_is_watch_set_changed() {
        assert_eq!(
            parse(r#"42/metrics,["selected-process-refresh",{"pid":4}]"#),
            ControlFrame::Event(EventKind::WatchSetChanged)
        );
        assert_eq!(
            parse(r#"42/metrics,["update",{"kind":"selected-process-refresh"}]"#),
            ControlFrame::Event(EventKind::WatchSetChanged)
        );
    }

    #[test]
    fn other_events_keep_their_name() {
        assert_eq!(
            parse(r#"42/metrics,["config-changed",{}]"#),
            ControlFrame::Event(EventKind::Other("config-changed".to_string()))
        );
    }

    #[test]
    fn garbage_is_unknown() {
        assert_eq!(parse(""), ControlFrame::Unknown);
        assert_eq!(parse("42/metrics,not json"), ControlFrame::Unknown);
        assert_eq!(parse(r#"42["root-event"]"#), ControlFrame::Unknown);
        assert_eq!(parse("hello"), ControlFrame::Unknown);
    }

    #[test]
    fn root_namespace_frames() {
        assert_eq!(ControlFrame::parse("40", "/", MARKER), ControlFrame::Handshake);
        assert_eq!(
            ControlFrame::parse(r#"42["ev",1]"#, "/", MARKER),
            ControlFrame::Event(EventKind::Other("ev".to_string()))
        );
        assert_eq!(handshake_frame("/"), "40");
    }

    #[test]
    fn outbound_frames() {
        assert_eq!(handshake_frame(NS), "40/metrics");
        assert_eq!(
            event_frame(NS, "metric-data", &serde_json::json!({"cpu": 1.5})),
            r#"42/metrics,["metric-data",{"cpu":1.5}]"#
        );
    }
}
