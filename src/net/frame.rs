//! Frame bodies multiplexed over the tunnel stream.
//!
//! The stream carries three kinds of frames, correlated by a per-call
//! snowflake ID: `Establish` identifies the private node opening the tunnel,
//! `MethodCall` asks the far side to execute a method, and `MethodReturn`
//! carries the opaque answer back to whoever is parked on the ID.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::proto::{FrameType, TunnelFrame};

/// An outbound frame that still needs a correlation ID attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Establish(Establish),
    MethodCall(MethodCall),
}

impl RelayFrame {
    pub fn frame_type(&self) -> FrameType {
        match self {
            RelayFrame::Establish(_) => FrameType::Establish,
            RelayFrame::MethodCall(_) => FrameType::MethodCall,
        }
    }

    pub fn body(&self) -> String {
        match self {
            RelayFrame::Establish(p) => serde_json::to_string(p),
            RelayFrame::MethodCall(p) => serde_json::to_string(p),
        }
        .expect("frame bodies are always serializable")
    }

    /// Serialize into a wire frame under the given correlation ID.
    pub fn into_tunnel_frame(self, id: i64) -> TunnelFrame {
        TunnelFrame {
            r#type: self.frame_type() as i32,
            id,
            body: self.body(),
        }
    }
}

/// First frame on every (re)connected tunnel: who is calling, and how long
/// the public side should wait before considering the caller gone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Establish {
    pub name: String,
    #[serde(default)]
    pub delay: i64,
}

/// "Please execute `method` on `node` and answer with my ID." The method
/// string may carry whitespace-separated arguments after the method name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodCall {
    pub node: String,
    pub method: String,
}

impl MethodCall {
    pub fn new(node: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            method: method.into(),
        }
    }

    /// Split into method name and arguments. Arguments are either
    /// whitespace-separated tokens or, when the remainder is a JSON array,
    /// decoded from it (used by methods whose arguments contain spaces).
    pub fn parts(&self) -> (&str, Vec<String>) {
        let trimmed = self.method.trim();
        let (name, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (trimmed, ""),
        };
        if rest.starts_with('[') {
            if let Ok(args) = serde_json::from_str::<Vec<String>>(rest) {
                return (name, args);
            }
        }
        (name, rest.split_whitespace().map(|s| s.to_string()).collect())
    }
}

pub fn parse_establish(body: &str) -> Result<Establish> {
    Ok(serde_json::from_str(body)?)
}

pub fn parse_method_call(body: &str) -> Result<MethodCall> {
    Ok(serde_json::from_str(body)?)
}

/// Build a return frame answering `id`.
pub fn method_return(id: i64, body: impl Into<String>) -> TunnelFrame {
    TunnelFrame {
        r#type: FrameType::MethodReturn as i32,
        id,
        body: body.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn establish_round_trips() {
        let p = Establish {
            name: "builder-7".to_string(),
            delay: 3,
        };
        let frame = RelayFrame::Establish(p.clone()).into_tunnel_frame(1);
        assert_eq!(frame.r#type, FrameType::Establish as i32);
        assert_eq!(parse_establish(&frame.body).unwrap(), p);
    }

    #[test]
    fn method_call_splits_args() {
        let p = MethodCall::new("a", "signalnotify build-done");
        let (name, args) = p.parts();
        assert_eq!(name, "signalnotify");
        assert_eq!(args, vec!["build-done".to_string()]);
    }

    #[test]
    fn method_call_without_args() {
        let p = MethodCall::new("a", "processlist");
        let (name, args) = p.parts();
        assert_eq!(name, "processlist");
        assert!(args.is_empty());
    }

    #[test]
    fn method_call_with_json_args() {
        let args = serde_json::to_string(&["cron", "*/5 * * * * *", "echo hi"]).unwrap();
        let p = MethodCall::new("a", format!("processspawn {args}"));
        let (name, args) = p.parts();
        assert_eq!(name, "processspawn");
        assert_eq!(args[1], "*/5 * * * * *");
        assert_eq!(args[2], "echo hi");
    }

    #[test]
    fn establish_tolerates_missing_delay() {
        let p = parse_establish(r#"{"name": "n"}"#).unwrap();
        assert_eq!(p.name, "n");
        assert_eq!(p.delay, 0);
    }
}
