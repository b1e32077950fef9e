//! Method-name dispatch shared by every path that carries a named call: the
//! `Call` RPC, the server side of the tunnel stream, and the client tunnel's
//! inbound handler. Targets naming this node run locally; anything else is
//! forwarded to the registered peer client, whichever transport it wraps.

use std::sync::Arc;

use crate::error::{FleetError, Result};
use crate::net::tunnel::LocalDispatcher;
use crate::net::PeerClient;
use crate::node::NodeState;
use crate::scheduler::{ProcessInfo, SpawnKind};

pub struct MethodDispatcher {
    state: Arc<NodeState>,
}

impl MethodDispatcher {
    pub fn new(state: Arc<NodeState>) -> Self {
        Self { state }
    }

    async fn local(&self, method: &str, args: &[String]) -> Result<String> {
        match method {
            "ping" => Ok(String::new()),
            "info" => Ok(self.state.name().to_string()),
            "mark" => {
                self.state.mark(arg(method, args, 0)?, arg(method, args, 1)?);
                Ok(String::new())
            }
            "signalwait" => Ok(self
                .state
                .signals()
                .wait(arg(method, args, 0)?)
                .to_string()),
            "signalnotify" => {
                self.state.signals().notify(arg(method, args, 0)?);
                Ok(String::new())
            }
            "signalinfo" => {
                let (status, exist) = self.state.signals().info(arg(method, args, 0)?);
                Ok(serde_json::to_string(&[status, exist])?)
            }
            "signallist" => Ok(serde_json::to_string(&self.state.signals().list())?),
            "signalclear" => {
                self.state.signals().clear(args);
                Ok(String::new())
            }
            "processlist" => Ok(serde_json::to_string(&self.state.scheduler().list())?),
            "processkill" => {
                self.state.scheduler().kill(parse_pid(method, args)?)?;
                Ok(String::new())
            }
            "processfind" => {
                let pid = parse_pid(method, args)?;
                let found: Vec<ProcessInfo> = if pid != 0 {
                    self.state.scheduler().find_by_pid(pid).into_iter().collect()
                } else {
                    self.state.scheduler().find_by_cmd(&args[1..].join(" "))
                };
                Ok(serde_json::to_string(&found)?)
            }
            "processspawn" => {
                let kind = parse_spawn_kind(arg(method, args, 0)?)?;
                let spec = arg(method, args, 1)?;
                let cmd = arg(method, args, 2)?;
                let pid = self.state.scheduler().spawn(kind, spec, cmd)?;
                Ok(pid.to_string())
            }
            _ => Err(FleetError::InvalidMethod(method.to_string())),
        }
    }

    async fn remote(
        &self,
        client: Arc<dyn PeerClient>,
        method: &str,
        args: &[String],
    ) -> Result<String> {
        match method {
            "ping" => {
                client.ping().await?;
                Ok(String::new())
            }
            "info" => client.info().await,
            "mark" => {
                client
                    .mark(arg(method, args, 0)?, arg(method, args, 1)?)
                    .await?;
                Ok(String::new())
            }
            "signalwait" => Ok(client
                .signal_wait(arg(method, args, 0)?)
                .await?
                .to_string()),
            "signalnotify" => {
                client.signal_notify(arg(method, args, 0)?).await?;
                Ok(String::new())
            }
            "signalinfo" => {
                let (status, exist) = client.signal_info(arg(method, args, 0)?).await?;
                Ok(serde_json::to_string(&[status, exist])?)
            }
            "signallist" => Ok(serde_json::to_string(&client.signal_list().await?)?),
            "signalclear" => {
                client.signal_clear(args).await?;
                Ok(String::new())
            }
            "processlist" => Ok(serde_json::to_string(&client.process_list().await?)?),
            "processkill" => {
                client.process_kill(parse_pid(method, args)?).await?;
                Ok(String::new())
            }
            "processfind" => {
                let pid = parse_pid(method, args)?;
                let found = client.process_find(pid, &args[1..].join(" ")).await?;
                Ok(serde_json::to_string(&found)?)
            }
            "processspawn" => {
                let kind = parse_spawn_kind(arg(method, args, 0)?)?;
                let pid = client
                    .process_spawn(kind, arg(method, args, 1)?, arg(method, args, 2)?)
                    .await?;
                Ok(pid.to_string())
            }
            _ => Err(FleetError::InvalidMethod(method.to_string())),
        }
    }
}

#[tonic::async_trait]
impl LocalDispatcher for MethodDispatcher {
    async fn dispatch(&self, node: &str, method: &str, args: &[String]) -> Result<String> {
        if node.is_empty() || node == self.state.name() {
            return self.local(method, args).await;
        }
        let client = self
            .state
            .registry()
            .node(node)
            .ok_or_else(|| FleetError::NodeNotFound(node.to_string()))?;
        self.remote(client, method, args).await
    }
}

fn arg<'a>(method: &str, args: &'a [String], i: usize) -> Result<&'a str> {
    args.get(i)
        .map(|s| s.as_str())
        .ok_or_else(|| FleetError::InvalidMethod(format!("{method}: missing argument {i}")))
}

fn parse_pid(method: &str, args: &[String]) -> Result<i64> {
    arg(method, args, 0)?
        .parse()
        .map_err(|_| FleetError::InvalidMethod(format!("{method}: bad pid")))
}

fn parse_spawn_kind(raw: &str) -> Result<SpawnKind> {
    match raw {
        "cron" => Ok(SpawnKind::Cron),
        "fs" => Ok(SpawnKind::Fs),
        "script" => Ok(SpawnKind::Script),
        other => Err(FleetError::InvalidMethod(format!(
            "unknown spawn kind: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::node::Node;
    use tokio_util::sync::CancellationToken;

    fn dispatcher(name: &str) -> MethodDispatcher {
        let config = NodeConfig::new(name, "127.0.0.1:0".parse().unwrap());
        let node = Node::new(config, CancellationToken::new()).unwrap();
        MethodDispatcher::new(node.state())
    }

    #[tokio::test]
    async fn info_returns_local_name() {
        let d = dispatcher("alpha");
        assert_eq!(d.dispatch("", "info", &[]).await.unwrap(), "alpha");
        assert_eq!(d.dispatch("alpha", "info", &[]).await.unwrap(), "alpha");
    }

    #[tokio::test]
    async fn signal_round_trip() {
        let d = dispatcher("alpha");
        let sig = vec!["build-done".to_string()];
        assert_eq!(d.dispatch("", "signalwait", &sig).await.unwrap(), "false");
        d.dispatch("", "signalnotify", &sig).await.unwrap();
        assert_eq!(d.dispatch("", "signalwait", &sig).await.unwrap(), "true");
        let info = d.dispatch("", "signalinfo", &sig).await.unwrap();
        assert_eq!(info, "[true,true]");
    }

    #[tokio::test]
    async fn unknown_method_is_invalid() {
        let d = dispatcher("alpha");
        assert!(matches!(
            d.dispatch("", "frobnicate", &[]).await,
            Err(FleetError::InvalidMethod(_))
        ));
    }

    #[tokio::test]
    async fn unknown_node_is_not_found() {
        let d = dispatcher("alpha");
        assert!(matches!(
            d.dispatch("ghost", "ping", &[]).await,
            Err(FleetError::NodeNotFound(_))
        ));
    }

    #[tokio::test]
    async fn spawn_kind_parsing() {
        assert_eq!(parse_spawn_kind("cron").unwrap(), SpawnKind::Cron);
        assert_eq!(parse_spawn_kind("fs").unwrap(), SpawnKind::Fs);
        assert_eq!(parse_spawn_kind("script").unwrap(), SpawnKind::Script);
        assert!(parse_spawn_kind("daemon").is_err());
    }
}
